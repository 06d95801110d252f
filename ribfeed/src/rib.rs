//
// Copyright (c) The Ribfeed Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::proto;

// A route parsed from the BIRD export feed. This is the reader's internal
// representation; the wire encoding sent upstream is derived from it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RibRoute {
    pub prefix: IpNetwork,
    pub nexthop: IpAddr,
    pub preference: u32,
    pub metric: u32,
    // Set for withdrawals.
    pub to_remove: bool,
}

// ===== conversion functions =====

impl From<&RibRoute> for proto::RouteRecord {
    fn from(route: &RibRoute) -> proto::RouteRecord {
        proto::RouteRecord {
            prefix: route.prefix.to_string(),
            nexthop_addr: route.nexthop.to_string(),
            preference: route.preference,
            metric: route.metric,
            // Best-path selection isn't known at export time.
            best: false,
        }
    }
}

// ===== tests =====
