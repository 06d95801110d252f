//
// Copyright (c) The Ribfeed Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod backoff;
mod import;

pub mod bird;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod rib;

pub mod proto {
    #![allow(clippy::all)]
    tonic::include_proto!("ribfeed");
}
