//
// Copyright (c) The Ribfeed Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::path::PathBuf;

use ipnetwork::IpNetwork;
use serde::Deserialize;

// Per-target module configuration, received as a YAML document in
// SetupConfig.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleConfig {
    // Static routes inserted before the import loop starts, in order.
    pub routes: Vec<StaticRoute>,
    // BIRD import settings. An empty socket list disables the import loop.
    pub bird_import: BirdImportConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticRoute {
    pub prefix: IpNetwork,
    pub nexthop: IpAddr,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BirdImportConfig {
    // BIRD export feed sockets to read from.
    pub sockets: Vec<PathBuf>,
    // Maximum number of routes handed to a single update callback.
    pub batch_size: usize,
    // Read buffer capacity per feed socket.
    pub read_buffer_size: usize,
}

// ===== impl BirdImportConfig =====

impl Default for BirdImportConfig {
    fn default() -> BirdImportConfig {
        BirdImportConfig {
            sockets: Vec::new(),
            batch_size: 256,
            read_buffer_size: 64 * 1024,
        }
    }
}

// ===== tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_document() {
        let document = r#"
            routes:
              - prefix: 10.0.0.0/24
                nexthop: 192.0.2.1
              - prefix: 2001:db8::/48
                nexthop: 2001:db8:ffff::1
            bird_import:
              sockets:
                - /run/bird/export.sock
              batch_size: 16
        "#;

        let config: ModuleConfig = serde_yaml::from_str(document).unwrap();
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].prefix, "10.0.0.0/24".parse().unwrap());
        assert_eq!(config.routes[0].nexthop, "192.0.2.1".parse::<IpAddr>().unwrap());
        assert_eq!(
            config.bird_import.sockets,
            vec![PathBuf::from("/run/bird/export.sock")]
        );
        assert_eq!(config.bird_import.batch_size, 16);
        // Unset tuning parameters keep their defaults.
        assert_eq!(config.bird_import.read_buffer_size, 64 * 1024);
    }

    #[test]
    fn parse_empty_document() {
        let config: ModuleConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.routes.is_empty());
        assert!(config.bird_import.sockets.is_empty());
        assert_eq!(config.bird_import.batch_size, 256);
    }

    #[test]
    fn reject_unknown_fields() {
        let document = r#"
            routes: []
            metrics: true
        "#;

        assert!(serde_yaml::from_str::<ModuleConfig>(document).is_err());
    }

    #[test]
    fn reject_malformed_prefix() {
        let document = r#"
            routes:
              - prefix: not-a-prefix
                nexthop: 192.0.2.1
        "#;

        assert!(serde_yaml::from_str::<ModuleConfig>(document).is_err());
    }
}
