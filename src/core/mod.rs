pub mod client;
pub mod confgen;
pub mod dhcp4;
pub mod dhcp6;
pub mod errors;
pub mod lease;
pub mod relay6;
pub mod sched;
pub mod store;
pub mod summary;

use std::collections::HashMap;
use std::net::Ipv6Addr;

use crate::netio::ndp::L2Encap;
use crate::utils::addr::lla_from_mac;

/// The NDP responder's target table: every client's link-local address
/// mapped to its MAC and VLAN stack.
pub fn ndp_targets(configs: &[confgen::ClientConfig]) -> HashMap<Ipv6Addr, L2Encap> {
    configs
        .iter()
        .map(|cfg| {
            (
                lla_from_mac(cfg.mac),
                L2Encap {
                    mac: cfg.mac,
                    vlans: cfg.vlans.clone(),
                },
            )
        })
        .collect()
}
