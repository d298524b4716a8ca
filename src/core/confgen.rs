//! One-shot, deterministic expansion of the run configuration into N
//! per-client descriptors: stepped MACs, stepped VLAN stacks that dodge
//! the excluded set, and fully materialized identification options.

use anyhow::{anyhow, bail, Result};
use dhcproto::v4::{self, relay};
use dhcproto::v6;
use mac_address::MacAddress;

use super::dhcp6::duid_en;
use super::lease::ClientId;
use crate::conf::{Setup, BBF_ENTERPRISE_NUMBER};
use crate::netio::frame::{vlan_ids, VlanStack};
use crate::utils::addr::{inc_mac, inc_vlan_ids};

/// Everything one virtual client needs to know about itself.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub index: usize,
    pub mac: MacAddress,
    pub vlans: VlanStack,
    pub v4_options: Vec<v4::DhcpOption>,
    pub v6_options: Vec<v6::DhcpOption>,
    pub v6_relay_options: Vec<v6::DhcpOption>,
}

impl ClientConfig {
    pub fn client_id(&self) -> ClientId {
        ClientId::from_parts(self.mac, &vlan_ids(&self.vlans))
    }
}

/// `@ID` in identification templates becomes the client index.
pub fn expand_template(template: &str, index: usize) -> String {
    template.replace("@ID", &index.to_string())
}

const MAX_VLAN_REROLLS: usize = 10;

/// Steps the stack until it stops intersecting the excluded set, giving up
/// after a bounded number of attempts.
fn step_past_excluded(ids: &[u16], step: u16, excluded: &[u16]) -> Result<Vec<u16>> {
    let mut ids = ids.to_vec();
    for _ in 0..MAX_VLAN_REROLLS {
        ids = inc_vlan_ids(&ids, step)?;
        if !ids.iter().any(|id| excluded.contains(id)) {
            return Ok(ids);
        }
    }
    Err(anyhow!(
        "couldn't find a non-excluded VLAN stack within {MAX_VLAN_REROLLS} steps from {ids:?}"
    ))
}

pub fn gen_client_configs(setup: &Setup) -> Result<Vec<ClientConfig>> {
    let mut configs = Vec::with_capacity(setup.num_of_clients);
    let mut mac = setup.start_mac;
    let mut vlans = setup.start_vlans.clone();

    for index in 0..setup.num_of_clients {
        if index > 0 {
            mac = inc_mac(mac, setup.mac_step)?;
        }

        let stack_ids = vlan_ids(&vlans);
        let starts_excluded = stack_ids.iter().any(|id| setup.excluded_vlans.contains(id));
        if (!vlans.is_empty() && index > 0) || starts_excluded {
            let new_ids = step_past_excluded(&stack_ids, setup.vlan_step, &setup.excluded_vlans)?;
            if new_ids.len() != vlans.len() {
                bail!("VLAN stack changed shape while stepping");
            }
            for (tag, id) in vlans.iter_mut().zip(new_ids) {
                tag.id = id;
            }
        }

        let mut v4_options = Vec::new();
        let mut v6_options = Vec::new();
        let mut v6_relay_options = Vec::new();

        if let Some(vc) = &setup.vendor_class {
            v4_options.push(v4::DhcpOption::ClassIdentifier(vc.as_bytes().to_vec()));
            v6_options.push(v6::DhcpOption::VendorClass(v6::VendorClass {
                num: BBF_ENTERPRISE_NUMBER,
                data: vec![vc.as_bytes().to_vec()],
            }));
        }
        if let Some((code, value)) = &setup.custom_v4_option {
            v4_options.push(v4::DhcpOption::Unknown(v4::UnknownOption::new(
                v4::OptionCode::from(*code),
                value.clone(),
            )));
        }
        if let Some((code, value)) = &setup.custom_v6_option {
            v6_options.push(v6::DhcpOption::Unknown(v6::UnknownOption::new(
                v6::OptionCode::from(*code),
                value.clone(),
            )));
        }

        if setup.rid.is_some() || setup.cid.is_some() {
            let mut agent_info = relay::RelayAgentInformation::default();
            if let Some(rid) = &setup.rid {
                let expanded = expand_template(rid, index);
                agent_info.insert(relay::RelayInfo::AgentRemoteId(
                    expanded.as_bytes().to_vec(),
                ));
                let mut remote_id_data = BBF_ENTERPRISE_NUMBER.to_be_bytes().to_vec();
                remote_id_data.extend_from_slice(expanded.as_bytes());
                v6_relay_options.push(v6::DhcpOption::Unknown(v6::UnknownOption::new(
                    v6::OptionCode::RemoteId,
                    remote_id_data,
                )));
            }
            if let Some(cid) = &setup.cid {
                let expanded = expand_template(cid, index);
                agent_info.insert(relay::RelayInfo::AgentCircuitId(
                    expanded.as_bytes().to_vec(),
                ));
                v6_relay_options.push(v6::DhcpOption::InterfaceId(expanded.into_bytes()));
            }
            v4_options.push(v4::DhcpOption::RelayAgentInformation(agent_info));
        }

        if let Some(clnt_id) = &setup.clnt_id {
            let expanded = expand_template(clnt_id, index);
            v4_options.push(v4::DhcpOption::ClientIdentifier(
                expanded.as_bytes().to_vec(),
            ));
            v6_options.push(v6::DhcpOption::ClientId(duid_en(
                BBF_ENTERPRISE_NUMBER,
                expanded.as_bytes(),
            )));
        }

        configs.push(ClientConfig {
            index,
            mac,
            vlans: vlans.clone(),
            v4_options,
            v6_options,
            v6_relay_options,
        });
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{Cli, Setup};
    use clap::Parser;
    use std::collections::HashSet;

    fn setup_from(args: &[&str]) -> Setup {
        let mut full = vec!["dhcperf", "-i", "veth0", "--mac", "02:00:00:00:00:01"];
        full.extend_from_slice(args);
        Setup::from_cli(Cli::parse_from(full), None).unwrap()
    }

    #[test]
    fn client_ids_are_pairwise_distinct() {
        let setup = setup_from(&["-n", "50", "--vlan", "100"]);
        let configs = gen_client_configs(&setup).unwrap();
        let ids: HashSet<_> = configs.iter().map(|c| c.client_id()).collect();
        assert_eq!(ids.len(), 50);
    }

    #[test]
    fn macs_step_by_configured_amount() {
        let setup = setup_from(&["-n", "4", "--macstep", "3"]);
        let configs = gen_client_configs(&setup).unwrap();
        let macs: Vec<_> = configs.iter().map(|c| c.mac.bytes()).collect();
        assert_eq!(macs[0], [2, 0, 0, 0, 0, 1]);
        assert_eq!(macs[1], [2, 0, 0, 0, 0, 4]);
        assert_eq!(macs[2], [2, 0, 0, 0, 0, 7]);
        assert_eq!(macs[3], [2, 0, 0, 0, 0, 10]);
    }

    #[test]
    fn excluded_vlans_are_skipped() {
        let setup = setup_from(&["-n", "5", "--vlan", "100", "--excludedvlans", "101,103"]);
        let configs = gen_client_configs(&setup).unwrap();
        let vids: Vec<u16> = configs.iter().map(|c| c.vlans[0].id).collect();
        assert_eq!(vids, vec![100, 102, 104, 105, 106]);
        for v in vids {
            assert!(!setup.excluded_vlans.contains(&v));
        }
    }

    #[test]
    fn unreachable_vlan_space_fails_the_run() {
        // step 0 can never leave the excluded ID
        let setup = setup_from(&[
            "-n",
            "2",
            "--vlan",
            "100",
            "--vlanstep",
            "0",
            "--excludedvlans",
            "100",
        ]);
        assert!(gen_client_configs(&setup).is_err());
    }

    #[test]
    fn qinq_steps_both_tags() {
        let setup = setup_from(&["-n", "2", "--vlan", "200", "--svlan", "100"]);
        let configs = gen_client_configs(&setup).unwrap();
        assert_eq!(vlan_ids(&configs[0].vlans), vec![100, 200]);
        assert_eq!(vlan_ids(&configs[1].vlans), vec![101, 201]);
    }

    #[test]
    fn id_templates_expand_per_client() {
        let setup = setup_from(&["-n", "2", "--rid", "r-@ID", "--cid", "c-@ID"]);
        let configs = gen_client_configs(&setup).unwrap();
        for (i, cfg) in configs.iter().enumerate() {
            let agent_info = cfg
                .v4_options
                .iter()
                .find_map(|o| match o {
                    v4::DhcpOption::RelayAgentInformation(info) => Some(info),
                    _ => None,
                })
                .expect("option 82 present");
            assert!(matches!(
                agent_info.get(relay::RelayCode::AgentRemoteId),
                Some(relay::RelayInfo::AgentRemoteId(id)) if id == format!("r-{i}").as_bytes()
            ));
            let iface_id = cfg
                .v6_relay_options
                .iter()
                .find_map(|o| match o {
                    v6::DhcpOption::InterfaceId(id) => Some(id),
                    _ => None,
                })
                .expect("interface-id present");
            assert_eq!(iface_id, format!("c-{i}").as_bytes());
        }
    }

    #[test]
    fn clnt_id_becomes_duid_en() {
        let setup = setup_from(&["-n", "1", "--clntid", "host-@ID"]);
        let configs = gen_client_configs(&setup).unwrap();
        let duid = configs[0]
            .v6_options
            .iter()
            .find_map(|o| match o {
                v6::DhcpOption::ClientId(id) => Some(id.clone()),
                _ => None,
            })
            .expect("client-id present");
        // DUID-EN: type 2, BBF enterprise number, then the identifier
        assert_eq!(&duid[..2], &[0, 2]);
        assert_eq!(&duid[2..6], &BBF_ENTERPRISE_NUMBER.to_be_bytes());
        assert_eq!(&duid[6..], b"host-0");
    }

    #[test]
    fn vendor_class_lands_in_both_families() {
        let setup = setup_from(&["-n", "1", "--vc", "acme"]);
        let cfg = &gen_client_configs(&setup).unwrap()[0];
        assert!(cfg.v4_options.iter().any(|o| matches!(
            o,
            v4::DhcpOption::ClassIdentifier(v) if v == b"acme"
        )));
        assert!(cfg.v6_options.iter().any(|o| matches!(
            o,
            v6::DhcpOption::VendorClass(vc)
                if vc.num == BBF_ENTERPRISE_NUMBER && vc.data == vec![b"acme".to_vec()]
        )));
    }
}
