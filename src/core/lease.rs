//! Lease records. DHCP payloads are kept as raw wire bytes so persisted
//! files survive codec-library drift; everything else is plain data.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use dhcproto::{v4, v6, Decodable, Decoder, Encodable, Encoder};
use itertools::Itertools;
use mac_address::MacAddress;
use serde::{Deserialize, Serialize};

use super::errors::DhcpError;
use crate::conf::V6Mode;
use crate::netio::frame::VlanStack;

/// Stable client identity: MAC plus the VLAN ID stack. Persistence and
/// logging key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn from_parts(mac: MacAddress, vlan_ids: &[u16]) -> Self {
        if vlan_ids.is_empty() {
            Self(mac.to_string())
        } else {
            Self(format!(
                "{}|{}",
                mac,
                vlan_ids.iter().map(u16::to_string).join(".")
            ))
        }
    }

    #[cfg(test)]
    pub fn from_raw(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V4Lease {
    /// OFFER and ACK exactly as seen on the wire.
    pub offer: Vec<u8>,
    pub ack: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub vlans: VlanStack,
    /// Identification options echoed in the exchange and replayed on
    /// release: `(code, value)` pairs.
    pub id_options: Vec<(u8, Vec<u8>)>,
}

impl V4Lease {
    pub fn ack_msg(&self) -> Result<v4::Message, DhcpError> {
        Ok(v4::Message::decode(&mut Decoder::new(&self.ack))?)
    }

    pub fn mac(&self) -> Result<MacAddress, DhcpError> {
        let ack = self.ack_msg()?;
        let chaddr = ack.chaddr();
        if chaddr.len() < 6 {
            return Err(DhcpError::Codec("chaddr shorter than 6 bytes".into()));
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&chaddr[..6]);
        Ok(MacAddress::new(mac))
    }

    /// `yiaddr/prefixlen` from the ACK's subnet mask; a missing mask means
    /// a host route.
    pub fn addr_str(&self) -> Result<String, DhcpError> {
        let ack = self.ack_msg()?;
        let mask = match ack.opts().get(v4::OptionCode::SubnetMask) {
            Some(v4::DhcpOption::SubnetMask(m)) => *m,
            _ => Ipv4Addr::BROADCAST,
        };
        let prefix_len = u32::from(mask).count_ones();
        Ok(format!("{}/{}", ack.yiaddr(), prefix_len))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V6Lease {
    pub mac: [u8; 6],
    /// The full REPLY message, wire form.
    pub reply: Vec<u8>,
    pub mode: V6Mode,
    pub vlans: VlanStack,
    /// Identification options the client sent, wire form.
    pub id_options: Vec<u8>,
    /// Options the embedded relay added, wire form.
    pub relay_id_options: Vec<u8>,
}

impl V6Lease {
    pub fn reply_msg(&self) -> Result<v6::Message, DhcpError> {
        Ok(v6::Message::decode(&mut Decoder::new(&self.reply))?)
    }

    /// All IA_NA addresses as `addr/128` followed by all IA_PD prefixes as
    /// `prefix/len`.
    pub fn addr_strs(&self) -> Result<Vec<String>, DhcpError> {
        let reply = self.reply_msg()?;
        let mut out = Vec::new();
        for opt in reply.opts().iter() {
            match opt {
                v6::DhcpOption::IANA(iana) => {
                    for inner in iana.opts.iter() {
                        if let v6::DhcpOption::IAAddr(addr) = inner {
                            out.push(format!("{}/128", addr.addr));
                        }
                    }
                }
                v6::DhcpOption::IAPD(iapd) => {
                    for inner in iapd.opts.iter() {
                        if let v6::DhcpOption::IAPrefix(prefix) = inner {
                            out.push(format!("{}/{}", prefix.prefix_ip, prefix.prefix_len));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }

    /// RELEASE built from the stored reply: its Client-ID and Server-ID
    /// are mandatory, the leased IA_NA/IA_PD ride along unchanged.
    pub fn release_msg(&self, xid: [u8; 3]) -> Result<v6::Message, DhcpError> {
        let reply = self.reply_msg()?;
        let client_id = match reply.opts().get(v6::OptionCode::ClientId) {
            Some(v6::DhcpOption::ClientId(id)) => id.clone(),
            _ => return Err(DhcpError::MissingOption("client-id")),
        };
        let server_id = match reply.opts().get(v6::OptionCode::ServerId) {
            Some(v6::DhcpOption::ServerId(id)) => id.clone(),
            _ => return Err(DhcpError::MissingOption("server-id")),
        };

        let mut msg = v6::Message::new_with_id(v6::MessageType::Release, xid);
        msg.opts_mut().insert(v6::DhcpOption::ClientId(client_id));
        msg.opts_mut().insert(v6::DhcpOption::ServerId(server_id));
        msg.opts_mut().insert(v6::DhcpOption::ElapsedTime(0));
        for opt in reply.opts().iter() {
            if matches!(
                opt,
                v6::DhcpOption::IANA(_) | v6::DhcpOption::IAPD(_)
            ) {
                msg.opts_mut().insert(opt.clone());
            }
        }
        Ok(msg)
    }
}

/// What one client may hold; either half can be absent in a persisted
/// file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullStackLease {
    pub v4: Option<V4Lease>,
    pub v6: Option<V6Lease>,
}

pub fn encode_v6_msg(msg: &v6::Message) -> Result<Vec<u8>, DhcpError> {
    let mut buf = Vec::new();
    msg.encode(&mut Encoder::new(&mut buf))?;
    Ok(buf)
}

pub fn encode_v6_opts(opts: &v6::DhcpOptions) -> Result<Vec<u8>, DhcpError> {
    let mut buf = Vec::new();
    opts.encode(&mut Encoder::new(&mut buf))?;
    Ok(buf)
}

pub fn decode_v6_opts(bytes: &[u8]) -> Result<v6::DhcpOptions, DhcpError> {
    if bytes.is_empty() {
        return Ok(v6::DhcpOptions::new());
    }
    Ok(v6::DhcpOptions::decode(&mut Decoder::new(bytes))?)
}
