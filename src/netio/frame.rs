//! Ethernet framing with 0, 1 or 2 IEEE 802.1Q tags, and the endpoint key
//! the relay dispatches on. smoltcp carries the layers above this; VLAN
//! tags are not part of its model so they are handled here.

use std::fmt;

use mac_address::MacAddress;
use serde::{Deserialize, Serialize};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const DEFAULT_VLAN_ETHERTYPE: u16 = 0x8100;

/// TPID values recognized as a VLAN tag on the receive path.
const VLAN_TPIDS: [u16; 3] = [0x8100, 0x88a8, 0x9100];

pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

/// One 802.1Q tag. `ethertype` is the TPID this tag is encoded with,
/// 0x8100 unless overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VlanTag {
    pub id: u16,
    pub ethertype: u16,
}

impl VlanTag {
    pub fn dot1q(id: u16) -> Self {
        Self {
            id,
            ethertype: DEFAULT_VLAN_ETHERTYPE,
        }
    }
}

/// Outer-to-inner tag stack. Empty means untagged.
pub type VlanStack = Vec<VlanTag>;

pub fn vlan_ids(stack: &[VlanTag]) -> Vec<u16> {
    stack.iter().map(|t| t.id).collect()
}

/// What the relay keys receive dispatch on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub mac: [u8; 6],
    pub vlan_ids: Vec<u16>,
    pub ethertype: u16,
}

impl EndpointKey {
    pub fn new(mac: MacAddress, vlans: &[VlanTag], ethertype: u16) -> Self {
        Self {
            mac: mac.bytes(),
            vlan_ids: vlan_ids(vlans),
            ethertype,
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", MacAddress::new(self.mac))?;
        for vid in &self.vlan_ids {
            write!(f, "|{vid}")?;
        }
        write!(f, "|{:#06x}", self.ethertype)
    }
}

/// A parsed inbound frame as handed to endpoint queues.
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub vlans: VlanStack,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl RxFrame {
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            mac: self.dst,
            vlan_ids: vlan_ids(&self.vlans),
            ethertype: self.ethertype,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst == BROADCAST_MAC
    }

    /// Group bit of the destination MAC; true for broadcast too.
    pub fn is_multicast(&self) -> bool {
        self.dst[0] & 0x01 != 0
    }
}

/// Serializes dst/src, the tag stack and the payload ethertype around an
/// L3 payload.
pub fn build_frame(
    dst: [u8; 6],
    src: [u8; 6],
    vlans: &[VlanTag],
    ethertype: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(14 + 4 * vlans.len() + payload.len());
    buf.extend_from_slice(&dst);
    buf.extend_from_slice(&src);
    for tag in vlans {
        buf.extend_from_slice(&tag.ethertype.to_be_bytes());
        buf.extend_from_slice(&(tag.id & 0x0fff).to_be_bytes());
    }
    buf.extend_from_slice(&ethertype.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Cheap header walk: MACs, then TPID-prefixed tags until the first
/// non-VLAN ethertype. Returns `None` on truncated input.
pub fn parse_frame(buf: &[u8]) -> Option<RxFrame> {
    if buf.len() < 14 {
        return None;
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&buf[0..6]);
    src.copy_from_slice(&buf[6..12]);

    let mut off = 12;
    let mut vlans = VlanStack::new();
    loop {
        if buf.len() < off + 2 {
            return None;
        }
        let etype = u16::from_be_bytes([buf[off], buf[off + 1]]);
        if VLAN_TPIDS.contains(&etype) {
            if buf.len() < off + 4 {
                return None;
            }
            let tci = u16::from_be_bytes([buf[off + 2], buf[off + 3]]);
            vlans.push(VlanTag {
                id: tci & 0x0fff,
                ethertype: etype,
            });
            off += 4;
        } else {
            off += 2;
            return Some(RxFrame {
                dst,
                src,
                vlans,
                ethertype: etype,
                payload: buf[off..].to_vec(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_round_trip() {
        let frame = build_frame(
            BROADCAST_MAC,
            [2, 0, 0, 0, 0, 1],
            &[],
            ETHERTYPE_IPV4,
            &[0x45, 0x00],
        );
        let rx = parse_frame(&frame).unwrap();
        assert!(rx.is_broadcast());
        assert_eq!(rx.ethertype, ETHERTYPE_IPV4);
        assert!(rx.vlans.is_empty());
        assert_eq!(rx.payload, vec![0x45, 0x00]);
    }

    #[test]
    fn qinq_round_trip_preserves_tag_order() {
        let stack = vec![VlanTag::dot1q(100), VlanTag::dot1q(200)];
        let frame = build_frame(
            [2, 0, 0, 0, 0, 2],
            [2, 0, 0, 0, 0, 1],
            &stack,
            ETHERTYPE_IPV6,
            &[0x60],
        );
        let rx = parse_frame(&frame).unwrap();
        assert_eq!(rx.vlans, stack);
        assert_eq!(rx.ethertype, ETHERTYPE_IPV6);
        assert_eq!(vlan_ids(&rx.vlans), vec![100, 200]);
    }

    #[test]
    fn key_matches_registration_form() {
        let mac = MacAddress::new([2, 0, 0, 0, 0, 9]);
        let stack = vec![VlanTag::dot1q(42)];
        let frame = build_frame(mac.bytes(), [2, 0, 0, 0, 0, 1], &stack, ETHERTYPE_IPV4, &[]);
        let rx = parse_frame(&frame).unwrap();
        assert_eq!(rx.key(), EndpointKey::new(mac, &stack, ETHERTYPE_IPV4));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(parse_frame(&[0u8; 10]).is_none());
    }

    #[test]
    fn multicast_group_bit() {
        let frame = build_frame(
            [0x33, 0x33, 0, 0, 0, 1],
            [2, 0, 0, 0, 0, 1],
            &[],
            ETHERTYPE_IPV6,
            &[],
        );
        let rx = parse_frame(&frame).unwrap();
        assert!(rx.is_multicast());
        assert!(!rx.is_broadcast());
    }
}
