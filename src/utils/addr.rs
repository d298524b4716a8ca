//! Address arithmetic for generated client populations: 48-bit MAC
//! stepping, EUI-64 link-local derivation and VLAN ID stepping.

use std::net::Ipv6Addr;

use mac_address::MacAddress;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("MAC address arithmetic overflowed 48 bits")]
    MacOverflow,
    #[error("VLAN ID arithmetic left the valid range 0..=4095")]
    VlanOverflow,
}

/// Adds `step` to a MAC treated as a big-endian 48-bit integer. Wrapping
/// past 2^48 is an error, not a silent wrap.
pub fn inc_mac(mac: MacAddress, step: u64) -> Result<MacAddress, AddrError> {
    let bytes = mac.bytes();
    let mut val: u64 = 0;
    for b in bytes {
        val = (val << 8) | u64::from(b);
    }
    let val = val.checked_add(step).ok_or(AddrError::MacOverflow)?;
    if val > 0xffff_ffff_ffff {
        return Err(AddrError::MacOverflow);
    }
    let mut out = [0u8; 6];
    for (i, b) in out.iter_mut().enumerate() {
        *b = (val >> (8 * (5 - i))) as u8;
    }
    Ok(MacAddress::new(out))
}

/// EUI-64 link-local address for a MAC: fe80:: with the U/L bit flipped
/// and ff:fe spliced into the middle.
pub fn lla_from_mac(mac: MacAddress) -> Ipv6Addr {
    let m = mac.bytes();
    Ipv6Addr::from([
        0xfe,
        0x80,
        0,
        0,
        0,
        0,
        0,
        0,
        m[0] ^ 0x02,
        m[1],
        m[2],
        0xff,
        0xfe,
        m[3],
        m[4],
        m[5],
    ])
}

/// Solicited-node style mapping of an IPv6 multicast destination to its
/// 33:33:xx:xx:xx:xx MAC.
pub fn multicast_mac(addr: Ipv6Addr) -> MacAddress {
    let o = addr.octets();
    MacAddress::new([0x33, 0x33, o[12], o[13], o[14], o[15]])
}

/// Steps each VLAN ID by `step`, failing when any ID leaves 0..=4095.
pub fn inc_vlan_ids(ids: &[u16], step: u16) -> Result<Vec<u16>, AddrError> {
    ids.iter()
        .map(|&id| {
            let next = id.checked_add(step).ok_or(AddrError::VlanOverflow)?;
            if next > 4095 {
                return Err(AddrError::VlanOverflow);
            }
            Ok(next)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_step_carries_across_octets() {
        let mac = MacAddress::new([0x02, 0, 0, 0, 0, 0xff]);
        let next = inc_mac(mac, 1).unwrap();
        assert_eq!(next.bytes(), [0x02, 0, 0, 0, 0x01, 0x00]);
    }

    #[test]
    fn mac_step_rejects_48bit_wrap() {
        let mac = MacAddress::new([0xff; 6]);
        assert!(inc_mac(mac, 1).is_err());
    }

    #[test]
    fn lla_flips_universal_bit() {
        let mac = MacAddress::new([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let lla = lla_from_mac(mac);
        assert_eq!(
            lla,
            "fe80::11:22ff:fe33:4455".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn vlan_step_respects_upper_bound() {
        assert_eq!(inc_vlan_ids(&[100, 200], 1).unwrap(), vec![101, 201]);
        assert!(inc_vlan_ids(&[4095], 1).is_err());
    }

    #[test]
    fn multicast_mac_uses_low_four_octets() {
        let mac = multicast_mac("ff02::1:2".parse().unwrap());
        assert_eq!(mac.bytes(), [0x33, 0x33, 0x00, 0x00, 0x01, 0x02]);
    }
}
