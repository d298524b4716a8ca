//! Answers neighbor solicitations for the synthetic link-local addresses
//! of the virtual clients, so the server side can resolve them without any
//! address ever being installed on the host.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;

use log::{debug, warn};
use mac_address::MacAddress;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, Icmpv6Message, Icmpv6Packet, Icmpv6Repr, IpAddress, IpProtocol, Ipv6Address,
    Ipv6Packet, Ipv6Repr, NdiscNeighborFlags, NdiscRepr,
};

use super::endpoint::L2Endpoint;
use super::frame::{RxFrame, VlanStack, ETHERTYPE_IPV6};
use super::relay::{PacketRelay, Registration, RelayError};

/// How a proxied address is reachable on the wire.
#[derive(Debug, Clone)]
pub struct L2Encap {
    pub mac: MacAddress,
    pub vlans: VlanStack,
}

pub struct NdpResponder {
    targets: Arc<HashMap<Ipv6Addr, L2Encap>>,
    ep: Arc<L2Endpoint>,
}

impl NdpResponder {
    /// Claims the relay's default endpoint and starts answering. Runs
    /// until the relay closes.
    pub fn spawn(
        relay: &dyn PacketRelay,
        targets: HashMap<Ipv6Addr, L2Encap>,
    ) -> Result<(), RelayError> {
        let chans = relay.register(Registration::default_receiver())?;
        let responder = NdpResponder {
            targets: Arc::new(targets),
            ep: Arc::new(L2Endpoint::from_default_channels(chans)),
        };
        tokio::spawn(responder.run());
        Ok(())
    }

    async fn run(self) {
        loop {
            let frame = match self.ep.read_pkt().await {
                Ok(f) => f,
                Err(_) => return,
            };
            let targets = self.targets.clone();
            let ep = self.ep.clone();
            // answered off the receive loop so a burst of solicitations
            // never backs up the default queue
            tokio::spawn(async move {
                if let Some((pkt, encap, dst_mac)) = build_advertisement(&targets, &frame) {
                    if let Err(e) = ep
                        .write_ip_pkt_to_from(
                            &pkt,
                            encap.mac.bytes(),
                            dst_mac,
                            &encap.vlans,
                            ETHERTYPE_IPV6,
                        )
                        .await
                    {
                        warn!("ndp responder failed to send advertisement: {e}");
                    }
                }
            });
        }
    }
}

/// Decodes a neighbor solicitation aimed at one of our targets and builds
/// the advertisement IP packet to send back. Returns the packet, the
/// owning client's encapsulation and the frame-level destination.
fn build_advertisement(
    targets: &HashMap<Ipv6Addr, L2Encap>,
    frame: &RxFrame,
) -> Option<(Vec<u8>, L2Encap, [u8; 6])> {
    if frame.ethertype != ETHERTYPE_IPV6 {
        return None;
    }
    let ip = Ipv6Packet::new_checked(frame.payload.as_slice()).ok()?;
    if ip.next_header() != IpProtocol::Icmpv6 {
        return None;
    }
    let icmp = Icmpv6Packet::new_checked(ip.payload()).ok()?;
    if icmp.msg_type() != Icmpv6Message::NeighborSolicit {
        return None;
    }
    let repr = NdiscRepr::parse(&icmp).ok()?;
    let NdiscRepr::NeighborSolicit { target_addr, .. } = repr else {
        return None;
    };

    let encap = targets.get(&Ipv6Addr::from(target_addr.0))?.clone();
    debug!(
        "answering neighbor solicitation for {} with {}",
        Ipv6Addr::from(target_addr.0),
        encap.mac
    );

    let adv = NdiscRepr::NeighborAdvert {
        // solicited, not a router, no override
        flags: NdiscNeighborFlags::SOLICITED,
        target_addr,
        lladdr: Some(EthernetAddress(encap.mac.bytes()).into()),
    };
    let icmp_repr = Icmpv6Repr::Ndisc(adv);
    let ip_repr = Ipv6Repr {
        src_addr: target_addr,
        dst_addr: ip.src_addr(),
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp_repr.buffer_len(),
        // neighbors drop advertisements with any other hop limit
        hop_limit: 255,
    };

    let mut buf = vec![0u8; ip_repr.buffer_len() + icmp_repr.buffer_len()];
    let mut ip_out = Ipv6Packet::new_unchecked(&mut buf);
    ip_repr.emit(&mut ip_out);
    let mut icmp_out = Icmpv6Packet::new_unchecked(ip_out.payload_mut());
    icmp_repr.emit(
        &IpAddress::Ipv6(ip_repr.src_addr),
        &IpAddress::Ipv6(ip_repr.dst_addr),
        &mut icmp_out,
        &ChecksumCapabilities::default(),
    );

    Some((buf, encap, frame.src))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netio::frame::{build_frame, VlanTag};
    use crate::utils::addr::lla_from_mac;

    fn solicitation(
        target: Ipv6Addr,
        src_ip: Ipv6Addr,
        src_mac: [u8; 6],
        vlans: &[VlanTag],
    ) -> Vec<u8> {
        let ns = NdiscRepr::NeighborSolicit {
            target_addr: Ipv6Address::from_bytes(&target.octets()),
            lladdr: Some(EthernetAddress(src_mac).into()),
        };
        let icmp_repr = Icmpv6Repr::Ndisc(ns);
        let ip_repr = Ipv6Repr {
            src_addr: Ipv6Address::from_bytes(&src_ip.octets()),
            dst_addr: Ipv6Address::from_bytes(&target.octets()),
            next_header: IpProtocol::Icmpv6,
            payload_len: icmp_repr.buffer_len(),
            hop_limit: 255,
        };
        let mut pkt = vec![0u8; ip_repr.buffer_len() + icmp_repr.buffer_len()];
        let mut ip_out = Ipv6Packet::new_unchecked(&mut pkt);
        ip_repr.emit(&mut ip_out);
        let mut icmp_out = Icmpv6Packet::new_unchecked(ip_out.payload_mut());
        icmp_repr.emit(
            &IpAddress::Ipv6(ip_repr.src_addr),
            &IpAddress::Ipv6(ip_repr.dst_addr),
            &mut icmp_out,
            &ChecksumCapabilities::default(),
        );
        build_frame(
            [0x33, 0x33, 0xff, 0, 0, 1],
            src_mac,
            vlans,
            ETHERTYPE_IPV6,
            &pkt,
        )
    }

    #[test]
    fn advertisement_shape_matches_contract() {
        let client_mac = MacAddress::new([2, 0, 0, 0, 0, 0x42]);
        let vlans = vec![VlanTag::dot1q(100), VlanTag::dot1q(200)];
        let target = lla_from_mac(client_mac);
        let mut targets = HashMap::new();
        targets.insert(
            target,
            L2Encap {
                mac: client_mac,
                vlans: vlans.clone(),
            },
        );

        let server_mac = [2, 0, 0, 0, 0, 0x01];
        let server_ip: Ipv6Addr = "fe80::1".parse().unwrap();
        let frame = solicitation(target, server_ip, server_mac, &vlans);
        let rx = crate::netio::frame::parse_frame(&frame).unwrap();

        let (pkt, encap, dst_mac) = build_advertisement(&targets, &rx).unwrap();
        assert_eq!(dst_mac, server_mac);
        assert_eq!(encap.mac, client_mac);
        assert_eq!(encap.vlans, vlans);

        let ip = Ipv6Packet::new_checked(pkt.as_slice()).unwrap();
        assert_eq!(ip.hop_limit(), 255);
        assert_eq!(Ipv6Addr::from(ip.src_addr().0), target);
        assert_eq!(Ipv6Addr::from(ip.dst_addr().0), server_ip);
        let icmp = Icmpv6Packet::new_checked(ip.payload()).unwrap();
        let repr = NdiscRepr::parse(&icmp).unwrap();
        match repr {
            NdiscRepr::NeighborAdvert {
                flags,
                target_addr,
                lladdr,
            } => {
                assert!(flags.contains(NdiscNeighborFlags::SOLICITED));
                assert!(!flags.contains(NdiscNeighborFlags::ROUTER));
                assert_eq!(Ipv6Addr::from(target_addr.0), target);
                assert_eq!(
                    lladdr.unwrap(),
                    EthernetAddress(client_mac.bytes()).into()
                );
            }
            other => panic!("expected neighbor advertisement, got {other:?}"),
        }
    }

    #[test]
    fn unknown_target_is_ignored() {
        let targets = HashMap::new();
        let frame = solicitation(
            "fe80::dead".parse().unwrap(),
            "fe80::1".parse().unwrap(),
            [2, 0, 0, 0, 0, 1],
            &[],
        );
        let rx = crate::netio::frame::parse_frame(&frame).unwrap();
        assert!(build_advertisement(&targets, &rx).is_none());
    }
}
