//! Synthetic UDP over a virtual L2 endpoint. The DHCP engines and the
//! relay agent only see the [`PacketConn`] capability, so a raw-UDP conn,
//! the in-process pair conn and (in principle) a kernel socket are
//! interchangeable.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, Ipv6Address, Ipv6Packet, Ipv6Repr,
    UdpPacket, UdpRepr,
};
use thiserror::Error;

use super::endpoint::L2Endpoint;
use super::frame::BROADCAST_MAC;
use super::relay::RelayError;
use crate::utils::addr::multicast_mac;

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("read deadline exceeded")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("address family mismatch: {0}")]
    AddrFamily(SocketAddr),
    #[error("packet could not be encoded: {0}")]
    Encode(String),
}

impl From<RelayError> for ConnError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Timeout => ConnError::Timeout,
            _ => ConnError::Closed,
        }
    }
}

/// Minimal packet-conn capability shared by [`RawUdpConn`] and
/// [`PairConn`](super::pair::PairConn). Deadlines wrap `recv_from`, and a
/// `Timeout` result leaves the conn usable.
#[async_trait]
pub trait PacketConn: Send + Sync {
    fn local_addr(&self) -> SocketAddr;
    async fn send_to(&self, payload: &[u8], dst: SocketAddr) -> Result<(), ConnError>;
    async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), ConnError>;

    async fn recv_from_deadline(
        &self,
        deadline: Duration,
    ) -> Result<(Vec<u8>, SocketAddr), ConnError> {
        match tokio::time::timeout(deadline, self.recv_from()).await {
            Ok(r) => r,
            Err(_) => Err(ConnError::Timeout),
        }
    }
}

/// UDP/IP envelope over one L2 endpoint with a fixed local `IP:port`.
/// `accept_any` disables local-port filtering, needed where the server
/// side talks 67→68 or to a relay's 547. The endpoint is shared: a second
/// conn (e.g. a release conn bound to the leased address) can ride the
/// same registration.
pub struct RawUdpConn {
    ep: std::sync::Arc<L2Endpoint>,
    local: SocketAddr,
    accept_any: bool,
}

impl RawUdpConn {
    pub fn new(ep: std::sync::Arc<L2Endpoint>, local: SocketAddr, accept_any: bool) -> Self {
        Self {
            ep,
            local,
            accept_any,
        }
    }

    pub fn endpoint(&self) -> &std::sync::Arc<L2Endpoint> {
        &self.ep
    }

    /// Frame-level destination. Without ARP/ND resolution the conn maps
    /// IPv6 multicast onto its 33:33 group MAC and everything else onto
    /// broadcast, which is the point-to-point access topology this tool
    /// targets.
    fn dst_mac(dst: &SocketAddr) -> [u8; 6] {
        match dst.ip() {
            IpAddr::V6(v6) if v6.is_multicast() => multicast_mac(v6).bytes(),
            _ => BROADCAST_MAC,
        }
    }

    fn encode(&self, payload: &[u8], dst: SocketAddr) -> Result<Vec<u8>, ConnError> {
        let udp = UdpRepr {
            src_port: self.local.port(),
            dst_port: dst.port(),
        };
        let caps = ChecksumCapabilities::default();
        match (self.local.ip(), dst.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst_ip)) => {
                let src = Ipv4Address::from_bytes(&src.octets());
                let dst_ip = Ipv4Address::from_bytes(&dst_ip.octets());
                let ip = Ipv4Repr {
                    src_addr: src,
                    dst_addr: dst_ip,
                    next_header: IpProtocol::Udp,
                    payload_len: udp.header_len() + payload.len(),
                    hop_limit: 64,
                };
                let mut buf = vec![0u8; ip.buffer_len() + udp.header_len() + payload.len()];
                let mut ip_pkt = Ipv4Packet::new_unchecked(&mut buf);
                ip.emit(&mut ip_pkt, &caps);
                let mut udp_pkt = UdpPacket::new_unchecked(ip_pkt.payload_mut());
                udp.emit(
                    &mut udp_pkt,
                    &IpAddress::Ipv4(src),
                    &IpAddress::Ipv4(dst_ip),
                    payload.len(),
                    |b| b.copy_from_slice(payload),
                    &caps,
                );
                Ok(buf)
            }
            (IpAddr::V6(src), IpAddr::V6(dst_ip)) => {
                let src = Ipv6Address::from_bytes(&src.octets());
                let dst_ip = Ipv6Address::from_bytes(&dst_ip.octets());
                let ip = Ipv6Repr {
                    src_addr: src,
                    dst_addr: dst_ip,
                    next_header: IpProtocol::Udp,
                    payload_len: udp.header_len() + payload.len(),
                    hop_limit: 64,
                };
                let mut buf = vec![0u8; ip.buffer_len() + udp.header_len() + payload.len()];
                let mut ip_pkt = Ipv6Packet::new_unchecked(&mut buf);
                ip.emit(&mut ip_pkt);
                let mut udp_pkt = UdpPacket::new_unchecked(ip_pkt.payload_mut());
                udp.emit(
                    &mut udp_pkt,
                    &IpAddress::Ipv6(src),
                    &IpAddress::Ipv6(dst_ip),
                    payload.len(),
                    |b| b.copy_from_slice(payload),
                    &caps,
                );
                Ok(buf)
            }
            _ => Err(ConnError::AddrFamily(dst)),
        }
    }

    /// Pulls UDP out of an inbound IP packet, or `None` when it is not
    /// UDP for us.
    fn decode(&self, payload: &[u8]) -> Option<(Vec<u8>, SocketAddr)> {
        match self.local.ip() {
            IpAddr::V4(_) => {
                let ip = Ipv4Packet::new_checked(payload).ok()?;
                if ip.next_header() != IpProtocol::Udp {
                    return None;
                }
                let udp = UdpPacket::new_checked(ip.payload()).ok()?;
                if !self.accept_any && udp.dst_port() != self.local.port() {
                    return None;
                }
                let src = SocketAddr::new(
                    IpAddr::V4(std::net::Ipv4Addr::from(ip.src_addr().0)),
                    udp.src_port(),
                );
                Some((udp.payload().to_vec(), src))
            }
            IpAddr::V6(_) => {
                let ip = Ipv6Packet::new_checked(payload).ok()?;
                if ip.next_header() != IpProtocol::Udp {
                    return None;
                }
                let udp = UdpPacket::new_checked(ip.payload()).ok()?;
                if !self.accept_any && udp.dst_port() != self.local.port() {
                    return None;
                }
                let src = SocketAddr::new(
                    IpAddr::V6(std::net::Ipv6Addr::from(ip.src_addr().0)),
                    udp.src_port(),
                );
                Some((udp.payload().to_vec(), src))
            }
        }
    }
}

#[async_trait]
impl PacketConn for RawUdpConn {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn send_to(&self, payload: &[u8], dst: SocketAddr) -> Result<(), ConnError> {
        let pkt = self.encode(payload, dst)?;
        self.ep
            .send_ip_pkt(Self::dst_mac(&dst), &pkt)
            .await
            .map_err(ConnError::from)
    }

    async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), ConnError> {
        loop {
            let frame = self.ep.read_pkt().await?;
            match self.decode(&frame.payload) {
                Some(hit) => return Ok(hit),
                None => {
                    debug!("rudp {}: skipping non-matching packet", self.local);
                }
            }
        }
    }
}
