//! DHCPv4 engine: DORA to acquire, RELEASE to give back. Talks through a
//! raw-UDP conn and never touches the wire below the packet-conn surface.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use chrono::Utc;
use dhcproto::v4;
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use log::debug;
use mac_address::MacAddress;
use rand::Rng;
use tokio::time::Instant;

use super::errors::DhcpError;
use super::lease::V4Lease;
use crate::netio::frame::VlanStack;
use crate::netio::rudp::{ConnError, PacketConn, RawUdpConn};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const OPT_CLIENT_IDENTIFIER: u8 = 61;
const OPT_RELAY_AGENT_INFO: u8 = 82;

pub struct Dhcp4Engine {
    conn: RawUdpConn,
    mac: MacAddress,
    options: Vec<v4::DhcpOption>,
    attempts: usize,
    timeout: Duration,
}

impl Dhcp4Engine {
    pub fn new(
        conn: RawUdpConn,
        mac: MacAddress,
        options: Vec<v4::DhcpOption>,
        attempts: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            conn,
            mac,
            options,
            attempts,
            timeout,
        }
    }

    /// Discover → Offer → Request → Ack. Every exchange retries up to the
    /// configured attempt count; a NAK fails the dial outright.
    pub async fn dial(&self, vlans: &VlanStack) -> Result<V4Lease, DhcpError> {
        let xid: u32 = rand::thread_rng().gen();

        let discover = self.build_discover(xid);
        let offer = self
            .exchange(&discover, v4::MessageType::Offer, xid)
            .await?;

        let server_id = match offer.opts().get(v4::OptionCode::ServerIdentifier) {
            Some(v4::DhcpOption::ServerIdentifier(ip)) => *ip,
            _ => return Err(DhcpError::MissingOption("server identifier")),
        };
        let offered_ip = offer.yiaddr();
        debug!(
            "{}: got OFFER of {} from {}",
            self.mac, offered_ip, server_id
        );

        let request = self.build_request(xid, server_id, offered_ip);
        let ack = self.exchange(&request, v4::MessageType::Ack, xid).await?;

        Ok(V4Lease {
            offer: offer.to_vec()?,
            ack: ack.to_vec()?,
            created_at: Utc::now(),
            vlans: vlans.clone(),
            id_options: self.id_options()?,
        })
    }

    /// One DHCPRELEASE, unicast to the server that granted the lease. No
    /// reply is defined for release, so a successful send is success.
    pub async fn release(&self, lease: &V4Lease) -> Result<(), DhcpError> {
        let ack = lease.ack_msg()?;
        let server_id = match ack.opts().get(v4::OptionCode::ServerIdentifier) {
            Some(v4::DhcpOption::ServerIdentifier(ip)) => *ip,
            _ => return Err(DhcpError::MissingOption("server identifier")),
        };

        let mut msg = v4::Message::default();
        msg.set_opcode(v4::Opcode::BootRequest);
        msg.set_xid(rand::thread_rng().gen());
        msg.set_ciaddr(ack.yiaddr());
        msg.set_chaddr(&self.mac.bytes());
        msg.opts_mut()
            .insert(v4::DhcpOption::MessageType(v4::MessageType::Release));
        msg.opts_mut()
            .insert(v4::DhcpOption::ServerIdentifier(server_id));
        for (code, value) in &lease.id_options {
            msg.opts_mut().insert(v4::DhcpOption::Unknown(
                v4::UnknownOption::new(v4::OptionCode::from(*code), value.clone()),
            ));
        }

        let dst = SocketAddr::new(IpAddr::V4(server_id), SERVER_PORT);
        self.conn.send_to(&msg.to_vec()?, dst).await?;
        Ok(())
    }

    fn build_discover(&self, xid: u32) -> v4::Message {
        let mut msg = v4::Message::default();
        msg.set_opcode(v4::Opcode::BootRequest);
        msg.set_xid(xid);
        msg.set_flags(v4::Flags::default().set_broadcast());
        msg.set_chaddr(&self.mac.bytes());
        msg.opts_mut()
            .insert(v4::DhcpOption::MessageType(v4::MessageType::Discover));
        msg.opts_mut()
            .insert(v4::DhcpOption::ParameterRequestList(vec![
                v4::OptionCode::SubnetMask,
                v4::OptionCode::Router,
                v4::OptionCode::DomainNameServer,
                v4::OptionCode::DomainName,
            ]));
        for opt in &self.options {
            msg.opts_mut().insert(opt.clone());
        }
        msg
    }

    fn build_request(&self, xid: u32, server_id: Ipv4Addr, requested: Ipv4Addr) -> v4::Message {
        let mut msg = v4::Message::default();
        msg.set_opcode(v4::Opcode::BootRequest);
        msg.set_xid(xid);
        msg.set_flags(v4::Flags::default().set_broadcast());
        msg.set_chaddr(&self.mac.bytes());
        msg.opts_mut()
            .insert(v4::DhcpOption::MessageType(v4::MessageType::Request));
        msg.opts_mut()
            .insert(v4::DhcpOption::ServerIdentifier(server_id));
        msg.opts_mut()
            .insert(v4::DhcpOption::RequestedIpAddress(requested));
        for opt in &self.options {
            msg.opts_mut().insert(opt.clone());
        }
        msg
    }

    /// Wire-form `(code, value)` pairs for the identification options this
    /// client dials with, kept in the lease for replay on release.
    fn id_options(&self) -> Result<Vec<(u8, Vec<u8>)>, DhcpError> {
        let mut out = Vec::new();
        for opt in &self.options {
            match opt {
                v4::DhcpOption::ClientIdentifier(value) => {
                    out.push((OPT_CLIENT_IDENTIFIER, value.clone()));
                }
                v4::DhcpOption::RelayAgentInformation(_) => {
                    let mut buf = Vec::new();
                    opt.encode(&mut Encoder::new(&mut buf))?;
                    // strip code and length, keep the value
                    if buf.len() >= 2 {
                        out.push((OPT_RELAY_AGENT_INFO, buf[2..].to_vec()));
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }

    async fn exchange(
        &self,
        msg: &v4::Message,
        expect: v4::MessageType,
        xid: u32,
    ) -> Result<v4::Message, DhcpError> {
        let dst = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), SERVER_PORT);
        let wire = msg.to_vec()?;
        for attempt in 0..self.attempts {
            self.conn.send_to(&wire, dst).await?;
            let deadline = Instant::now() + self.timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let (buf, _) = match self.conn.recv_from_deadline(remaining).await {
                    Ok(hit) => hit,
                    Err(ConnError::Timeout) => break,
                    Err(e) => return Err(e.into()),
                };
                let resp = match v4::Message::decode(&mut Decoder::new(&buf)) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                if resp.xid() != xid {
                    continue;
                }
                match resp.opts().get(v4::OptionCode::MessageType) {
                    Some(v4::DhcpOption::MessageType(t)) if *t == expect => return Ok(resp),
                    Some(v4::DhcpOption::MessageType(v4::MessageType::Nak)) => {
                        return Err(DhcpError::UnexpectedMessage(format!(
                            "NAK while waiting for {expect:?}"
                        )))
                    }
                    _ => continue,
                }
            }
            debug!(
                "{}: attempt {}/{} waiting for {:?} timed out",
                self.mac,
                attempt + 1,
                self.attempts,
                expect
            );
        }
        Err(DhcpError::ExchangeTimeout(self.attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netio::endpoint::L2Endpoint;
    use crate::netio::frame::{VlanTag, ETHERTYPE_IPV4};
    use crate::netio::relay::testutil::ChannelRelay;
    use dhcproto::v4::relay;

    fn conn(relay: &ChannelRelay, mac: [u8; 6], vlans: VlanStack, local: SocketAddr) -> RawUdpConn {
        let ep = L2Endpoint::new(relay, MacAddress::new(mac), vlans, ETHERTYPE_IPV4, true).unwrap();
        RawUdpConn::new(std::sync::Arc::new(ep), local, true)
    }

    /// Minimal responder: offers and acks whatever is asked, echoing xid.
    async fn fake_server(conn: RawUdpConn, yiaddr: Ipv4Addr) {
        let server_ip: Ipv4Addr = "192.0.2.254".parse().unwrap();
        loop {
            let (buf, _) = match conn.recv_from().await {
                Ok(hit) => hit,
                Err(_) => return,
            };
            let Ok(msg) = v4::Message::decode(&mut Decoder::new(&buf)) else {
                continue;
            };
            let mtype = match msg.opts().get(v4::OptionCode::MessageType) {
                Some(v4::DhcpOption::MessageType(t)) => *t,
                _ => continue,
            };
            let reply_type = match mtype {
                v4::MessageType::Discover => v4::MessageType::Offer,
                v4::MessageType::Request => v4::MessageType::Ack,
                _ => continue,
            };
            let mut reply = v4::Message::default();
            reply.set_opcode(v4::Opcode::BootReply);
            reply.set_xid(msg.xid());
            reply.set_yiaddr(yiaddr);
            reply.set_chaddr(msg.chaddr());
            reply
                .opts_mut()
                .insert(v4::DhcpOption::MessageType(reply_type));
            reply
                .opts_mut()
                .insert(v4::DhcpOption::ServerIdentifier(server_ip));
            reply.opts_mut().insert(v4::DhcpOption::SubnetMask(
                "255.255.255.0".parse().unwrap(),
            ));
            let dst = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), CLIENT_PORT);
            conn.send_to(&reply.to_vec().unwrap(), dst).await.unwrap();
        }
    }

    #[tokio::test]
    async fn dora_produces_a_lease() {
        let relay = ChannelRelay::new();
        let vlans = vec![VlanTag::dot1q(100)];
        let server_conn = conn(
            &relay,
            [2, 0, 0, 0, 0, 0xfe],
            vlans.clone(),
            "192.0.2.254:67".parse().unwrap(),
        );
        tokio::spawn(fake_server(server_conn, "192.0.2.10".parse().unwrap()));

        let mac = MacAddress::new([2, 0, 0, 0, 0, 1]);
        let engine = Dhcp4Engine::new(
            conn(&relay, mac.bytes(), vlans.clone(), "0.0.0.0:68".parse().unwrap()),
            mac,
            vec![],
            2,
            Duration::from_secs(1),
        );
        let lease = engine.dial(&vlans).await.unwrap();
        assert_eq!(lease.addr_str().unwrap(), "192.0.2.10/24");
        assert_eq!(lease.vlans, vlans);
    }

    #[tokio::test]
    async fn dial_times_out_without_a_server() {
        let relay = ChannelRelay::new();
        let mac = MacAddress::new([2, 0, 0, 0, 0, 2]);
        let engine = Dhcp4Engine::new(
            conn(&relay, mac.bytes(), vec![], "0.0.0.0:68".parse().unwrap()),
            mac,
            vec![],
            2,
            Duration::from_millis(30),
        );
        assert!(matches!(
            engine.dial(&VlanStack::new()).await,
            Err(DhcpError::ExchangeTimeout(2))
        ));
    }

    #[tokio::test]
    async fn release_echoes_identification_options() {
        let relay = ChannelRelay::new();
        let mac = MacAddress::new([2, 0, 0, 0, 0, 3]);
        let mut agent_info = relay::RelayAgentInformation::default();
        agent_info.insert(relay::RelayInfo::AgentRemoteId(b"rid-0".to_vec()));
        let engine = Dhcp4Engine::new(
            conn(&relay, mac.bytes(), vec![], "192.0.2.10:68".parse().unwrap()),
            mac,
            vec![
                v4::DhcpOption::ClientIdentifier(b"clnt-0".to_vec()),
                v4::DhcpOption::RelayAgentInformation(agent_info),
            ],
            1,
            Duration::from_millis(100),
        );

        // a listener on the server address observes the RELEASE
        let observer = conn(
            &relay,
            [2, 0, 0, 0, 0, 0xfe],
            vec![],
            "192.0.2.254:67".parse().unwrap(),
        );

        let lease = V4Lease {
            offer: vec![],
            ack: crate::core::lease::tests::sample_ack(
                "192.0.2.10".parse().unwrap(),
                "255.255.255.0".parse().unwrap(),
                mac.bytes(),
            ),
            created_at: Utc::now(),
            vlans: VlanStack::new(),
            id_options: engine.id_options().unwrap(),
        };
        engine.release(&lease).await.unwrap();

        let (buf, _) = observer
            .recv_from_deadline(Duration::from_secs(1))
            .await
            .unwrap();
        let msg = v4::Message::decode(&mut Decoder::new(&buf)).unwrap();
        assert!(matches!(
            msg.opts().get(v4::OptionCode::MessageType),
            Some(v4::DhcpOption::MessageType(v4::MessageType::Release))
        ));
        assert_eq!(msg.ciaddr(), "192.0.2.10".parse::<Ipv4Addr>().unwrap());
        // both identification options made it onto the wire
        assert!(msg.opts().get(v4::OptionCode::ClientIdentifier).is_some());
        assert!(msg
            .opts()
            .get(v4::OptionCode::RelayAgentInformation)
            .is_some());
    }
}
