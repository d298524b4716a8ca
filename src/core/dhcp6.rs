//! DHCPv6 engine: Solicit → Advertise → Request → Reply, with release from
//! a stored reply and the optional router-solicitation gate that waits for
//! the managed flag before dialing.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use dhcproto::v6;
use dhcproto::{Decodable, Decoder};
use log::debug;
use mac_address::MacAddress;
use rand::Rng;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, Icmpv6Packet, Icmpv6Repr, IpAddress, IpProtocol, Ipv6Packet, Ipv6Repr,
    NdiscRepr,
};

use super::errors::DhcpError;
use super::lease::{encode_v6_msg, V6Lease};
use crate::netio::endpoint::L2Endpoint;
use crate::netio::rudp::{ConnError, PacketConn};
use crate::utils::addr::multicast_mac;

pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// ORO contents for every Solicit/Request: DNS servers and domain search
/// list.
const ORO_CODES: [u16; 2] = [23, 24];

/// DUID-LLT: hardware type Ethernet, seconds since the DUID epoch
/// (2000-01-01), link-layer address.
pub fn duid_llt(mac: MacAddress) -> Vec<u8> {
    let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    let elapsed = (Utc::now() - epoch).num_seconds() as u32;
    let mut duid = Vec::with_capacity(14);
    duid.extend_from_slice(&1u16.to_be_bytes());
    duid.extend_from_slice(&1u16.to_be_bytes());
    duid.extend_from_slice(&elapsed.to_be_bytes());
    duid.extend_from_slice(&mac.bytes());
    duid
}

/// DUID-EN: enterprise number plus an opaque identifier.
pub fn duid_en(enterprise: u32, identifier: &[u8]) -> Vec<u8> {
    let mut duid = Vec::with_capacity(6 + identifier.len());
    duid.extend_from_slice(&2u16.to_be_bytes());
    duid.extend_from_slice(&enterprise.to_be_bytes());
    duid.extend_from_slice(identifier);
    duid
}

/// Checks a server response against what the client was told to need.
fn verify_assignment(msg: &v6::Message, need_na: bool, need_pd: bool) -> Result<(), DhcpError> {
    if need_na {
        let has_addr = msg.opts().iter().any(|opt| {
            matches!(opt, v6::DhcpOption::IANA(iana)
                if iana.opts.iter().any(|o| matches!(o, v6::DhcpOption::IAAddr(_))))
        });
        if !has_addr {
            return Err(DhcpError::MissingOption("IA_NA address"));
        }
    }
    if need_pd {
        let has_prefix = msg.opts().iter().any(|opt| {
            matches!(opt, v6::DhcpOption::IAPD(iapd)
                if iapd.opts.iter().any(|o| matches!(o, v6::DhcpOption::IAPrefix(_))))
        });
        if !has_prefix {
            return Err(DhcpError::MissingOption("IA_PD prefix"));
        }
    }
    Ok(())
}

pub struct Dhcp6Engine {
    conn: Box<dyn PacketConn>,
    mac: MacAddress,
    options: Vec<v6::DhcpOption>,
    need_na: bool,
    need_pd: bool,
    attempts: usize,
    timeout: Duration,
}

impl Dhcp6Engine {
    pub fn new(
        conn: Box<dyn PacketConn>,
        mac: MacAddress,
        options: Vec<v6::DhcpOption>,
        need_na: bool,
        need_pd: bool,
        attempts: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            conn,
            mac,
            options,
            need_na,
            need_pd,
            attempts,
            timeout,
        }
    }

    /// Full SARR. Returns the final REPLY in wire form, already verified
    /// against the NA/PD requirements.
    pub async fn dial(&self) -> Result<Vec<u8>, DhcpError> {
        let solicit = self.build_solicit();
        let advertise = self
            .exchange(&solicit, v6::MessageType::Advertise)
            .await?;
        verify_assignment(&advertise, self.need_na, self.need_pd)?;

        let request = request_from_advertise(&advertise)?;
        let reply = self.exchange(&request, v6::MessageType::Reply).await?;
        verify_assignment(&reply, self.need_na, self.need_pd)?;
        debug!("{}: DHCPv6 reply verified", self.mac);
        encode_v6_msg(&reply)
    }

    /// One release round trip; the caller owns the retry policy.
    pub async fn release(&self, lease: &V6Lease) -> Result<(), DhcpError> {
        let xid: [u8; 3] = rand::thread_rng().gen();
        let release = lease.release_msg(xid)?;
        self.exchange(&release, v6::MessageType::Reply).await?;
        Ok(())
    }

    fn build_solicit(&self) -> v6::Message {
        let xid: [u8; 3] = rand::thread_rng().gen();
        let mut msg = v6::Message::new_with_id(v6::MessageType::Solicit, xid);
        msg.opts_mut()
            .insert(v6::DhcpOption::ClientId(duid_llt(self.mac)));
        msg.opts_mut().insert(v6::DhcpOption::ElapsedTime(0));
        msg.opts_mut().insert(v6::DhcpOption::ORO(v6::ORO {
            opts: ORO_CODES.iter().map(|&c| v6::OptionCode::from(c)).collect(),
        }));
        if self.need_na {
            msg.opts_mut().insert(v6::DhcpOption::IANA(v6::IANA {
                id: 0,
                t1: 0,
                t2: 0,
                opts: v6::DhcpOptions::new(),
            }));
        }
        if self.need_pd {
            msg.opts_mut().insert(v6::DhcpOption::IAPD(v6::IAPD {
                id: 1,
                t1: 0,
                t2: 0,
                opts: v6::DhcpOptions::new(),
            }));
        }
        for opt in &self.options {
            msg.opts_mut().insert(opt.clone());
        }
        msg
    }

    async fn exchange(
        &self,
        msg: &v6::Message,
        expect: v6::MessageType,
    ) -> Result<v6::Message, DhcpError> {
        let dst = SocketAddr::new(
            IpAddr::V6(ALL_DHCP_RELAY_AGENTS_AND_SERVERS),
            v6::SERVER_PORT,
        );
        let wire = encode_v6_msg(msg)?;
        for attempt in 0..self.attempts {
            self.conn.send_to(&wire, dst).await?;
            let deadline = tokio::time::Instant::now() + self.timeout;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let (buf, _) = match self.conn.recv_from_deadline(remaining).await {
                    Ok(hit) => hit,
                    Err(ConnError::Timeout) => break,
                    Err(e) => return Err(e.into()),
                };
                let resp = match v6::Message::decode(&mut Decoder::new(&buf)) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                if resp.xid() != msg.xid() || resp.msg_type() != expect {
                    continue;
                }
                return Ok(resp);
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

/// REQUEST built from an ADVERTISE: identity comes from the advertise and
/// both are mandatory; the advertised IA_NA/IA_PD and any vendor class
/// ride along.
pub fn request_from_advertise(adv: &v6::Message) -> Result<v6::Message, DhcpError> {
    if adv.msg_type() != v6::MessageType::Advertise {
        return Err(DhcpError::UnexpectedMessage(format!(
            "{:?} instead of Advertise",
            adv.msg_type()
        )));
    }
    let mut msg = v6::Message::new_with_id(v6::MessageType::Request, adv.xid());
    match adv.opts().get(v6::OptionCode::ClientId) {
        Some(opt @ v6::DhcpOption::ClientId(_)) => msg.opts_mut().insert(opt.clone()),
        _ => return Err(DhcpError::MissingOption("client-id")),
    }
    match adv.opts().get(v6::OptionCode::ServerId) {
        Some(opt @ v6::DhcpOption::ServerId(_)) => msg.opts_mut().insert(opt.clone()),
        _ => return Err(DhcpError::MissingOption("server-id")),
    }
    msg.opts_mut().insert(v6::DhcpOption::ElapsedTime(0));
    for opt in adv.opts().iter() {
        if matches!(
            opt,
            v6::DhcpOption::IANA(_) | v6::DhcpOption::IAPD(_) | v6::DhcpOption::VendorClass(_)
        ) {
            msg.opts_mut().insert(opt.clone());
        }
    }
    msg.opts_mut().insert(v6::DhcpOption::ORO(v6::ORO {
        opts: ORO_CODES.iter().map(|&c| v6::OptionCode::from(c)).collect(),
    }));
    Ok(msg)
}

/// Sends a Router Solicitation from the client's LLA and waits for a
/// Router Advertisement carrying the managed flag. Bounded by
/// `attempts × wait`.
pub async fn wait_managed_ra(
    ep: &L2Endpoint,
    mac: MacAddress,
    attempts: usize,
    wait: Duration,
) -> Result<(), DhcpError> {
    let lla = crate::utils::addr::lla_from_mac(mac);
    let rs = build_router_solicitation(mac, lla);
    for _ in 0..attempts {
        ep.send_ip_pkt(multicast_mac(ALL_ROUTERS).bytes(), &rs)
            .await?;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let frame = match ep.read_pkt_deadline(remaining).await {
                Ok(f) => f,
                Err(crate::netio::relay::RelayError::Timeout) => break,
                Err(e) => return Err(e.into()),
            };
            if ra_has_managed_flag(&frame.payload) {
                debug!("{mac}: router advertisement has the managed flag");
                return Ok(());
            }
        }
    }
    Err(DhcpError::NotManaged)
}

fn build_router_solicitation(mac: MacAddress, lla: Ipv6Addr) -> Vec<u8> {
    let rs = NdiscRepr::RouterSolicit {
        lladdr: Some(EthernetAddress(mac.bytes()).into()),
    };
    let icmp_repr = Icmpv6Repr::Ndisc(rs);
    let ip_repr = Ipv6Repr {
        src_addr: smoltcp::wire::Ipv6Address::from_bytes(&lla.octets()),
        dst_addr: smoltcp::wire::Ipv6Address::from_bytes(&ALL_ROUTERS.octets()),
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp_repr.buffer_len(),
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
    buf
}

/// Router advertisements are inspected bytewise: real RAs carry option
/// zoos (RDNSS and friends) that a strict NDISC parser rejects, and all we
/// need is the type and the flags byte.
fn ra_has_managed_flag(ip_pkt: &[u8]) -> bool {
    const ICMPV6_ROUTER_ADVERT: u8 = 134;
    const FLAG_MANAGED: u8 = 0x80;
    let Ok(ip) = Ipv6Packet::new_checked(ip_pkt) else {
        return false;
    };
    if ip.next_header() != IpProtocol::Icmpv6 {
        return false;
    }
    let icmp = ip.payload();
    // type, code, checksum, hop limit, then the flags byte
    icmp.len() > 5 && icmp[0] == ICMPV6_ROUTER_ADVERT && icmp[5] & FLAG_MANAGED != 0
}
