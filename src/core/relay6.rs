//! Embedded DHCPv6 relay agent. The access side faces a client engine
//! (usually over a pair conn), the network side faces the wire; solicits
//! get wrapped into RELAY-FORW, RELAY-REPL gets unwrapped back.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use dhcproto::v6;
use dhcproto::{Decodable, Decoder, Encodable};
use log::{debug, warn};
use tokio::sync::watch;

use super::dhcp6::ALL_DHCP_RELAY_AGENTS_AND_SERVERS;
use crate::netio::rudp::{ConnError, PacketConn};

pub struct RelayAgentConfig {
    pub server_addr: SocketAddr,
    pub link_addr: Ipv6Addr,
    /// Used as the RELAY-FORW peer-address when the access side reports an
    /// unspecified source, and checked against inbound RELAY-REPL.
    pub peer_addr: Ipv6Addr,
    /// Relay-supplied options appended to every RELAY-FORW (remote-id,
    /// interface-id).
    pub options: Vec<v6::DhcpOption>,
}

impl RelayAgentConfig {
    pub fn new(peer_addr: Ipv6Addr) -> Self {
        Self {
            server_addr: SocketAddr::new(
                IpAddr::V6(ALL_DHCP_RELAY_AGENTS_AND_SERVERS),
                v6::SERVER_PORT,
            ),
            link_addr: Ipv6Addr::UNSPECIFIED,
            peer_addr,
            options: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: Vec<v6::DhcpOption>) -> Self {
        self.options = options;
        self
    }
}

/// Starts both forwarding loops. They run until the stop signal flips, a
/// conn closes, or an unrecoverable send error occurs; read timeouts are
/// ignored.
pub fn spawn_relay_agent(
    access: Box<dyn PacketConn>,
    network: Box<dyn PacketConn>,
    cfg: RelayAgentConfig,
    stop: watch::Receiver<bool>,
) {
    let access: std::sync::Arc<dyn PacketConn> = std::sync::Arc::from(access);
    let network: std::sync::Arc<dyn PacketConn> = std::sync::Arc::from(network);
    let cfg = std::sync::Arc::new(cfg);
    tokio::spawn(access_to_network(
        access.clone(),
        network.clone(),
        cfg.clone(),
        stop.clone(),
    ));
    tokio::spawn(network_to_access(access, network, cfg, stop));
}

async fn access_to_network(
    access: std::sync::Arc<dyn PacketConn>,
    network: std::sync::Arc<dyn PacketConn>,
    cfg: std::sync::Arc<RelayAgentConfig>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let recv = tokio::select! {
            r = access.recv_from() => r,
            _ = stop.changed() => return,
        };
        let (buf, src) = match recv {
            Ok(hit) => hit,
            Err(ConnError::Timeout) => continue,
            Err(_) => return,
        };
        let msg = match v6::Message::decode(&mut Decoder::new(&buf)) {
            Ok(m) => m,
            Err(_) => {
                debug!("relay agent: invalid DHCPv6 message from access side {src}");
                continue;
            }
        };
        if msg.opts().get(v6::OptionCode::ClientId).is_none() {
            debug!("relay agent: dropping access message without client-id");
            continue;
        }

        let peer_addr = match src.ip() {
            IpAddr::V6(ip) if !ip.is_unspecified() => ip,
            _ => cfg.peer_addr,
        };
        let mut opts = v6::DhcpOptions::new();
        opts.insert(v6::DhcpOption::RelayMsg(v6::RelayMessageData::Message(
            msg,
        )));
        for opt in &cfg.options {
            opts.insert(opt.clone());
        }
        let relay_fwd = v6::RelayMessage {
            msg_type: v6::MessageType::RelayForw,
            hop_count: 0,
            link_addr: cfg.link_addr,
            peer_addr,
            opts,
        };
        let wire = match relay_fwd.to_vec() {
            Ok(w) => w,
            Err(e) => {
                warn!("relay agent: failed to encode relay-forward: {e}");
                continue;
            }
        };
        if let Err(e) = network.send_to(&wire, cfg.server_addr).await {
            warn!("relay agent: network send failed, stopping: {e}");
            return;
        }
        debug!("relay agent: forwarded message for peer {peer_addr}");
    }
}

async fn network_to_access(
    access: std::sync::Arc<dyn PacketConn>,
    network: std::sync::Arc<dyn PacketConn>,
    cfg: std::sync::Arc<RelayAgentConfig>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let recv = tokio::select! {
            r = network.recv_from() => r,
            _ = stop.changed() => return,
        };
        let (buf, src) = match recv {
            Ok(hit) => hit,
            Err(ConnError::Timeout) => continue,
            Err(_) => return,
        };
        let relay_msg = match v6::RelayMessage::decode(&mut Decoder::new(&buf)) {
            Ok(m) => m,
            Err(_) => {
                debug!("relay agent: invalid relay message from {src}");
                continue;
            }
        };
        if relay_msg.msg_type() != v6::MessageType::RelayRepl {
            debug!(
                "relay agent: dropping {:?} from the network side",
                relay_msg.msg_type()
            );
            continue;
        }
        // the reply must be aimed at the peer we forwarded for
        if !relay_msg.peer_addr().is_unspecified() && relay_msg.peer_addr() != cfg.peer_addr {
            debug!(
                "relay agent: relay-reply peer {} doesn't match {}",
                relay_msg.peer_addr(), cfg.peer_addr
            );
            continue;
        }
        let inner = relay_msg.opts().iter().find_map(|opt| match opt {
            v6::DhcpOption::RelayMsg(v6::RelayMessageData::Message(m)) => Some(m.clone()),
            _ => None,
        });
        let Some(inner) = inner else {
            debug!("relay agent: relay-reply without relay-message option");
            continue;
        };
        let wire = match inner.to_vec() {
            Ok(w) => w,
            Err(e) => {
                warn!("relay agent: failed to re-encode inner message: {e}");
                continue;
            }
        };
        let dst = SocketAddr::new(IpAddr::V6(relay_msg.peer_addr), v6::CLIENT_PORT);
        if let Err(e) = access.send_to(&wire, dst).await {
            warn!("relay agent: access send failed, stopping: {e}");
            return;
        }
    }
}
