//! One virtual client: its endpoints, protocol engines, current leases,
//! and the dial/release choreography between the v4 and v6 branches.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::{mpsc, watch};

use super::confgen::ClientConfig;
use super::dhcp4::{Dhcp4Engine, CLIENT_PORT};
use super::dhcp6::{wait_managed_ra, Dhcp6Engine};
use super::lease::{encode_v6_opts, ClientId, FullStackLease, V4Lease, V6Lease};
use super::relay6::{spawn_relay_agent, RelayAgentConfig};
use super::summary::{DialAction, DialResult, Outcome};
use crate::conf::{Setup, V6Mode};
use crate::netio::endpoint::L2Endpoint;
use crate::netio::frame::{ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use crate::netio::ifapply;
use crate::netio::relay::{PacketRelay, RelayError};
use crate::netio::rudp::RawUdpConn;
use crate::utils::addr::lla_from_mac;

const RELEASE_ATTEMPTS: usize = 3;
const RS_ATTEMPTS: usize = 3;
const RS_WAIT: Duration = Duration::from_secs(3);

/// Channels a client posts into; owned per client, cloned from the
/// scheduler's ends.
pub struct ClientChannels {
    pub result_tx: mpsc::Sender<DialResult>,
    pub save_v4_tx: Option<mpsc::Sender<(ClientId, V4Lease)>>,
    pub save_v6_tx: Option<mpsc::Sender<(ClientId, V6Lease)>>,
}

pub struct VirtualClient {
    setup: Arc<Setup>,
    cfg: ClientConfig,
    id: ClientId,
    v6_ep: Option<Arc<L2Endpoint>>,
    d4: Option<Dhcp4Engine>,
    d6: Option<Dhcp6Engine>,
    d4_release: Option<Dhcp4Engine>,
    v4_ep: Option<Arc<L2Endpoint>>,
    pub(crate) d4_lease: Option<V4Lease>,
    pub(crate) d6_lease: Option<V6Lease>,
    chans: ClientChannels,
}

impl VirtualClient {
    /// Builds a client ready to dial: endpoints registered on the relay,
    /// engines wired, and in relay-forward mode the embedded relay agent
    /// already running between the engine and the wire.
    pub fn new_dora(
        setup: Arc<Setup>,
        cfg: ClientConfig,
        relay: &dyn PacketRelay,
        chans: ClientChannels,
        stop: watch::Receiver<bool>,
    ) -> Result<Self, RelayError> {
        let id = cfg.client_id();
        let mut client = Self {
            setup: setup.clone(),
            id,
            v6_ep: None,
            d4: None,
            d6: None,
            d4_release: None,
            v4_ep: None,
            d4_lease: None,
            d6_lease: None,
            chans,
            cfg,
        };

        if setup.enable_v4 {
            let ep = Arc::new(L2Endpoint::new(
                relay,
                client.cfg.mac,
                client.cfg.vlans.clone(),
                ETHERTYPE_IPV4,
                true,
            )?);
            let conn = RawUdpConn::new(
                ep.clone(),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), CLIENT_PORT),
                true,
            );
            client.v4_ep = Some(ep);
            client.d4 = Some(Dhcp4Engine::new(
                conn,
                client.cfg.mac,
                client.cfg.v4_options.clone(),
                setup.attempts(),
                setup.timeout,
            ));
        }

        if setup.enable_v6 {
            client.wire_v6(relay, stop)?;
        }
        Ok(client)
    }

    /// Rebuilds a client from a persisted lease record so it can release
    /// what an earlier run acquired.
    pub fn new_release(
        setup: Arc<Setup>,
        id: ClientId,
        full: FullStackLease,
        relay: &dyn PacketRelay,
        chans: ClientChannels,
        stop: watch::Receiver<bool>,
    ) -> Result<Self, RelayError> {
        let (mac, vlans) = match (&full.v4, &full.v6) {
            (Some(v4), _) => match v4.mac() {
                Ok(mac) => (mac, v4.vlans.clone()),
                Err(e) => {
                    warn!("{id}: unreadable v4 lease record: {e}");
                    return Err(RelayError::Closed);
                }
            },
            (None, Some(v6)) => (mac_address::MacAddress::new(v6.mac), v6.vlans.clone()),
            (None, None) => return Err(RelayError::Closed),
        };

        let cfg = ClientConfig {
            index: 0,
            mac,
            vlans,
            v4_options: Vec::new(),
            v6_options: Vec::new(),
            v6_relay_options: Vec::new(),
        };
        let mut client = Self {
            setup: setup.clone(),
            id,
            v6_ep: None,
            d4: None,
            d6: None,
            d4_release: None,
            v4_ep: None,
            d4_lease: None,
            d6_lease: None,
            chans,
            cfg,
        };

        if let Some(v4) = full.v4 {
            let ep = Arc::new(L2Endpoint::new(
                relay,
                client.cfg.mac,
                client.cfg.vlans.clone(),
                ETHERTYPE_IPV4,
                true,
            )?);
            client.v4_ep = Some(ep);
            client.d4_lease = Some(v4);
            client.ensure_v4_release_engine()?;
        }
        if let Some(v6) = full.v6 {
            // releases travel the same path the lease was acquired on
            client.cfg.v6_relay_options =
                match super::lease::decode_v6_opts(&v6.relay_id_options) {
                    Ok(opts) => opts.iter().cloned().collect(),
                    Err(e) => {
                        warn!("{}: unreadable relay options in lease: {e}", client.id);
                        Vec::new()
                    }
                };
            let mode = v6.mode;
            client.d6_lease = Some(v6);
            client.wire_v6_mode(relay, stop, mode)?;
        }
        Ok(client)
    }

    fn wire_v6(&mut self, relay: &dyn PacketRelay, stop: watch::Receiver<bool>) -> Result<(), RelayError> {
        self.wire_v6_mode(relay, stop, self.setup.v6_mode)
    }

    fn wire_v6_mode(
        &mut self,
        relay: &dyn PacketRelay,
        stop: watch::Receiver<bool>,
        mode: V6Mode,
    ) -> Result<(), RelayError> {
        let ep = Arc::new(L2Endpoint::new(
            relay,
            self.cfg.mac,
            self.cfg.vlans.clone(),
            ETHERTYPE_IPV6,
            true,
        )?);
        let lla = lla_from_mac(self.cfg.mac);
        let rudp = RawUdpConn::new(
            ep.clone(),
            SocketAddr::new(IpAddr::V6(lla), dhcproto::v6::CLIENT_PORT),
            true,
        );
        self.v6_ep = Some(ep);

        let engine_conn: Box<dyn crate::netio::rudp::PacketConn> = match mode {
            V6Mode::Solicit => Box::new(rudp),
            V6Mode::RelayForward => {
                let (engine_half, relay_half) = crate::netio::pair::pair();
                spawn_relay_agent(
                    Box::new(relay_half),
                    Box::new(rudp),
                    RelayAgentConfig::new(lla).with_options(self.cfg.v6_relay_options.clone()),
                    stop,
                );
                Box::new(engine_half)
            }
        };
        self.d6 = Some(Dhcp6Engine::new(
            engine_conn,
            self.cfg.mac,
            self.cfg.v6_options.clone(),
            self.setup.need_na,
            self.setup.need_pd,
            self.setup.attempts(),
            self.setup.timeout,
        ));
        Ok(())
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn has_v4_lease(&self) -> bool {
        self.d4_lease.is_some()
    }

    pub fn has_v6_lease(&self) -> bool {
        self.d6_lease.is_some()
    }

    /// A DHCPRELEASE must come from the leased address, so the release
    /// engine gets its own conn on the same endpoint registration.
    pub fn ensure_v4_release_engine(&mut self) -> Result<(), RelayError> {
        if self.d4_release.is_some() {
            return Ok(());
        }
        let (Some(lease), Some(ep)) = (&self.d4_lease, &self.v4_ep) else {
            return Ok(());
        };
        let leased_ip: Ipv4Addr = match lease
            .addr_str()
            .ok()
            .and_then(|s| s.split('/').next().map(str::to_string))
            .and_then(|ip| ip.parse().ok())
        {
            Some(ip) => ip,
            None => {
                warn!("{}: can't derive release address from lease", self.id);
                return Ok(());
            }
        };
        let conn = RawUdpConn::new(
            ep.clone(),
            SocketAddr::new(IpAddr::V4(leased_ip), CLIENT_PORT),
            false,
        );
        self.d4_release = Some(Dhcp4Engine::new(
            conn,
            self.cfg.mac,
            Vec::new(),
            self.setup.attempts(),
            self.setup.timeout,
        ));
        Ok(())
    }

    /// Dials whatever is enabled, honoring the stack delay: the deferred
    /// family starts `|delay|` after the other. Both branches are joined
    /// before the dial counts as done.
    pub async fn dial_all(&mut self) {
        let delay = self.setup.stack_delay();
        let v4_first = self.setup.v4_first();
        let this = &*self;
        let (v4_lease, v6_lease) = tokio::join!(
            async {
                let engine = this.d4.as_ref()?;
                if !v4_first && !delay.is_zero() && this.d6.is_some() {
                    tokio::time::sleep(delay).await;
                }
                this.dial_v4_branch(engine).await
            },
            async {
                let engine = this.d6.as_ref()?;
                if v4_first && !delay.is_zero() && this.d4.is_some() {
                    tokio::time::sleep(delay).await;
                }
                this.dial_v6_branch(engine).await
            }
        );
        if let Some(lease) = v4_lease {
            self.d4_lease = Some(lease);
        }
        if let Some(lease) = v6_lease {
            self.d6_lease = Some(lease);
        }
    }

    async fn dial_v4_branch(&self, engine: &Dhcp4Engine) -> Option<V4Lease> {
        let start = Instant::now();
        debug!("{}: doing DORA on {}", self.id, self.setup.ifname);
        let lease = match engine.dial(&self.cfg.vlans).await {
            Ok(lease) => lease,
            Err(e) => {
                debug!("{}: failed to dial DHCPv4: {e}", self.id);
                self.post(false, DialAction::Dora, Outcome::Failure, start).await;
                return None;
            }
        };
        if self.setup.apply_lease {
            self.apply_v4(&lease).await;
        }
        if let Some(tx) = &self.chans.save_v4_tx {
            let _ = tx.send((self.id.clone(), lease.clone())).await;
        }
        self.post(false, DialAction::Dora, Outcome::Success, start).await;
        Some(lease)
    }

    async fn dial_v6_branch(&self, engine: &Dhcp6Engine) -> Option<V6Lease> {
        let start = Instant::now();
        if self.setup.send_rs_first {
            let ep = self.v6_ep.as_ref()?;
            if let Err(e) = wait_managed_ra(ep, self.cfg.mac, RS_ATTEMPTS, RS_WAIT).await {
                debug!("{}: router solicitation gate failed: {e}", self.id);
                self.post(true, DialAction::Dora, Outcome::Failure, start).await;
                return None;
            }
        }
        let reply = match engine.dial().await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("{}: failed to dial DHCPv6: {e}", self.id);
                self.post(true, DialAction::Dora, Outcome::Failure, start).await;
                return None;
            }
        };
        let lease = match self.v6_lease_from_reply(reply) {
            Ok(lease) => lease,
            Err(e) => {
                debug!("{}: couldn't record v6 lease: {e}", self.id);
                self.post(true, DialAction::Dora, Outcome::Failure, start).await;
                return None;
            }
        };
        if self.setup.apply_lease {
            self.apply_v6(&lease).await;
        }
        if let Some(tx) = &self.chans.save_v6_tx {
            let _ = tx.send((self.id.clone(), lease.clone())).await;
        }
        self.post(true, DialAction::Dora, Outcome::Success, start).await;
        Some(lease)
    }

    fn v6_lease_from_reply(&self, reply: Vec<u8>) -> Result<V6Lease, super::errors::DhcpError> {
        let mut id_opts = dhcproto::v6::DhcpOptions::new();
        for opt in &self.cfg.v6_options {
            id_opts.insert(opt.clone());
        }
        let mut relay_opts = dhcproto::v6::DhcpOptions::new();
        for opt in &self.cfg.v6_relay_options {
            relay_opts.insert(opt.clone());
        }
        Ok(V6Lease {
            mac: self.cfg.mac.bytes(),
            reply,
            mode: self.setup.v6_mode,
            vlans: self.cfg.vlans.clone(),
            id_options: encode_v6_opts(&id_opts)?,
            relay_id_options: encode_v6_opts(&relay_opts)?,
        })
    }

    /// Mirrors the dial ordering. Releases only what is actually held.
    pub async fn release_all(&mut self) {
        if self.d4_release.is_none() && self.d4_lease.is_some() {
            if let Err(e) = self.ensure_v4_release_engine() {
                warn!("{}: can't build v4 release engine: {e}", self.id);
            }
        }
        let delay = self.setup.stack_delay();
        let v4_first = self.setup.v4_first();
        let this = &*self;
        tokio::join!(
            async {
                if let (Some(engine), Some(lease)) = (&this.d4_release, &this.d4_lease) {
                    if !v4_first && !delay.is_zero() && this.d6_lease.is_some() {
                        tokio::time::sleep(delay).await;
                    }
                    this.release_v4_branch(engine, lease).await;
                }
            },
            async {
                if let (Some(engine), Some(lease)) = (&this.d6, &this.d6_lease) {
                    if v4_first && !delay.is_zero() && this.d4_release.is_some() {
                        tokio::time::sleep(delay).await;
                    }
                    this.release_v6_branch(engine, lease).await;
                }
            }
        );
    }

    async fn release_v4_branch(&self, engine: &Dhcp4Engine, lease: &V4Lease) {
        let start = Instant::now();
        let mut outcome = Outcome::Failure;
        for _ in 0..RELEASE_ATTEMPTS {
            match engine.release(lease).await {
                Ok(()) => {
                    outcome = Outcome::Success;
                    break;
                }
                Err(e) => debug!("{}: v4 release failed: {e}", self.id),
            }
        }
        self.post(false, DialAction::Release, outcome, start).await;
    }

    async fn release_v6_branch(&self, engine: &Dhcp6Engine, lease: &V6Lease) {
        let start = Instant::now();
        let mut outcome = Outcome::Failure;
        for _ in 0..RELEASE_ATTEMPTS {
            match engine.release(lease).await {
                Ok(()) => {
                    outcome = Outcome::Success;
                    break;
                }
                Err(e) => debug!("{}: v6 release failed: {e}", self.id),
            }
        }
        self.post(true, DialAction::Release, outcome, start).await;
    }

    async fn apply_v4(&self, lease: &V4Lease) {
        match lease.addr_str() {
            Ok(cidr) => {
                if let Err(e) = ifapply::replace_addr(&self.setup.ifname, &cidr).await {
                    // still a success on the wire
                    warn!("{}: failed to apply {cidr}: {e}", self.id);
                }
            }
            Err(e) => warn!("{}: lease has no applicable address: {e}", self.id),
        }
    }

    async fn apply_v6(&self, lease: &V6Lease) {
        match lease.addr_strs() {
            Ok(cidrs) => {
                for cidr in cidrs {
                    if let Err(e) = ifapply::replace_addr(&self.setup.ifname, &cidr).await {
                        warn!("{}: failed to apply {cidr}: {e}", self.id);
                    }
                }
            }
            Err(e) => warn!("{}: lease has no applicable addresses: {e}", self.id),
        }
    }

    async fn post(&self, is_v6: bool, action: DialAction, outcome: Outcome, start: Instant) {
        let result = DialResult {
            is_v6,
            action,
            outcome,
            client_id: self.id.clone(),
            start,
            finish: Instant::now(),
        };
        if self.chans.result_tx.send(result).await.is_err() {
            debug!("{}: result channel closed", self.id);
        }
    }
}
