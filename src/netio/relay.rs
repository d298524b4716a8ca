//! The packet relay owns one raw Ethernet interface and fans received
//! frames out to registered virtual endpoints. Endpoints are keyed by
//! `{MAC, VLAN IDs, EtherType}`; a single "default" endpoint may catch
//! whatever no key claims (the NDP responder uses it).

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, watch};

use super::frame::{parse_frame, EndpointKey, RxFrame};

pub const DEFAULT_SEND_CHAN_DEPTH: usize = 10240;
pub const DEFAULT_RECV_QUEUE_DEPTH: usize = 512;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("endpoint {0} is already registered")]
    DuplicateEndpoint(String),
    #[error("a default endpoint is already registered")]
    DuplicateDefault,
    #[error("relay is closed")]
    Closed,
    #[error("read deadline exceeded")]
    Timeout,
    #[error("interface {ifname}: {source}")]
    Interface {
        ifname: String,
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Registration request for one virtual endpoint. `key: None` claims the
/// default slot; `multicast` opts the queue into broadcast/multicast
/// delivery.
pub struct Registration {
    pub key: Option<EndpointKey>,
    pub multicast: bool,
    pub queue_depth: usize,
}

impl Registration {
    pub fn keyed(key: EndpointKey, multicast: bool) -> Self {
        Self {
            key: Some(key),
            multicast,
            queue_depth: DEFAULT_RECV_QUEUE_DEPTH,
        }
    }

    pub fn default_receiver() -> Self {
        Self {
            key: None,
            multicast: true,
            queue_depth: DEFAULT_RECV_QUEUE_DEPTH,
        }
    }
}

/// What a successful registration hands back: the endpoint's receive queue
/// and the shared frame transmit handle.
pub struct EndpointChannels {
    pub rx: mpsc::Receiver<RxFrame>,
    pub tx: mpsc::Sender<Vec<u8>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RelayStats {
    pub rx_frames: u64,
    pub rx_dropped: u64,
    pub rx_queue_full: u64,
    pub tx_frames: u64,
    pub tx_errors: u64,
}

#[derive(Default)]
struct StatsCells {
    rx_frames: AtomicU64,
    rx_dropped: AtomicU64,
    rx_queue_full: AtomicU64,
    tx_frames: AtomicU64,
    tx_errors: AtomicU64,
}

impl StatsCells {
    fn snapshot(&self) -> RelayStats {
        RelayStats {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            rx_queue_full: self.rx_queue_full.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
        }
    }
}

/// Capability the rest of the crate programs against; `RawSocketRelay` is
/// the AF_PACKET rendition and the only driver built in.
pub trait PacketRelay: Send + Sync {
    fn register(&self, reg: Registration) -> Result<EndpointChannels, RelayError>;
    fn stats(&self) -> RelayStats;
    fn stop(&self);
}

struct EndpointSlot {
    tx: mpsc::Sender<RxFrame>,
    multicast: bool,
}

/// Receive-side fan-out table. Written during setup/teardown, read on the
/// hot path.
pub(crate) struct Dispatcher {
    endpoints: RwLock<HashMap<EndpointKey, EndpointSlot>>,
    default_ep: RwLock<Option<mpsc::Sender<RxFrame>>>,
    stats: StatsCells,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            default_ep: RwLock::new(None),
            stats: StatsCells::default(),
        }
    }

    pub(crate) fn register(
        &self,
        reg: &Registration,
    ) -> Result<mpsc::Receiver<RxFrame>, RelayError> {
        let (tx, rx) = mpsc::channel(reg.queue_depth);
        match &reg.key {
            Some(key) => {
                let mut table = self.endpoints.write().unwrap();
                if table.contains_key(key) {
                    return Err(RelayError::DuplicateEndpoint(key.to_string()));
                }
                table.insert(
                    key.clone(),
                    EndpointSlot {
                        tx,
                        multicast: reg.multicast,
                    },
                );
            }
            None => {
                let mut slot = self.default_ep.write().unwrap();
                if slot.is_some() {
                    return Err(RelayError::DuplicateDefault);
                }
                *slot = Some(tx);
            }
        }
        Ok(rx)
    }

    /// Exact key match first, then the default endpoint, else drop.
    /// Broadcast/multicast goes to every opted-in endpoint sharing the
    /// frame's VLAN stack and EtherType, and to the default endpoint.
    pub(crate) fn dispatch(&self, frame: RxFrame) {
        self.stats.rx_frames.fetch_add(1, Ordering::Relaxed);
        if frame.is_multicast() {
            let table = self.endpoints.read().unwrap();
            let mut delivered = false;
            for (key, slot) in table.iter() {
                if slot.multicast
                    && key.vlan_ids == frame.key().vlan_ids
                    && key.ethertype == frame.ethertype
                {
                    delivered |= self.offer(&slot.tx, frame.clone());
                }
            }
            drop(table);
            if let Some(tx) = self.default_ep.read().unwrap().as_ref() {
                delivered |= self.offer(tx, frame.clone());
            }
            if !delivered {
                self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let key = frame.key();
        let table = self.endpoints.read().unwrap();
        if let Some(slot) = table.get(&key) {
            self.offer(&slot.tx, frame);
            return;
        }
        drop(table);
        if let Some(tx) = self.default_ep.read().unwrap().as_ref() {
            self.offer(tx, frame);
            return;
        }
        self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn offer(&self, tx: &mpsc::Sender<RxFrame>, frame: RxFrame) -> bool {
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.stats.rx_queue_full.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Dropping every sender makes all endpoint reads observe `Closed`.
    pub(crate) fn close_all(&self) {
        self.endpoints.write().unwrap().clear();
        *self.default_ep.write().unwrap() = None;
    }
}

/// Relay over an AF_PACKET socket bound to one interface. Construction
/// spawns the receive and transmit loops; `stop` (or a fatal socket error)
/// tears both down and closes every endpoint queue.
pub struct RawSocketRelay {
    dispatcher: Arc<Dispatcher>,
    frame_tx: mpsc::Sender<Vec<u8>>,
    stop_tx: watch::Sender<bool>,
}

pub struct RelayConfig {
    pub send_chan_depth: usize,
    pub debug: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            send_chan_depth: DEFAULT_SEND_CHAN_DEPTH,
            debug: false,
        }
    }
}

impl RawSocketRelay {
    pub fn new(ifname: &str, cfg: RelayConfig) -> Result<Self, RelayError> {
        let fd = open_af_packet(ifname).map_err(|source| RelayError::Interface {
            ifname: ifname.to_string(),
            source,
        })?;
        let async_fd = Arc::new(AsyncFd::new(fd)?);

        let dispatcher = Arc::new(Dispatcher::new());
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(cfg.send_chan_depth);
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(recv_loop(
            async_fd.clone(),
            dispatcher.clone(),
            stop_rx.clone(),
            cfg.debug,
        ));
        tokio::spawn(send_loop(async_fd, dispatcher.clone(), frame_rx, stop_rx));

        Ok(Self {
            dispatcher,
            frame_tx,
            stop_tx,
        })
    }
}

impl PacketRelay for RawSocketRelay {
    fn register(&self, reg: Registration) -> Result<EndpointChannels, RelayError> {
        let rx = self.dispatcher.register(&reg)?;
        Ok(EndpointChannels {
            rx,
            tx: self.frame_tx.clone(),
        })
    }

    fn stats(&self) -> RelayStats {
        self.dispatcher.stats.snapshot()
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

fn open_af_packet(ifname: &str) -> io::Result<OwnedFd> {
    let ifindex = {
        let name = std::ffi::CString::new(ifname)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad interface name"))?;
        let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if idx == 0 {
            return Err(io::Error::last_os_error());
        }
        idx
    };

    let socket = Socket::new(
        Domain::PACKET,
        Type::RAW,
        Some(Protocol::from(libc::ETH_P_ALL)),
    )?;
    socket.set_nonblocking(true)?;

    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    addr.sll_ifindex = ifindex as i32;
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let raw_fd = socket.as_raw_fd();
    std::mem::forget(socket);
    Ok(unsafe { OwnedFd::from_raw_fd(raw_fd) })
}

async fn recv_loop(
    async_fd: Arc<AsyncFd<OwnedFd>>,
    dispatcher: Arc<Dispatcher>,
    mut stop_rx: watch::Receiver<bool>,
    trace: bool,
) {
    let mut buf = vec![0u8; 9216];
    loop {
        let readable = tokio::select! {
            r = async_fd.readable() => r,
            _ = stop_rx.changed() => break,
        };
        let mut guard = match readable {
            Ok(g) => g,
            Err(e) => {
                warn!("relay receive loop terminated: {e}");
                break;
            }
        };
        let n = match guard.try_io(|fd| -> io::Result<usize> {
            let ret = unsafe {
                libc::recv(
                    fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(ret as usize)
            }
        }) {
            Ok(Ok(n)) => n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Ok(Err(e)) => {
                warn!("relay receive loop terminated: {e}");
                break;
            }
            Err(_) => continue,
        };
        if n == 0 {
            continue;
        }
        if let Some(frame) = parse_frame(&buf[..n]) {
            if trace {
                debug!("relay rx {} -> {}", frame.key(), n);
            }
            dispatcher.dispatch(frame);
        }
    }
    dispatcher.close_all();
}

async fn send_loop(
    async_fd: Arc<AsyncFd<OwnedFd>>,
    dispatcher: Arc<Dispatcher>,
    mut frame_rx: mpsc::Receiver<Vec<u8>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            f = frame_rx.recv() => match f {
                Some(f) => f,
                None => break,
            },
            _ = stop_rx.changed() => break,
        };
        match write_frame(&async_fd, &frame).await {
            Ok(()) => {
                dispatcher.stats.tx_frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                dispatcher.stats.tx_errors.fetch_add(1, Ordering::Relaxed);
                debug!("relay tx error: {e}");
            }
        }
    }
}

async fn write_frame(async_fd: &AsyncFd<OwnedFd>, frame: &[u8]) -> io::Result<()> {
    loop {
        let mut guard = async_fd.writable().await?;
        match guard.try_io(|fd| -> io::Result<usize> {
            let ret = unsafe {
                libc::send(
                    fd.as_raw_fd(),
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    0,
                )
            };
            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(ret as usize)
            }
        }) {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Ok(Err(e)) => return Err(e),
            Err(_) => continue,
        }
    }
}

/// In-memory relay used by unit tests across the crate: transmitted frames
/// are parsed and dispatched straight back through the same table, so two
/// endpoints registered on it can talk to each other.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub(crate) struct ChannelRelay {
        dispatcher: Arc<Dispatcher>,
        frame_tx: mpsc::Sender<Vec<u8>>,
    }

    impl ChannelRelay {
        pub(crate) fn new() -> Arc<Self> {
            let dispatcher = Arc::new(Dispatcher::new());
            let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(DEFAULT_SEND_CHAN_DEPTH);
            let loopback = dispatcher.clone();
            tokio::spawn(async move {
                while let Some(buf) = frame_rx.recv().await {
                    if let Some(frame) = parse_frame(&buf) {
                        loopback.dispatch(frame);
                    }
                }
            });
            Arc::new(Self {
                dispatcher,
                frame_tx,
            })
        }

        /// Injects a frame as if it had arrived on the wire.
        pub(crate) fn inject(&self, buf: &[u8]) {
            if let Some(frame) = parse_frame(buf) {
                self.dispatcher.dispatch(frame);
            }
        }
    }

    impl PacketRelay for ChannelRelay {
        fn register(&self, reg: Registration) -> Result<EndpointChannels, RelayError> {
            let rx = self.dispatcher.register(&reg)?;
            Ok(EndpointChannels {
                rx,
                tx: self.frame_tx.clone(),
            })
        }

        fn stats(&self) -> RelayStats {
            self.dispatcher.stats.snapshot()
        }

        fn stop(&self) {
            self.dispatcher.close_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netio::frame::{build_frame, EndpointKey, VlanTag, ETHERTYPE_IPV4};
    use mac_address::MacAddress;

    fn keyed_reg(mac: [u8; 6], vids: &[u16], multicast: bool) -> Registration {
        let vlans: Vec<VlanTag> = vids.iter().map(|&v| VlanTag::dot1q(v)).collect();
        Registration::keyed(
            EndpointKey::new(MacAddress::new(mac), &vlans, ETHERTYPE_IPV4),
            multicast,
        )
    }

    #[tokio::test]
    async fn unicast_goes_to_exact_key_only() {
        let d = Dispatcher::new();
        let mut rx_a = d.register(&keyed_reg([2, 0, 0, 0, 0, 1], &[100], false)).unwrap();
        let mut rx_b = d.register(&keyed_reg([2, 0, 0, 0, 0, 2], &[100], false)).unwrap();

        let frame = build_frame(
            [2, 0, 0, 0, 0, 1],
            [0, 1, 2, 3, 4, 5],
            &[VlanTag::dot1q(100)],
            ETHERTYPE_IPV4,
            &[1],
        );
        d.dispatch(parse_frame(&frame).unwrap());

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let d = Dispatcher::new();
        let _rx = d.register(&keyed_reg([2, 0, 0, 0, 0, 1], &[], false)).unwrap();
        assert!(matches!(
            d.register(&keyed_reg([2, 0, 0, 0, 0, 1], &[], false)),
            Err(RelayError::DuplicateEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_reaches_multicast_endpoints_with_matching_stack() {
        let d = Dispatcher::new();
        let mut rx_match = d.register(&keyed_reg([2, 0, 0, 0, 0, 1], &[100], true)).unwrap();
        let mut rx_off = d.register(&keyed_reg([2, 0, 0, 0, 0, 2], &[100], false)).unwrap();
        let mut rx_other_vlan = d.register(&keyed_reg([2, 0, 0, 0, 0, 3], &[300], true)).unwrap();

        let frame = build_frame(
            super::super::frame::BROADCAST_MAC,
            [0, 1, 2, 3, 4, 5],
            &[VlanTag::dot1q(100)],
            ETHERTYPE_IPV4,
            &[1],
        );
        d.dispatch(parse_frame(&frame).unwrap());

        assert!(rx_match.try_recv().is_ok());
        assert!(rx_off.try_recv().is_err());
        assert!(rx_other_vlan.try_recv().is_err());
    }

    #[tokio::test]
    async fn unmatched_unicast_falls_back_to_default() {
        let d = Dispatcher::new();
        let mut rx_def = d.register(&Registration::default_receiver()).unwrap();
        let frame = build_frame(
            [2, 0, 0, 0, 0, 9],
            [0, 1, 2, 3, 4, 5],
            &[],
            ETHERTYPE_IPV4,
            &[],
        );
        d.dispatch(parse_frame(&frame).unwrap());
        assert!(rx_def.try_recv().is_ok());
    }

    #[tokio::test]
    async fn close_all_terminates_readers() {
        let d = Dispatcher::new();
        let mut rx = d.register(&keyed_reg([2, 0, 0, 0, 0, 1], &[], false)).unwrap();
        d.close_all();
        assert!(rx.recv().await.is_none());
    }
}
