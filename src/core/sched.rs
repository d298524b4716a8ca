//! The scheduler: builds every virtual client, paces their dials, runs the
//! flapping loops, and owns the collector that folds results into the
//! summary.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use log::{debug, error, warn};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use super::client::{ClientChannels, VirtualClient};
use super::confgen::gen_client_configs;
use super::lease::{ClientId, V4Lease, V6Lease};
use super::ndp_targets;
use super::store::{load_lease_file, spawn_lease_writer, StoreError, SAVE_CHAN_DEPTH};
use super::summary::{DialResult, ResultSummary};
use crate::conf::{Action, Setup};
use crate::netio::ndp::NdpResponder;
use crate::netio::relay::PacketRelay;

const DIAL_RESULT_CHAN_DEPTH: usize = 1024;

pub struct Scheduler {
    setup: Arc<Setup>,
    clients: Vec<VirtualClient>,
    summary: Arc<Mutex<ResultSummary>>,
    result_rx: mpsc::Receiver<DialResult>,
    writer: Option<JoinHandle<Result<usize, StoreError>>>,
    stop_rx: watch::Receiver<bool>,
}

impl Scheduler {
    /// Builds every client up front: descriptors and engines for a DORA
    /// run, or reconstructed clients from the lease file for a release
    /// run. The NDP responder is started here too, so the server side can
    /// resolve the clients as soon as dialing begins.
    pub fn new(
        setup: Arc<Setup>,
        relay: Arc<dyn PacketRelay>,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let (result_tx, result_rx) = mpsc::channel(DIAL_RESULT_CHAN_DEPTH);

        let saving = setup.save_lease && setup.action == Action::Dora;
        let (save_v4_tx, save_v4_rx) = if saving && setup.enable_v4 {
            let (tx, rx) = mpsc::channel::<(ClientId, V4Lease)>(SAVE_CHAN_DEPTH);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (save_v6_tx, save_v6_rx) = if saving && setup.enable_v6 {
            let (tx, rx) = mpsc::channel::<(ClientId, V6Lease)>(SAVE_CHAN_DEPTH);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let writer = if saving {
            Some(spawn_lease_writer(
                setup.lease_file.clone(),
                save_v4_rx,
                save_v6_rx,
            ))
        } else {
            None
        };

        let mut clients = Vec::new();
        match setup.action {
            Action::Dora => {
                let configs = gen_client_configs(&setup)?;
                if setup.enable_v6 {
                    NdpResponder::spawn(relay.as_ref(), ndp_targets(&configs))
                        .context("failed to start the NDP responder")?;
                }
                for cfg in configs {
                    let chans = ClientChannels {
                        result_tx: result_tx.clone(),
                        save_v4_tx: save_v4_tx.clone(),
                        save_v6_tx: save_v6_tx.clone(),
                    };
                    let client =
                        VirtualClient::new_dora(setup.clone(), cfg, relay.as_ref(), chans, stop_rx.clone())
                            .context("failed to build a virtual client")?;
                    clients.push(client);
                }
            }
            Action::Release => {
                let map = load_lease_file(&setup.lease_file).with_context(|| {
                    format!("can't load lease file {}", setup.lease_file.display())
                })?;
                if map.is_empty() {
                    bail!("lease file {} holds no leases", setup.lease_file.display());
                }
                let mut ndp = HashMap::new();
                for (id, full) in map {
                    if full.v4.is_none() && full.v6.is_none() {
                        warn!("{id}: empty lease record, skipping");
                        continue;
                    }
                    if let Some(v6) = &full.v6 {
                        let mac = mac_address::MacAddress::new(v6.mac);
                        ndp.insert(
                            crate::utils::addr::lla_from_mac(mac),
                            crate::netio::ndp::L2Encap {
                                mac,
                                vlans: v6.vlans.clone(),
                            },
                        );
                    }
                    let chans = ClientChannels {
                        result_tx: result_tx.clone(),
                        save_v4_tx: None,
                        save_v6_tx: None,
                    };
                    let client = VirtualClient::new_release(
                        setup.clone(),
                        id,
                        full,
                        relay.as_ref(),
                        chans,
                        stop_rx.clone(),
                    )
                    .context("failed to rebuild a client from its lease")?;
                    clients.push(client);
                }
                if !ndp.is_empty() {
                    NdpResponder::spawn(relay.as_ref(), ndp)
                        .context("failed to start the NDP responder")?;
                }
            }
        }

        Ok(Self {
            summary: Arc::new(Mutex::new(ResultSummary::new(setup.interval))),
            setup,
            clients,
            result_rx,
            writer,
            stop_rx,
        })
    }

    /// Paced launch of every client, then the flap phase, then teardown.
    /// Always completes: per-client failures only show up in the summary.
    pub async fn run(mut self) -> Result<()> {
        let collector = spawn_collector(self.result_rx, self.summary.clone());

        let mut dialing = JoinSet::new();
        let interval = self.setup.interval;
        let release_run = self.setup.action == Action::Release;
        let clients = std::mem::take(&mut self.clients);
        let count = clients.len();
        for mut client in clients {
            dialing.spawn(async move {
                if release_run {
                    client.release_all().await;
                } else {
                    client.dial_all().await;
                }
                client
            });
            tokio::time::sleep(interval).await;
        }

        let mut clients = Vec::with_capacity(count);
        while let Some(joined) = dialing.join_next().await {
            match joined {
                Ok(client) => clients.push(client),
                Err(e) => error!("client task panicked: {e}"),
            }
        }
        debug!("dial finished");
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        println!(
            "\ninitial dialing results are:\n{}",
            self.summary.lock().unwrap()
        );

        let flap_num = self.setup.flapping.flap_num;
        if !release_run && flap_num > 0 {
            for client in clients.iter_mut().take(flap_num) {
                if client.has_v4_lease() {
                    if let Err(e) = client.ensure_v4_release_engine() {
                        error!("{}: no release engine, not flapping: {e}", client.id());
                    }
                }
            }
            println!("\nstart flapping {flap_num} clients...");
            let mut flapping = JoinSet::new();
            for client in clients.drain(..).take(flap_num) {
                flapping.spawn(flap_loop(
                    client,
                    self.setup.clone(),
                    self.stop_rx.clone(),
                ));
            }
            while flapping.join_next().await.is_some() {}
            println!("\nFinal result:\n{}", self.summary.lock().unwrap());
        }

        // dropping the remaining clients closes the result and save
        // channels; the collector and writer drain and finish
        drop(clients);
        let _ = collector.await;
        if let Some(writer) = self.writer.take() {
            match writer.await {
                Ok(Ok(count)) => debug!("lease writer persisted {count} client(s)"),
                Ok(Err(e)) => error!("lease writer failed: {e}"),
                Err(e) => error!("lease writer panicked: {e}"),
            }
        }
        Ok(())
    }
}

/// release → stay down → redial, with jittered pacing, until shutdown.
async fn flap_loop(mut client: VirtualClient, setup: Arc<Setup>, mut stop: watch::Receiver<bool>) {
    let range = setup
        .flapping
        .max_interval
        .saturating_sub(setup.flapping.min_interval);
    loop {
        let jitter = if range.is_zero() {
            std::time::Duration::ZERO
        } else {
            rand::thread_rng().gen_range(std::time::Duration::ZERO..range)
        };
        tokio::select! {
            _ = tokio::time::sleep(setup.flapping.min_interval + jitter) => {}
            _ = stop.changed() => return,
        }
        if client.has_v4_lease() || client.has_v6_lease() {
            client.release_all().await;
        }
        tokio::select! {
            _ = tokio::time::sleep(setup.flapping.stay_down) => {}
            _ = stop.changed() => return,
        }
        client.dial_all().await;
        if *stop.borrow() {
            return;
        }
    }
}

fn spawn_collector(
    mut rx: mpsc::Receiver<DialResult>,
    summary: Arc<Mutex<ResultSummary>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            let mut s = summary.lock().unwrap();
            s.observe(&result);
            print!(
                "\rdial succeed: {:7}\t released: {:7}\t trans failed: {:7}",
                s.success, s.released, s.failed
            );
            let _ = std::io::stdout().flush();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Cli;
    use crate::core::lease::FullStackLease;
    use crate::netio::endpoint::L2Endpoint;
    use crate::netio::frame::ETHERTYPE_IPV4;
    use crate::netio::relay::testutil::ChannelRelay;
    use crate::netio::rudp::{PacketConn, RawUdpConn};
    use clap::Parser;
    use dhcproto::{v4, Decodable, Decoder, Encodable};
    use mac_address::MacAddress;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::{Duration, Instant};

    fn setup_from(args: &[&str]) -> Arc<Setup> {
        let mut full = vec!["dhcperf", "-i", "veth0", "--mac", "02:00:00:00:00:01"];
        full.extend_from_slice(args);
        Arc::new(Setup::from_cli(Cli::parse_from(full), None).unwrap())
    }

    fn server_conn(relay: &ChannelRelay) -> RawUdpConn {
        let ep = L2Endpoint::new(
            relay,
            MacAddress::new([2, 0, 0, 0, 0, 0xfe]),
            vec![],
            ETHERTYPE_IPV4,
            true,
        )
        .unwrap();
        RawUdpConn::new(Arc::new(ep), "192.0.2.254:67".parse().unwrap(), true)
    }

    /// v4 server that leases x.y.z.(10+n) per distinct MAC and records
    /// when each MAC was first seen.
    fn spawn_v4_server(
        relay: &ChannelRelay,
    ) -> Arc<Mutex<Vec<([u8; 6], Instant)>>> {
        let first_seen: Arc<Mutex<Vec<([u8; 6], Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = first_seen.clone();
        let conn = server_conn(relay);
        tokio::spawn(async move {
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
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&msg.chaddr()[..6]);
                let host = {
                    let mut seen = seen.lock().unwrap();
                    match seen.iter().position(|(m, _)| *m == mac) {
                        Some(pos) => pos,
                        None => {
                            seen.push((mac, Instant::now()));
                            seen.len() - 1
                        }
                    }
                };
                let reply_type = match mtype {
                    v4::MessageType::Discover => v4::MessageType::Offer,
                    v4::MessageType::Request => v4::MessageType::Ack,
                    _ => continue,
                };
                let mut reply = v4::Message::default();
                reply.set_opcode(v4::Opcode::BootReply);
                reply.set_xid(msg.xid());
                reply.set_yiaddr(Ipv4Addr::new(192, 0, 2, 10 + host as u8));
                reply.set_chaddr(msg.chaddr());
                reply
                    .opts_mut()
                    .insert(v4::DhcpOption::MessageType(reply_type));
                reply.opts_mut().insert(v4::DhcpOption::ServerIdentifier(
                    "192.0.2.254".parse().unwrap(),
                ));
                reply.opts_mut().insert(v4::DhcpOption::SubnetMask(
                    "255.255.255.0".parse().unwrap(),
                ));
                let dst: SocketAddr = "255.255.255.255:68".parse().unwrap();
                let _ = conn.send_to(&reply.to_vec().unwrap(), dst).await;
            }
        });
        first_seen
    }

    fn stop_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn all_clients_succeed_and_are_paced() {
        let relay = ChannelRelay::new();
        let first_seen = spawn_v4_server(&relay);
        let setup = setup_from(&["-n", "3", "--interval", "100", "--timeout", "500"]);
        let (_stop_tx, stop_rx) = stop_channel();
        let sched = Scheduler::new(setup, relay.clone(), stop_rx).unwrap();
        let summary = sched.summary.clone();
        sched.run().await.unwrap();

        let s = summary.lock().unwrap();
        assert_eq!(s.total, 3);
        assert_eq!(s.success, 3);
        assert_eq!(s.failed, 0);

        let seen = first_seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        for pair in seen.windows(2) {
            let gap = pair[1].1.duration_since(pair[0].1);
            assert!(
                gap >= Duration::from_millis(60),
                "launches closer than the pacing interval: {gap:?}"
            );
        }
    }

    #[tokio::test]
    async fn failures_still_complete_the_run() {
        // no server at all
        let relay = ChannelRelay::new();
        let setup = setup_from(&["-n", "2", "--timeout", "30", "--interval", "10"]);
        let (_stop_tx, stop_rx) = stop_channel();
        let sched = Scheduler::new(setup, relay.clone(), stop_rx).unwrap();
        let summary = sched.summary.clone();
        sched.run().await.unwrap();
        let s = summary.lock().unwrap();
        assert_eq!(s.total, 2);
        assert_eq!(s.failed, 2);
        assert_eq!(s.success, 0);
    }

    #[tokio::test]
    async fn release_action_sends_a_release_per_persisted_lease() {
        let dir = std::env::temp_dir().join("dhcperf-sched-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("release.lease");

        // persist two v4 leases
        let mut map: HashMap<ClientId, FullStackLease> = HashMap::new();
        for last in [1u8, 2] {
            let mac = [2, 0, 0, 0, 0, last];
            let ack = crate::core::lease::tests::sample_ack(
                Ipv4Addr::new(192, 0, 2, 10 + last),
                "255.255.255.0".parse().unwrap(),
                mac,
            );
            map.insert(
                ClientId::from_parts(MacAddress::new(mac), &[]),
                FullStackLease {
                    v4: Some(V4Lease {
                        offer: ack.clone(),
                        ack,
                        created_at: chrono::Utc::now(),
                        vlans: vec![],
                        id_options: vec![],
                    }),
                    v6: None,
                },
            );
        }
        std::fs::write(&path, postcard::to_stdvec(&map).unwrap()).unwrap();

        let relay = ChannelRelay::new();
        // observer counts RELEASE messages on the server address
        let observer = server_conn(&relay);
        let releases = Arc::new(Mutex::new(0usize));
        let counted = releases.clone();
        tokio::spawn(async move {
            loop {
                let (buf, _) = match observer.recv_from().await {
                    Ok(hit) => hit,
                    Err(_) => return,
                };
                if let Ok(msg) = v4::Message::decode(&mut Decoder::new(&buf)) {
                    if matches!(
                        msg.opts().get(v4::OptionCode::MessageType),
                        Some(v4::DhcpOption::MessageType(v4::MessageType::Release))
                    ) {
                        *counted.lock().unwrap() += 1;
                    }
                }
            }
        });

        let setup = setup_from(&[
            "--action",
            "release",
            "--interval",
            "10",
            "--timeout",
            "500",
            "--leasefile",
            path.to_str().unwrap(),
        ]);
        let (_stop_tx, stop_rx) = stop_channel();
        let sched = Scheduler::new(setup, relay.clone(), stop_rx).unwrap();
        let summary = sched.summary.clone();
        sched.run().await.unwrap();

        let s = summary.lock().unwrap();
        assert_eq!(s.released, 2);
        assert_eq!(s.failed, 0);
        assert_eq!(*releases.lock().unwrap(), 2);
        std::fs::remove_file(&path).ok();
    }
}
