//! A bidirectional in-process packet pipe. One half is handed to a DHCPv6
//! client engine, the other to the embedded relay agent, so the client
//! believes it is talking to a server while the relay re-encapsulates its
//! traffic.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::rudp::{ConnError, PacketConn};

const PAIR_QUEUE_DEPTH: usize = 32;

/// One half of a [`pair`]. Writes land in the peer's read queue; the
/// destination address on `send_to` is irrelevant. Reads report an
/// unspecified source so consumers fall back to their configured peer
/// address.
pub struct PairConn {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

/// Builds both halves with crossed queues. Dropping either half closes the
/// other's reads.
pub fn pair() -> (PairConn, PairConn) {
    let (a_tx, b_rx) = mpsc::channel(PAIR_QUEUE_DEPTH);
    let (b_tx, a_rx) = mpsc::channel(PAIR_QUEUE_DEPTH);
    (
        PairConn {
            tx: a_tx,
            rx: Mutex::new(a_rx),
        },
        PairConn {
            tx: b_tx,
            rx: Mutex::new(b_rx),
        },
    )
}

#[async_trait]
impl PacketConn for PairConn {
    fn local_addr(&self) -> SocketAddr {
        "[::]:0".parse().expect("constant addr")
    }

    async fn send_to(&self, payload: &[u8], _dst: SocketAddr) -> Result<(), ConnError> {
        self.tx
            .send(payload.to_vec())
            .await
            .map_err(|_| ConnError::Closed)
    }

    async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), ConnError> {
        let buf = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(ConnError::Closed)?;
        Ok((buf, self.local_addr()))
    }
}
