//! Lease persistence: a writer task drains the save channels for the
//! whole run and serializes the accumulated map once they close; the
//! release action loads it back.

use std::collections::HashMap;
use std::path::PathBuf;

use log::info;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::lease::{ClientId, FullStackLease, V4Lease, V6Lease};

pub const SAVE_CHAN_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lease file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("lease serialization failed: {0}")]
    Codec(#[from] postcard::Error),
}

/// Collects `{id, lease}` pairs until both channels close, then writes the
/// map to `path` atomically. Resolves to the number of persisted clients.
pub fn spawn_lease_writer(
    path: PathBuf,
    v4_rx: Option<mpsc::Receiver<(ClientId, V4Lease)>>,
    v6_rx: Option<mpsc::Receiver<(ClientId, V6Lease)>>,
) -> JoinHandle<Result<usize, StoreError>> {
    tokio::spawn(async move {
        let mut leases: HashMap<ClientId, FullStackLease> = HashMap::new();
        let mut v4_rx = v4_rx;
        let mut v6_rx = v6_rx;
        // drain both channels until every sender is gone
        while v4_rx.is_some() || v6_rx.is_some() {
            tokio::select! {
                v4 = async { v4_rx.as_mut().unwrap().recv().await }, if v4_rx.is_some() => {
                    match v4 {
                        Some((id, lease)) => {
                            leases.entry(id).or_default().v4 = Some(lease);
                        }
                        None => v4_rx = None,
                    }
                }
                v6 = async { v6_rx.as_mut().unwrap().recv().await }, if v6_rx.is_some() => {
                    match v6 {
                        Some((id, lease)) => {
                            leases.entry(id).or_default().v6 = Some(lease);
                        }
                        None => v6_rx = None,
                    }
                }
            }
        }
        let count = leases.len();
        write_lease_file(&path, &leases).await?;
        info!("saved {count} lease(s) to {}", path.display());
        Ok(count)
    })
}

async fn write_lease_file(
    path: &PathBuf,
    leases: &HashMap<ClientId, FullStackLease>,
) -> Result<(), StoreError> {
    let encoded = postcard::to_stdvec(leases)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &encoded).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub fn load_lease_file(path: &PathBuf) -> Result<HashMap<ClientId, FullStackLease>, StoreError> {
    let bytes = std::fs::read(path)?;
    Ok(postcard::from_bytes(&bytes)?)
}
