use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::services::dedup::Deduplicator;
use crate::services::endpoint::ConnectionManager;
use crate::services::event::{BlockHash, Chain};

const PROCESSED_FILE: &str = "processed.json";
const ENDPOINTS_FILE: &str = "endpoints.json";

#[derive(Debug, Serialize, Deserialize)]
struct ProcessedSnapshot {
    saved_at: DateTime<Utc>,
    entries: Vec<ProcessedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProcessedEntry {
    chain: Chain,
    hash: String,
    height: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct EndpointSnapshot {
    saved_at: DateTime<Utc>,
    endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EndpointEntry {
    id: String,
    is_healthy: bool,
}

/// Optional warm-restart state. Everything here is best-effort: the relay is
/// in-memory by design and a missing or corrupt file is never fatal.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write the processed-hash snapshot atomically (temp file then rename)
    pub fn save_processed(&self, dedup: &Deduplicator) -> std::io::Result<()> {
        let snapshot = ProcessedSnapshot {
            saved_at: Utc::now(),
            entries: dedup
                .export_keys()
                .into_iter()
                .map(|(chain, hash, height)| ProcessedEntry {
                    chain,
                    hash: hash.to_string(),
                    height,
                })
                .collect(),
        };
        self.write_atomic(PROCESSED_FILE, &snapshot)
    }

    /// Reload processed hashes into the dedup table; returns how many loaded
    pub fn load_processed(&self, dedup: &Deduplicator) -> usize {
        let snapshot: ProcessedSnapshot = match self.read(PROCESSED_FILE) {
            Some(snapshot) => snapshot,
            None => return 0,
        };
        let keys: Vec<(Chain, BlockHash, u64)> = snapshot
            .entries
            .into_iter()
            .filter_map(|entry| {
                BlockHash::from_hex(&entry.hash)
                    .ok()
                    .map(|hash| (entry.chain, hash, entry.height))
            })
            .collect();
        let loaded = keys.len();
        dedup.import_keys(keys);
        if loaded > 0 {
            tracing::info!(loaded, "Warm restart: processed hashes restored");
        }
        loaded
    }

    pub fn save_endpoint_state(&self, manager: &Arc<ConnectionManager>) -> std::io::Result<()> {
        let mut endpoints = Vec::new();
        for endpoint in manager.registry().all() {
            endpoints.push(EndpointEntry {
                id: endpoint.id.clone(),
                is_healthy: manager.is_healthy(&endpoint.id),
            });
        }
        let snapshot = EndpointSnapshot {
            saved_at: Utc::now(),
            endpoints,
        };
        self.write_atomic(ENDPOINTS_FILE, &snapshot)
    }

    /// Seed endpoint health from the last run; the health checker corrects
    /// it within one probe round
    pub fn load_endpoint_state(&self, manager: &Arc<ConnectionManager>) -> usize {
        let snapshot: EndpointSnapshot = match self.read(ENDPOINTS_FILE) {
            Some(snapshot) => snapshot,
            None => return 0,
        };
        let mut restored = 0;
        for entry in snapshot.endpoints {
            manager.restore_health(&entry.id, entry.is_healthy);
            restored += 1;
        }
        restored
    }

    fn write_atomic<T: Serialize>(&self, name: &str, value: &T) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Option<T> {
        let path = self.dir.join(name);
        if !Path::new(&path).exists() {
            return None;
        }
        match std::fs::read_to_string(&path) {
            Ok(body) => match serde_json::from_str(&body) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(file = %path.display(), error = %err, "Ignoring corrupt state file");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(file = %path.display(), error = %err, "Could not read state file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::relay_config::DedupConfig;
    use crate::services::event::BlockEvent;

    #[test]
    fn test_processed_round_trip() {
        let dir = std::env::temp_dir().join(format!("relay-state-{}", uuid::Uuid::new_v4()));
        let store = StateStore::new(&dir);

        let dedup = Deduplicator::new(DedupConfig::default());
        dedup.check_and_record(&BlockEvent::new(
            Chain::Ethereum,
            BlockHash::new(vec![0xCD; 32]),
            42,
            "src",
        ));
        store.save_processed(&dedup).unwrap();

        let restored = Deduplicator::new(DedupConfig::default());
        assert_eq!(store.load_processed(&restored), 1);
        assert_eq!(restored.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_state_is_not_fatal() {
        let store = StateStore::new("/nonexistent/relay-state");
        let dedup = Deduplicator::new(DedupConfig::default());
        assert_eq!(store.load_processed(&dedup), 0);
    }

    #[test]
    fn test_corrupt_state_is_ignored() {
        let dir = std::env::temp_dir().join(format!("relay-state-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(PROCESSED_FILE), b"{not json").unwrap();

        let store = StateStore::new(&dir);
        let dedup = Deduplicator::new(DedupConfig::default());
        assert_eq!(store.load_processed(&dedup), 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
