use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Maximum tolerated gap between source-reported block time and our own clock
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Bitcoin,
    Ethereum,
    Solana,
}

impl Chain {
    pub const ALL: [Chain; 3] = [Chain::Bitcoin, Chain::Ethereum, Chain::Solana];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Bitcoin => "bitcoin",
            Chain::Ethereum => "ethereum",
            Chain::Solana => "solana",
        }
    }

    /// Expected identity-hash length in bytes
    pub fn hash_len(&self) -> usize {
        32
    }

    /// Nominal interblock interval, used to seed adaptive timing before
    /// real observations arrive
    pub fn nominal_interblock(&self) -> Duration {
        match self {
            Chain::Bitcoin => Duration::from_secs(600),
            Chain::Ethereum => Duration::from_secs(12),
            Chain::Solana => Duration::from_millis(400),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bitcoin" | "btc" => Ok(Chain::Bitcoin),
            "ethereum" | "eth" => Ok(Chain::Ethereum),
            "solana" | "sol" => Ok(Chain::Solana),
            other => Err(format!("Unknown chain: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    P2p,
    Rpc,
    Ws,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::P2p => f.write_str("p2p"),
            Transport::Rpc => f.write_str("rpc"),
            Transport::Ws => f.write_str("ws"),
        }
    }
}

/// Opaque chain-specific block identity
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(Vec<u8>);

impl BlockHash {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let trimmed = s.trim_start_matches("0x");
        Ok(Self(hex::decode(trimmed)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First byte of the hash, used to shard advisory locks
    pub fn shard_byte(&self) -> u8 {
        self.0.first().copied().unwrap_or(0)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

// Debug as hex so hashes log readably instead of as byte lists
impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Orphaned,
}

impl BlockStatus {
    /// Whether `next` is a legal forward transition.
    /// The sequence is pending -> processing -> {processed | failed | orphaned}
    pub fn can_advance_to(&self, next: BlockStatus) -> bool {
        matches!(
            (self, next),
            (BlockStatus::Pending, BlockStatus::Processing)
                | (BlockStatus::Processing, BlockStatus::Processed)
                | (BlockStatus::Processing, BlockStatus::Failed)
                | (BlockStatus::Processing, BlockStatus::Orphaned)
        )
    }
}

/// The canonical unit of observation flowing through the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEvent {
    pub chain: Chain,
    pub hash: BlockHash,
    /// May be 0 if unknown at ingest
    pub height: u64,
    /// Source-reported block time
    pub timestamp: DateTime<Utc>,
    /// Wall-clock time this instance observed the event
    pub detected_at: DateTime<Utc>,
    /// Identifier of the upstream endpoint that delivered it
    pub source_id: String,
    /// True if only the header was received (fast path)
    pub is_header_only: bool,
    pub size_bytes: Option<u64>,
    pub status: BlockStatus,
}

impl BlockEvent {
    pub fn new(chain: Chain, hash: BlockHash, height: u64, source_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            chain,
            hash,
            height,
            timestamp: now,
            detected_at: now,
            source_id: source_id.into(),
            is_header_only: false,
            size_bytes: None,
            status: BlockStatus::Pending,
        }
    }

    pub fn header_only(mut self) -> Self {
        self.is_header_only = true;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    /// Identity key within the deduplication window
    pub fn dedupe_key(&self) -> (Chain, BlockHash) {
        (self.chain, self.hash.clone())
    }

    /// Advance status along the legal sequence; illegal transitions are
    /// rejected so a processed event can never regress
    pub fn advance_status(&mut self, next: BlockStatus) -> Result<(), ValidationError> {
        if self.status.can_advance_to(next) {
            self.status = next;
            Ok(())
        } else {
            Err(ValidationError::IllegalStatusTransition {
                from: self.status,
                to: next,
            })
        }
    }

    /// Field-level and cross-field checks applied by pipeline workers
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.hash.is_empty() {
            return Err(ValidationError::EmptyHash);
        }
        if self.hash.len() != self.chain.hash_len() {
            return Err(ValidationError::HashLength {
                chain: self.chain,
                expected: self.chain.hash_len(),
                actual: self.hash.len(),
            });
        }
        let skew = ChronoDuration::seconds(CLOCK_SKEW_TOLERANCE_SECS);
        if self.detected_at < self.timestamp - skew {
            return Err(ValidationError::ClockSkew {
                timestamp: self.timestamp,
                detected_at: self.detected_at,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("Block hash is empty")]
    EmptyHash,
    #[error("Bad hash length for {chain}: expected {expected} bytes, got {actual}")]
    HashLength {
        chain: Chain,
        expected: usize,
        actual: usize,
    },
    #[error("Clock skew violation: block time {timestamp} is ahead of detection {detected_at}")]
    ClockSkew {
        timestamp: DateTime<Utc>,
        detected_at: DateTime<Utc>,
    },
    #[error("Illegal status transition: {from:?} -> {to:?}")]
    IllegalStatusTransition { from: BlockStatus, to: BlockStatus },
}

/// Outcome of pushing an event into the ingestion pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitResult {
    Accepted,
    DroppedDuplicate,
    DroppedBackpressure,
}
