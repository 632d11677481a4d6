//! Core data model: sources, occurrences, hash statistics, and decisions.
//!
//! These are semantic types (§3 of the design doc), not storage schemas —
//! `index::PgIndex` maps them onto concrete tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Fixed-width landmark hash: `(f_anchor, f_target, delta_t)` packed into 32
/// bits and rendered as a 10-character lowercase hex string. The wire format
/// is the hex string; the packed `u32` is kept alongside for cheap grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashToken(pub u32);

impl HashToken {
    /// Bits allotted to each anchor/target frequency bin.
    pub const FREQ_BITS: u32 = 10;
    /// Bits allotted to the time delta between anchor and target.
    pub const DELTA_T_BITS: u32 = 12;

    pub fn pack(freq_anchor: u32, freq_target: u32, delta_t: u32) -> Self {
        let f1 = freq_anchor & ((1 << Self::FREQ_BITS) - 1);
        let f2 = freq_target & ((1 << Self::FREQ_BITS) - 1);
        let dt = delta_t & ((1 << Self::DELTA_T_BITS) - 1);
        let packed = (f1 << (Self::FREQ_BITS + Self::DELTA_T_BITS)) | (f2 << Self::DELTA_T_BITS) | dt;
        HashToken(packed)
    }

    /// Render as the 10-character lowercase hex token used on the wire.
    pub fn to_hex(self) -> String {
        format!("{:010x}", self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(format!("{:0>8}", s.trim_start_matches("0x")))?;
        let mut buf = [0u8; 4];
        let start = bytes.len().saturating_sub(4);
        buf.copy_from_slice(&bytes[start..]);
        Ok(HashToken(u32::from_be_bytes(buf)))
    }
}

impl fmt::Display for HashToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Lifecycle status of a `Source`. Transitions are monotonic: once a source
/// reaches one of the terminal variants it is never revised by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Unclaimed,
    Pending,
    Fingerprinted,
    Matched,
    TooShort,
    Flagged,
}

impl SourceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SourceStatus::Unclaimed | SourceStatus::Pending)
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            SourceStatus::Unclaimed => "unclaimed",
            SourceStatus::Pending => "pending",
            SourceStatus::Fingerprinted => "fingerprinted",
            SourceStatus::Matched => "matched",
            SourceStatus::TooShort => "too_short",
            SourceStatus::Flagged => "flagged",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "unclaimed" => SourceStatus::Unclaimed,
            "pending" => SourceStatus::Pending,
            "fingerprinted" => SourceStatus::Fingerprinted,
            "matched" => SourceStatus::Matched,
            "too_short" => SourceStatus::TooShort,
            "flagged" => SourceStatus::Flagged,
            _ => return None,
        })
    }
}

/// One canonical audio asset, identified by an opaque id and an external
/// (YouTube) id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub external_id: String,
    pub title: String,
    pub duration_ms: i64,
    pub original_ref: Option<Uuid>,
    pub status: SourceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Opaque keyset cursor for `claim_next`, over `(duration_ms DESC, id DESC)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCursor {
    pub last_duration_ms: i64,
    pub last_id: Uuid,
}

/// One emission of a landmark hash at one time inside one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub hash: HashToken,
    pub source_id: Uuid,
    pub t_ref: u32,
}

/// Maintained aggregate over `Occurrence`s, used for stop-word suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashStat {
    pub total_count: i64,
    pub source_count: i64,
}

/// Decision returned by the candidate search for a single query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    pub matched: bool,
    pub source_id: Option<Uuid>,
    pub offset_ms: Option<i64>,
    pub score: f32,
}

impl MatchDecision {
    pub fn no_match() -> Self {
        MatchDecision { matched: false, source_id: None, offset_ms: None, score: 0.0 }
    }
}

/// A `(source_id, delta)` bucket surviving pre-filter and Δ-smoothing,
/// ranked by merged hash-hit count (§4.4 steps 4-7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateBucket {
    pub source_id: Uuid,
    pub delta_frames: i64,
    pub count: usize,
}
