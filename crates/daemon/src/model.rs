//! Reservation and tuner model.
//!
//! Programs are read-only broadcast units sourced from the EPG. Reservations are
//! requests to record them; tuners are the exclusive capture resources the
//! scheduler hands out.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

pub type ProgramId = i64;
pub type ChannelId = i64;
pub type TunerId = u32;
pub type RuleId = i64;
pub type RecordedId = i64;
pub type EncodedId = i64;

/// Half-open time window `[start, end)` in Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub start_at: i64,
    pub end_at: i64,
}

impl TimeWindow {
    pub fn new(start_at: i64, end_at: i64) -> Self {
        Self { start_at, end_at }
    }

    /// A window is schedulable only if it has a positive duration.
    pub fn is_valid(&self) -> bool {
        self.end_at > self.start_at
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start_at < other.end_at && other.start_at < self.end_at
    }

    pub fn contains(&self, at: i64) -> bool {
        self.start_at <= at && at < self.end_at
    }
}

/// Immutable broadcast unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub id: ProgramId,
    pub channel_id: ChannelId,
    pub start_at: i64,
    pub end_at: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Program {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start_at, self.end_at)
    }
}

/// Status of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Holds a tuner and waits for its window.
    Reserved,
    /// Capture in progress.
    Recording,
    /// Capture finished and handed off.
    Recorded,
    /// Excluded by the user; never scheduled.
    Skipped,
    /// No tuner is free for the window.
    Conflict,
}

impl Default for ReservationStatus {
    fn default() -> Self {
        Self::Reserved
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationStatus::Reserved => write!(f, "reserved"),
            ReservationStatus::Recording => write!(f, "recording"),
            ReservationStatus::Recorded => write!(f, "recorded"),
            ReservationStatus::Skipped => write!(f, "skipped"),
            ReservationStatus::Conflict => write!(f, "conflict"),
        }
    }
}

/// Who asked for the reservation. Manual reservations outrank rule-generated ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ReserveOrigin {
    Manual,
    Rule { rule_id: RuleId },
}

impl ReserveOrigin {
    pub fn is_manual(&self) -> bool {
        matches!(self, ReserveOrigin::Manual)
    }
}

/// Encoding requested once the recording completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeOption {
    /// Index into the configured encode presets.
    pub mode: usize,
    /// Sub-directory of the encode output directory.
    #[serde(default)]
    pub directory: Option<String>,
    /// Delete the source recording after a successful encode.
    #[serde(default)]
    pub del_ts: bool,
}

/// A request to record a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub program_id: ProgramId,
    pub channel_id: ChannelId,
    pub window: TimeWindow,
    pub origin: ReserveOrigin,
    #[serde(default)]
    pub tuner_id: Option<TunerId>,
    #[serde(default)]
    pub encode: Option<EncodeOption>,
    #[serde(default)]
    pub status: ReservationStatus,
}

impl Reservation {
    /// Create a fresh reservation for a program.
    pub fn for_program(
        program: &Program,
        origin: ReserveOrigin,
        encode: Option<EncodeOption>,
    ) -> Self {
        Self {
            program_id: program.id,
            channel_id: program.channel_id,
            window: program.window(),
            origin,
            tuner_id: None,
            encode,
            status: ReservationStatus::Reserved,
        }
    }

    /// Reservations the scheduler may (re)assign on every recompute.
    pub fn is_schedulable(&self) -> bool {
        matches!(
            self.status,
            ReservationStatus::Reserved | ReservationStatus::Conflict
        )
    }
}

/// A capture resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuner {
    pub id: TunerId,
    pub name: String,
    pub channels: BTreeSet<ChannelId>,
}

impl Tuner {
    pub fn new(id: TunerId, name: impl Into<String>, channels: impl IntoIterator<Item = ChannelId>) -> Self {
        Self {
            id,
            name: name.into(),
            channels: channels.into_iter().collect(),
        }
    }

    pub fn covers(&self, channel_id: ChannelId) -> bool {
        self.channels.contains(&channel_id)
    }
}

impl From<&recstation_config::TunerConfig> for Tuner {
    fn from(cfg: &recstation_config::TunerConfig) -> Self {
        Tuner::new(cfg.id, cfg.name.clone(), cfg.channels.iter().copied())
    }
}

/// A finished recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedItem {
    pub id: RecordedId,
    pub program_id: ProgramId,
    pub channel_id: ChannelId,
    pub name: String,
    /// Source file; None once the ts has been deleted.
    pub rec_path: Option<PathBuf>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// An encoded variant of a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedItem {
    pub id: EncodedId,
    pub recorded_id: RecordedId,
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Program ids grouped by status, for clients that mark up a guide.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReserveAllId {
    pub reserves: Vec<ProgramId>,
    pub conflicts: Vec<ProgramId>,
    pub skips: Vec<ProgramId>,
}

/// One page of reservations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReserveLimit {
    pub reserves: Vec<Reservation>,
    pub total: usize,
}

/// Externally visible reservation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveState {
    Reserve,
    Conflict,
    Skip,
}

/// Current Unix time in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
