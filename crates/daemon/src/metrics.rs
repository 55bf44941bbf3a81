//! Status snapshot for recstation
//!
//! Provides the shared status structs served by the metrics endpoint.

use crate::model::{Reservation, ReservationStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Reservation counts by status
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReservationCounts {
    pub reserved: usize,
    pub recording: usize,
    pub conflict: usize,
    pub skipped: usize,
}

impl ReservationCounts {
    pub fn tally<'a>(reservations: impl IntoIterator<Item = &'a Reservation>) -> Self {
        let mut counts = Self::default();
        for reservation in reservations {
            match reservation.status {
                ReservationStatus::Reserved => counts.reserved += 1,
                ReservationStatus::Recording => counts.recording += 1,
                ReservationStatus::Conflict => counts.conflict += 1,
                ReservationStatus::Skipped => counts.skipped += 1,
                ReservationStatus::Recorded => {}
            }
        }
        counts
    }
}

/// Encode supervisor counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EncodeCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Complete status snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub worker_running: bool,
    pub reservations: ReservationCounts,
    pub active_recordings: usize,
    pub encode: EncodeCounts,
    pub active_streams: usize,
}

/// Shared status state for concurrent access across daemon components
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// Creates a new SharedStatus instance with default values
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Program, ReserveOrigin};

    fn reservation(id: i64, status: ReservationStatus) -> Reservation {
        let program = Program {
            id,
            channel_id: 1,
            start_at: 0,
            end_at: 10,
            name: String::new(),
            description: None,
        };
        let mut r = Reservation::for_program(&program, ReserveOrigin::Manual, None);
        r.status = status;
        r
    }

    #[test]
    fn test_tally_counts_each_status() {
        let reservations = vec![
            reservation(1, ReservationStatus::Reserved),
            reservation(2, ReservationStatus::Reserved),
            reservation(3, ReservationStatus::Conflict),
            reservation(4, ReservationStatus::Skipped),
            reservation(5, ReservationStatus::Recording),
        ];

        let counts = ReservationCounts::tally(&reservations);
        assert_eq!(
            counts,
            ReservationCounts {
                reserved: 2,
                recording: 1,
                conflict: 1,
                skipped: 1,
            }
        );
    }

    #[test]
    fn test_snapshot_serializes_snake_case() {
        let json = serde_json::to_string(&StatusSnapshot::default()).unwrap();
        assert!(json.contains("timestamp_unix_ms"));
        assert!(json.contains("active_streams"));
        assert!(json.contains("\"encode\""));
    }
}
