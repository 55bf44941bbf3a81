//! Reservation scheduler.
//!
//! `recompute` is a pure function from (reservations, tuners) to an assignment.
//! `ReservationManager` owns the authoritative reservation set, serializes every
//! mutation, and re-runs the full recompute on each one. A mutation is applied
//! to a copy of the set; the copy replaces the authoritative set only after the
//! recompute and the store write succeeded, so readers never observe a
//! half-assigned schedule.

use crate::model::{
    EncodeOption, ProgramId, RecordedId, RecordedItem, ReserveAllId, ReserveLimit,
    ReserveOrigin, ReserveState, Reservation, ReservationStatus, RuleId, TimeWindow, Tuner,
    TunerId,
};
use crate::store::{Store, StoreError};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Error type for schedule computation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("Reservation {program_id} has an empty or inverted time window")]
    InvalidWindow { program_id: ProgramId },
}

/// Error type for reservation operations
#[derive(Debug, Error)]
pub enum ReserveError {
    #[error("Program {0} is not found")]
    ProgramNotFound(ProgramId),

    #[error("Reservation for program {0} is not found")]
    ReservationNotFound(ProgramId),

    #[error("Program {0} is already reserved")]
    AlreadyReserved(ProgramId),

    #[error("Reservation for program {0} is not skipped")]
    NotSkipped(ProgramId),

    #[error("Reservation for program {program_id} is {status}")]
    InvalidState {
        program_id: ProgramId,
        status: ReservationStatus,
    },

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of one full scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    /// Tuner for every scheduled or recording reservation.
    pub assignments: BTreeMap<ProgramId, TunerId>,
    /// Schedulable reservations that found no tuner, in priority order.
    pub conflicts: Vec<ProgramId>,
    /// Recordings whose tuner vanished or no longer covers the channel.
    pub failed_recordings: Vec<ProgramId>,
}

impl Schedule {
    pub fn tuner_for(&self, program_id: ProgramId) -> Option<TunerId> {
        self.assignments.get(&program_id).copied()
    }

    pub fn is_conflict(&self, program_id: ProgramId) -> bool {
        self.conflicts.contains(&program_id)
    }
}

/// Sort key: manual reservations first, then ascending start time, then program id.
fn priority_key(reservation: &Reservation) -> (u8, i64, ProgramId) {
    let origin_rank = if reservation.origin.is_manual() { 0 } else { 1 };
    (origin_rank, reservation.window.start_at, reservation.program_id)
}

/// Schedulable reservations in the order the scheduler serves them.
pub fn priority_order(reservations: &[Reservation]) -> Vec<&Reservation> {
    let mut ordered: Vec<&Reservation> = reservations
        .iter()
        .filter(|r| r.is_schedulable())
        .collect();
    ordered.sort_by_key(|r| priority_key(r));
    ordered
}

/// Compute the tuner assignment for a reservation set.
///
/// Recording reservations keep their tuner. Skipped and recorded reservations
/// take no tuner. Every other reservation is served in priority order and gets
/// the first tuner (in `tuners` order) that covers its channel and is idle for
/// its whole window; otherwise it is a conflict.
pub fn recompute(reservations: &[Reservation], tuners: &[Tuner]) -> Result<Schedule, ScheduleError> {
    for reservation in reservations {
        if !reservation.window.is_valid() {
            return Err(ScheduleError::InvalidWindow {
                program_id: reservation.program_id,
            });
        }
    }

    let mut schedule = Schedule::default();
    let mut busy: HashMap<TunerId, Vec<TimeWindow>> = HashMap::new();

    for reservation in reservations
        .iter()
        .filter(|r| r.status == ReservationStatus::Recording)
    {
        let pinned = reservation.tuner_id.and_then(|id| {
            tuners
                .iter()
                .find(|t| t.id == id && t.covers(reservation.channel_id))
        });

        match pinned {
            Some(tuner) => {
                busy.entry(tuner.id).or_default().push(reservation.window);
                schedule.assignments.insert(reservation.program_id, tuner.id);
            }
            None => schedule.failed_recordings.push(reservation.program_id),
        }
    }

    for reservation in priority_order(reservations) {
        let free = tuners.iter().find(|tuner| {
            tuner.covers(reservation.channel_id)
                && busy
                    .get(&tuner.id)
                    .map_or(true, |windows| !windows.iter().any(|w| w.overlaps(&reservation.window)))
        });

        match free {
            Some(tuner) => {
                busy.entry(tuner.id).or_default().push(reservation.window);
                schedule.assignments.insert(reservation.program_id, tuner.id);
            }
            None => schedule.conflicts.push(reservation.program_id),
        }
    }

    Ok(schedule)
}

/// Write a schedule back onto the reservations it was computed from.
fn apply_schedule(reservations: &mut BTreeMap<ProgramId, Reservation>, schedule: &Schedule) {
    for reservation in reservations.values_mut() {
        if !reservation.is_schedulable() {
            continue;
        }
        match schedule.tuner_for(reservation.program_id) {
            Some(tuner_id) => {
                reservation.status = ReservationStatus::Reserved;
                reservation.tuner_id = Some(tuner_id);
            }
            None => {
                reservation.status = ReservationStatus::Conflict;
                reservation.tuner_id = None;
            }
        }
    }
}

/// Hook fired after any reservation mutation.
pub type ClientNotifier = Arc<dyn Fn() + Send + Sync>;

/// Reservations that need the recorder's attention at a point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DueReservations {
    /// Scheduled reservations whose window has started.
    pub to_start: Vec<Reservation>,
    /// Recordings whose window has ended.
    pub to_finish: Vec<Reservation>,
    /// Reserved or conflicting reservations whose window passed unrecorded.
    pub expired: Vec<ProgramId>,
}

/// Outcome of a finished recording hand-off.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingHandoff {
    pub recorded_id: RecordedId,
    pub reservation: Reservation,
}

/// Owner of the authoritative reservation set.
pub struct ReservationManager {
    store: Arc<dyn Store>,
    tuners: Vec<Tuner>,
    reservations: Mutex<BTreeMap<ProgramId, Reservation>>,
    notifier: Option<ClientNotifier>,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn Store>, tuners: Vec<Tuner>) -> Self {
        Self {
            store,
            tuners,
            reservations: Mutex::new(BTreeMap::new()),
            notifier: None,
        }
    }

    /// Register the client-state-changed hook.
    pub fn with_notifier(mut self, notifier: ClientNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn tuners(&self) -> &[Tuner] {
        &self.tuners
    }

    /// Reload every reservation from the store and recompute from scratch.
    pub async fn resync(&self) -> Result<Schedule, ReserveError> {
        let mut current = self.reservations.lock().await;

        let mut candidate: BTreeMap<ProgramId, Reservation> = self
            .store
            .list_reservations()?
            .into_iter()
            .map(|r| (r.program_id, r))
            .collect();
        for reservation in candidate.values_mut() {
            if reservation.status == ReservationStatus::Conflict {
                reservation.status = ReservationStatus::Reserved;
            }
        }

        let schedule = self.commit(&current, &mut candidate)?;
        info!(
            reservations = candidate.len(),
            conflicts = schedule.conflicts.len(),
            "reservations resynced"
        );
        *current = candidate;
        drop(current);

        self.notify();
        Ok(schedule)
    }

    /// Reserve a program on user request.
    pub async fn add_reservation(
        &self,
        program_id: ProgramId,
        encode: Option<EncodeOption>,
    ) -> Result<ReservationStatus, ReserveError> {
        self.admit(program_id, ReserveOrigin::Manual, encode).await
    }

    /// Reserve a program matched by a recording rule.
    pub async fn add_rule_reservation(
        &self,
        program_id: ProgramId,
        rule_id: RuleId,
        encode: Option<EncodeOption>,
    ) -> Result<ReservationStatus, ReserveError> {
        self.admit(program_id, ReserveOrigin::Rule { rule_id }, encode)
            .await
    }

    async fn admit(
        &self,
        program_id: ProgramId,
        origin: ReserveOrigin,
        encode: Option<EncodeOption>,
    ) -> Result<ReservationStatus, ReserveError> {
        let program = self
            .store
            .find_program_by_id(program_id)?
            .ok_or(ReserveError::ProgramNotFound(program_id))?;

        let reservation = Reservation::for_program(&program, origin, encode);
        if !reservation.window.is_valid() {
            return Err(ScheduleError::InvalidWindow { program_id }.into());
        }

        let status = self
            .mutate(program_id, |set| {
                if set.contains_key(&program_id) {
                    return Err(ReserveError::AlreadyReserved(program_id));
                }
                set.insert(program_id, reservation);
                Ok(())
            })
            .await?
            .ok_or(ReserveError::ReservationNotFound(program_id))?;

        info!(program_id, ?origin, %status, "reservation added");
        Ok(status)
    }

    /// Cancel a reservation. Rule-generated reservations become skips so the
    /// rule does not re-add them; manual ones are deleted.
    pub async fn cancel_reservation(&self, program_id: ProgramId) -> Result<(), ReserveError> {
        self.mutate(program_id, |set| {
            let reservation = set
                .get_mut(&program_id)
                .ok_or(ReserveError::ReservationNotFound(program_id))?;
            ensure_not_recording(reservation)?;

            if reservation.origin.is_manual() {
                set.remove(&program_id);
            } else {
                reservation.status = ReservationStatus::Skipped;
                reservation.tuner_id = None;
            }
            Ok(())
        })
        .await?;

        info!(program_id, "reservation cancelled");
        Ok(())
    }

    /// Exclude a reservation from scheduling.
    pub async fn skip_reservation(&self, program_id: ProgramId) -> Result<(), ReserveError> {
        self.mutate(program_id, |set| {
            let reservation = set
                .get_mut(&program_id)
                .ok_or(ReserveError::ReservationNotFound(program_id))?;
            ensure_not_recording(reservation)?;

            reservation.status = ReservationStatus::Skipped;
            reservation.tuner_id = None;
            Ok(())
        })
        .await?;

        info!(program_id, "reservation skipped");
        Ok(())
    }

    /// Return a skipped reservation to the schedulable set.
    pub async fn remove_skip(&self, program_id: ProgramId) -> Result<ReservationStatus, ReserveError> {
        let status = self
            .mutate(program_id, |set| {
                let reservation = set
                    .get_mut(&program_id)
                    .ok_or(ReserveError::ReservationNotFound(program_id))?;
                if reservation.status != ReservationStatus::Skipped {
                    return Err(ReserveError::NotSkipped(program_id));
                }
                reservation.status = ReservationStatus::Reserved;
                Ok(())
            })
            .await?
            .ok_or(ReserveError::ReservationNotFound(program_id))?;

        info!(program_id, %status, "skip removed");
        Ok(status)
    }

    /// Mark a scheduled reservation as recording. Its tuner is pinned from now on.
    pub async fn begin_recording(&self, program_id: ProgramId) -> Result<Reservation, ReserveError> {
        self.mutate(program_id, |set| {
            let reservation = set
                .get_mut(&program_id)
                .ok_or(ReserveError::ReservationNotFound(program_id))?;
            if reservation.status != ReservationStatus::Reserved || reservation.tuner_id.is_none() {
                return Err(ReserveError::InvalidState {
                    program_id,
                    status: reservation.status,
                });
            }
            reservation.status = ReservationStatus::Recording;
            Ok(())
        })
        .await?;

        self.find(program_id)
            .await
            .ok_or(ReserveError::ReservationNotFound(program_id))
    }

    /// Hand a finished recording off to the store and drop the reservation.
    pub async fn finish_recording(
        &self,
        program_id: ProgramId,
        name: String,
        rec_path: Option<PathBuf>,
    ) -> Result<RecordingHandoff, ReserveError> {
        let mut handed_off = None;
        self.mutate(program_id, |set| {
            let mut reservation = set
                .remove(&program_id)
                .ok_or(ReserveError::ReservationNotFound(program_id))?;
            if reservation.status != ReservationStatus::Recording {
                let status = reservation.status;
                set.insert(program_id, reservation);
                return Err(ReserveError::InvalidState { program_id, status });
            }
            reservation.status = ReservationStatus::Recorded;
            handed_off = Some(reservation);
            Ok(())
        })
        .await?;

        let reservation = handed_off.ok_or(ReserveError::ReservationNotFound(program_id))?;
        let size = match &rec_path {
            Some(path) => tokio::fs::metadata(path).await.ok().map(|m| m.len()),
            None => None,
        };
        let recorded_id = self.store.add_recorded(RecordedItem {
            id: 0,
            program_id,
            channel_id: reservation.channel_id,
            name,
            rec_path,
            size,
        })?;

        info!(program_id, recorded_id, "recording handed off");
        Ok(RecordingHandoff {
            recorded_id,
            reservation,
        })
    }

    /// Drop a recording that failed. It is reported, never rescheduled.
    pub async fn fail_recording(&self, program_id: ProgramId, reason: &str) -> Result<(), ReserveError> {
        self.mutate(program_id, |set| {
            let reservation = set
                .get(&program_id)
                .ok_or(ReserveError::ReservationNotFound(program_id))?;
            if reservation.status != ReservationStatus::Recording {
                return Err(ReserveError::InvalidState {
                    program_id,
                    status: reservation.status,
                });
            }
            set.remove(&program_id);
            Ok(())
        })
        .await?;

        warn!(program_id, reason, "recording failed");
        Ok(())
    }

    /// Remove reservations whose window passed without being recorded.
    pub async fn drop_expired(&self, program_ids: &[ProgramId]) -> Result<(), ReserveError> {
        if program_ids.is_empty() {
            return Ok(());
        }

        let mut current = self.reservations.lock().await;
        let mut candidate = current.clone();
        for id in program_ids {
            if candidate.get(id).is_some_and(|r| r.is_schedulable()) {
                candidate.remove(id);
            }
        }
        self.commit(&current, &mut candidate)?;
        *current = candidate;
        drop(current);

        debug!(count = program_ids.len(), "expired reservations dropped");
        self.notify();
        Ok(())
    }

    /// Reservations that start, finish or expire at `now_ms`.
    pub async fn due(&self, now_ms: i64) -> DueReservations {
        let set = self.reservations.lock().await;
        let mut due = DueReservations::default();

        for reservation in set.values() {
            match reservation.status {
                ReservationStatus::Reserved if reservation.window.end_at <= now_ms => {
                    due.expired.push(reservation.program_id)
                }
                ReservationStatus::Reserved
                    if reservation.tuner_id.is_some() && reservation.window.contains(now_ms) =>
                {
                    due.to_start.push(reservation.clone())
                }
                ReservationStatus::Conflict if reservation.window.end_at <= now_ms => {
                    due.expired.push(reservation.program_id)
                }
                ReservationStatus::Recording if reservation.window.end_at <= now_ms => {
                    due.to_finish.push(reservation.clone())
                }
                _ => {}
            }
        }

        due
    }

    pub async fn find(&self, program_id: ProgramId) -> Option<Reservation> {
        self.reservations.lock().await.get(&program_id).cloned()
    }

    /// Program id to externally visible status.
    pub async fn get_all_status(&self) -> BTreeMap<ProgramId, ReserveState> {
        self.reservations
            .lock()
            .await
            .values()
            .filter_map(|r| {
                let state = match r.status {
                    ReservationStatus::Reserved | ReservationStatus::Recording => {
                        ReserveState::Reserve
                    }
                    ReservationStatus::Conflict => ReserveState::Conflict,
                    ReservationStatus::Skipped => ReserveState::Skip,
                    ReservationStatus::Recorded => return None,
                };
                Some((r.program_id, state))
            })
            .collect()
    }

    pub async fn all_id(&self) -> ReserveAllId {
        let mut all = ReserveAllId::default();
        for (program_id, state) in self.get_all_status().await {
            match state {
                ReserveState::Reserve => all.reserves.push(program_id),
                ReserveState::Conflict => all.conflicts.push(program_id),
                ReserveState::Skip => all.skips.push(program_id),
            }
        }
        all
    }

    pub async fn reserves(&self, limit: Option<usize>, offset: usize) -> ReserveLimit {
        self.page(limit, offset, |s| {
            matches!(s, ReservationStatus::Reserved | ReservationStatus::Recording)
        })
        .await
    }

    pub async fn conflicts(&self, limit: Option<usize>, offset: usize) -> ReserveLimit {
        self.page(limit, offset, |s| s == ReservationStatus::Conflict)
            .await
    }

    pub async fn skips(&self, limit: Option<usize>, offset: usize) -> ReserveLimit {
        self.page(limit, offset, |s| s == ReservationStatus::Skipped)
            .await
    }

    async fn page<F>(&self, limit: Option<usize>, offset: usize, filter: F) -> ReserveLimit
    where
        F: Fn(ReservationStatus) -> bool,
    {
        let set = self.reservations.lock().await;
        let mut matching: Vec<&Reservation> = set.values().filter(|r| filter(r.status)).collect();
        matching.sort_by_key(|r| (r.window.start_at, r.program_id));

        let total = matching.len();
        let reserves = matching
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        ReserveLimit { reserves, total }
    }

    /// Apply `f` to a copy of the set, recompute, persist, then swap it in.
    /// Returns the resulting status of `program_id`, or `None` once it left the set.
    async fn mutate<F>(
        &self,
        program_id: ProgramId,
        f: F,
    ) -> Result<Option<ReservationStatus>, ReserveError>
    where
        F: FnOnce(&mut BTreeMap<ProgramId, Reservation>) -> Result<(), ReserveError>,
    {
        let mut current = self.reservations.lock().await;
        let mut candidate = current.clone();
        f(&mut candidate)?;

        self.commit(&current, &mut candidate)?;
        let status = candidate.get(&program_id).map(|r| r.status);
        *current = candidate;
        drop(current);

        self.notify();
        Ok(status)
    }

    /// Recompute `candidate` and store it as one snapshot if it differs from
    /// `current`. Recordings that lost their tuner are dropped as failed.
    fn commit(
        &self,
        current: &BTreeMap<ProgramId, Reservation>,
        candidate: &mut BTreeMap<ProgramId, Reservation>,
    ) -> Result<Schedule, ReserveError> {
        let reservations: Vec<Reservation> = candidate.values().cloned().collect();
        let schedule = recompute(&reservations, &self.tuners)?;
        apply_schedule(candidate, &schedule);

        for program_id in &schedule.failed_recordings {
            candidate.remove(program_id);
            warn!(program_id, reason = "tuner no longer available", "recording failed");
        }

        if current != candidate {
            let rows: Vec<Reservation> = candidate.values().cloned().collect();
            self.store.replace_reservations(&rows)?;
        }

        Ok(schedule)
    }

    fn notify(&self) {
        if let Some(notifier) = &self.notifier {
            notifier();
        }
    }
}

fn ensure_not_recording(reservation: &Reservation) -> Result<(), ReserveError> {
    if reservation.status == ReservationStatus::Recording {
        return Err(ReserveError::InvalidState {
            program_id: reservation.program_id,
            status: reservation.status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelId, Program};
    use crate::store::MemoryStore;
    use crate::model::{EncodedId, EncodedItem};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const HOUR: i64 = 3_600_000;

    fn reservation(
        program_id: ProgramId,
        channel_id: ChannelId,
        start_at: i64,
        end_at: i64,
        origin: ReserveOrigin,
    ) -> Reservation {
        Reservation {
            program_id,
            channel_id,
            window: TimeWindow::new(start_at, end_at),
            origin,
            tuner_id: None,
            encode: None,
            status: ReservationStatus::Reserved,
        }
    }

    fn rule() -> ReserveOrigin {
        ReserveOrigin::Rule { rule_id: 1 }
    }

    fn program(id: ProgramId, channel_id: ChannelId, start_at: i64, end_at: i64) -> Program {
        Program {
            id,
            channel_id,
            start_at,
            end_at,
            name: format!("program {}", id),
            description: None,
        }
    }

    fn manager_with(programs: &[Program], tuners: Vec<Tuner>) -> (Arc<MemoryStore>, ReservationManager) {
        let store = Arc::new(MemoryStore::new());
        for p in programs {
            store.put_program(p.clone()).unwrap();
        }
        let manager = ReservationManager::new(store.clone(), tuners);
        (store, manager)
    }

    // Property: sequential, non-overlapping reservations on covered channels never conflict
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_disjoint_reservations_never_conflict(
            lengths in proptest::collection::vec(1i64..120, 1..20),
            tuner_count in 1u32..4,
            manual_mask in proptest::collection::vec(proptest::bool::ANY, 20),
        ) {
            let tuners: Vec<Tuner> = (0..tuner_count)
                .map(|id| Tuner::new(id, format!("T{}", id), [1, 2, 3]))
                .collect();

            let mut start = 0;
            let reservations: Vec<Reservation> = lengths
                .iter()
                .enumerate()
                .map(|(i, len)| {
                    let origin = if manual_mask[i] { ReserveOrigin::Manual } else { rule() };
                    let r = reservation(i as i64, (i % 3) as i64 + 1, start, start + len, origin);
                    start += len;
                    r
                })
                .collect();

            let schedule = recompute(&reservations, &tuners).unwrap();
            prop_assert!(schedule.conflicts.is_empty());
            prop_assert_eq!(schedule.assignments.len(), reservations.len());
        }

        #[test]
        fn prop_recompute_is_idempotent(
            specs in proptest::collection::vec((0i64..50, 1i64..30, 1i64..4, proptest::bool::ANY), 0..25),
            tuner_count in 1u32..4,
        ) {
            let tuners: Vec<Tuner> = (0..tuner_count)
                .map(|id| Tuner::new(id, "T", (1..=(id as i64 + 1)).collect::<Vec<_>>()))
                .collect();
            let reservations: Vec<Reservation> = specs
                .iter()
                .enumerate()
                .map(|(i, (start, len, ch, manual))| {
                    let origin = if *manual { ReserveOrigin::Manual } else { rule() };
                    reservation(i as i64, *ch, *start, start + len, origin)
                })
                .collect();

            let first = recompute(&reservations, &tuners).unwrap();
            let second = recompute(&reservations, &tuners).unwrap();
            prop_assert_eq!(&first, &second);

            // Feeding the applied result back in changes nothing either
            let mut applied: BTreeMap<ProgramId, Reservation> =
                reservations.iter().map(|r| (r.program_id, r.clone())).collect();
            apply_schedule(&mut applied, &first);
            let replay: Vec<Reservation> = applied.values().cloned().collect();
            prop_assert_eq!(recompute(&replay, &tuners).unwrap(), first);
        }

        #[test]
        fn prop_sole_tuner_overlap_conflicts_lower_priority(
            a_start in 0i64..100, a_len in 10i64..100,
            offset in 0i64..9,
            a_manual in proptest::bool::ANY,
            b_manual in proptest::bool::ANY,
        ) {
            let tuners = vec![Tuner::new(1, "T1", [1, 2])];
            let origin = |manual: bool| if manual { ReserveOrigin::Manual } else { rule() };
            let a = reservation(10, 1, a_start, a_start + a_len, origin(a_manual));
            let b = reservation(20, 2, a_start + offset, a_start + a_len + 5, origin(b_manual));

            let schedule = recompute(&[a.clone(), b.clone()], &tuners).unwrap();
            prop_assert_eq!(schedule.conflicts.len(), 1);

            let loser = if priority_key(&a) < priority_key(&b) { b.program_id } else { a.program_id };
            prop_assert_eq!(schedule.conflicts[0], loser);
        }
    }

    #[test]
    fn test_manual_outranks_rule_on_shared_tuner() {
        let tuners = vec![Tuner::new(1, "T1", [1, 2])];
        let r1 = reservation(1, 1, 10 * HOUR, 11 * HOUR, ReserveOrigin::Manual);
        let r2 = reservation(2, 2, 10 * HOUR + HOUR / 2, 11 * HOUR + HOUR / 2, rule());

        let schedule = recompute(&[r2, r1], &tuners).unwrap();

        assert_eq!(schedule.tuner_for(1), Some(1));
        assert_eq!(schedule.tuner_for(2), None);
        assert_eq!(schedule.conflicts, vec![2]);
    }

    #[test]
    fn test_rule_ties_broken_by_program_id() {
        let tuners = vec![Tuner::new(1, "T1", [1])];
        let a = reservation(8, 1, 0, HOUR, rule());
        let b = reservation(3, 1, 0, HOUR, rule());

        let schedule = recompute(&[a, b], &tuners).unwrap();
        assert_eq!(schedule.tuner_for(3), Some(1));
        assert_eq!(schedule.conflicts, vec![8]);
    }

    #[test]
    fn test_uncovered_channel_is_conflict() {
        let tuners = vec![Tuner::new(1, "GR", [1, 2])];
        let bs = reservation(1, 101, 0, HOUR, ReserveOrigin::Manual);

        let schedule = recompute(&[bs], &tuners).unwrap();
        assert!(schedule.is_conflict(1));
    }

    #[test]
    fn test_second_tuner_absorbs_overlap() {
        let tuners = vec![Tuner::new(1, "T1", [1]), Tuner::new(2, "T2", [1])];
        let a = reservation(1, 1, 0, HOUR, rule());
        let b = reservation(2, 1, 0, HOUR, rule());

        let schedule = recompute(&[a, b], &tuners).unwrap();
        assert_eq!(schedule.tuner_for(1), Some(1));
        assert_eq!(schedule.tuner_for(2), Some(2));
    }

    #[test]
    fn test_invalid_window_is_rejected() {
        let tuners = vec![Tuner::new(1, "T1", [1])];
        let bad = reservation(5, 1, HOUR, HOUR, ReserveOrigin::Manual);

        assert_eq!(
            recompute(&[bad], &tuners),
            Err(ScheduleError::InvalidWindow { program_id: 5 })
        );
    }

    #[test]
    fn test_recording_keeps_tuner_and_blocks_manual() {
        let tuners = vec![Tuner::new(1, "T1", [1])];
        let mut recording = reservation(1, 1, 0, 2 * HOUR, rule());
        recording.status = ReservationStatus::Recording;
        recording.tuner_id = Some(1);
        let manual = reservation(2, 1, HOUR, 3 * HOUR, ReserveOrigin::Manual);

        let schedule = recompute(&[recording, manual], &tuners).unwrap();
        assert_eq!(schedule.tuner_for(1), Some(1));
        assert!(schedule.is_conflict(2));
    }

    #[test]
    fn test_recording_is_not_migrated_when_tuner_disappears() {
        let tuners = vec![Tuner::new(2, "T2", [1])];
        let mut recording = reservation(1, 1, 0, HOUR, rule());
        recording.status = ReservationStatus::Recording;
        recording.tuner_id = Some(1);

        let schedule = recompute(&[recording], &tuners).unwrap();
        assert_eq!(schedule.failed_recordings, vec![1]);
        assert_eq!(schedule.tuner_for(1), None);
    }

    #[test]
    fn test_skipped_reservation_takes_no_tuner() {
        let tuners = vec![Tuner::new(1, "T1", [1])];
        let mut skipped = reservation(1, 1, 0, HOUR, ReserveOrigin::Manual);
        skipped.status = ReservationStatus::Skipped;
        let other = reservation(2, 1, 0, HOUR, rule());

        let schedule = recompute(&[skipped, other], &tuners).unwrap();
        assert_eq!(schedule.tuner_for(2), Some(1));
        assert!(schedule.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_add_reservation_reports_conflict() {
        let programs = [program(1, 1, 0, HOUR), program(2, 2, HOUR / 2, 2 * HOUR)];
        let (_store, manager) = manager_with(&programs, vec![Tuner::new(1, "T1", [1, 2])]);

        assert_eq!(
            manager.add_reservation(1, None).await.unwrap(),
            ReservationStatus::Reserved
        );
        assert_eq!(
            manager.add_rule_reservation(2, 7, None).await.unwrap(),
            ReservationStatus::Conflict
        );

        let all = manager.all_id().await;
        assert_eq!(all.reserves, vec![1]);
        assert_eq!(all.conflicts, vec![2]);
    }

    #[tokio::test]
    async fn test_manual_reservation_displaces_rule_reservation() {
        let programs = [program(1, 1, 0, HOUR), program(2, 1, 0, HOUR)];
        let (store, manager) = manager_with(&programs, vec![Tuner::new(1, "T1", [1])]);

        manager.add_rule_reservation(1, 3, None).await.unwrap();
        manager.add_reservation(2, None).await.unwrap();

        let status = manager.get_all_status().await;
        assert_eq!(status[&1], ReserveState::Conflict);
        assert_eq!(status[&2], ReserveState::Reserve);

        let persisted = store.find_reservation_by_id(1).unwrap().unwrap();
        assert_eq!(persisted.status, ReservationStatus::Conflict);
        assert_eq!(persisted.tuner_id, None);
    }

    #[tokio::test]
    async fn test_add_errors_are_typed() {
        let programs = [program(1, 1, 0, HOUR), program(2, 1, HOUR, HOUR)];
        let (_store, manager) = manager_with(&programs, vec![Tuner::new(1, "T1", [1])]);

        assert!(matches!(
            manager.add_reservation(99, None).await,
            Err(ReserveError::ProgramNotFound(99))
        ));

        manager.add_reservation(1, None).await.unwrap();
        assert!(matches!(
            manager.add_reservation(1, None).await,
            Err(ReserveError::AlreadyReserved(1))
        ));

        assert!(matches!(
            manager.add_reservation(2, None).await,
            Err(ReserveError::Schedule(ScheduleError::InvalidWindow { program_id: 2 }))
        ));
        assert!(manager.find(2).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_frees_tuner_for_conflict() {
        let programs = [program(1, 1, 0, HOUR), program(2, 1, 0, HOUR)];
        let (store, manager) = manager_with(&programs, vec![Tuner::new(1, "T1", [1])]);

        manager.add_reservation(1, None).await.unwrap();
        manager.add_rule_reservation(2, 1, None).await.unwrap();
        assert_eq!(manager.conflicts(None, 0).await.total, 1);

        manager.cancel_reservation(1).await.unwrap();

        assert!(store.find_reservation_by_id(1).unwrap().is_none());
        assert_eq!(manager.conflicts(None, 0).await.total, 0);
        assert_eq!(manager.find(2).await.unwrap().tuner_id, Some(1));
    }

    #[tokio::test]
    async fn test_cancel_rule_reservation_becomes_skip() {
        let programs = [program(1, 1, 0, HOUR)];
        let (_store, manager) = manager_with(&programs, vec![Tuner::new(1, "T1", [1])]);

        manager.add_rule_reservation(1, 4, None).await.unwrap();
        manager.cancel_reservation(1).await.unwrap();

        assert_eq!(manager.get_all_status().await[&1], ReserveState::Skip);
        assert_eq!(manager.skips(None, 0).await.total, 1);

        assert_eq!(
            manager.remove_skip(1).await.unwrap(),
            ReservationStatus::Reserved
        );
        assert!(matches!(
            manager.remove_skip(1).await,
            Err(ReserveError::NotSkipped(1))
        ));
    }

    #[tokio::test]
    async fn test_skip_and_missing_reservation() {
        let programs = [program(1, 1, 0, HOUR)];
        let (_store, manager) = manager_with(&programs, vec![Tuner::new(1, "T1", [1])]);

        assert!(matches!(
            manager.skip_reservation(1).await,
            Err(ReserveError::ReservationNotFound(1))
        ));
        assert!(matches!(
            manager.cancel_reservation(1).await,
            Err(ReserveError::ReservationNotFound(1))
        ));

        manager.add_reservation(1, None).await.unwrap();
        manager.skip_reservation(1).await.unwrap();
        assert_eq!(manager.find(1).await.unwrap().tuner_id, None);
    }

    #[tokio::test]
    async fn test_recording_lifecycle_hands_off() {
        let encode = EncodeOption {
            mode: 0,
            directory: None,
            del_ts: false,
        };
        let programs = [program(1, 1, 0, HOUR)];
        let (store, manager) = manager_with(&programs, vec![Tuner::new(1, "T1", [1])]);

        manager.add_reservation(1, Some(encode.clone())).await.unwrap();

        let due = manager.due(HOUR / 2).await;
        assert_eq!(due.to_start.len(), 1);

        let recording = manager.begin_recording(1).await.unwrap();
        assert_eq!(recording.status, ReservationStatus::Recording);
        assert!(matches!(
            manager.cancel_reservation(1).await,
            Err(ReserveError::InvalidState { .. })
        ));

        let due = manager.due(HOUR).await;
        assert_eq!(due.to_finish.len(), 1);

        let handoff = manager
            .finish_recording(1, "program 1".to_string(), None)
            .await
            .unwrap();
        assert_eq!(handoff.reservation.status, ReservationStatus::Recorded);
        assert_eq!(handoff.reservation.encode, Some(encode));
        assert!(manager.find(1).await.is_none());
        assert!(store.find_recorded_by_id(handoff.recorded_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fail_recording_drops_reservation() {
        let programs = [program(1, 1, 0, HOUR)];
        let (store, manager) = manager_with(&programs, vec![Tuner::new(1, "T1", [1])]);

        manager.add_reservation(1, None).await.unwrap();
        assert!(manager.fail_recording(1, "tuner lost").await.is_err());

        manager.begin_recording(1).await.unwrap();
        manager.fail_recording(1, "tuner lost").await.unwrap();

        assert!(manager.find(1).await.is_none());
        assert!(store.find_reservation_by_id(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_conflicts_are_dropped() {
        let programs = [program(1, 1, 0, HOUR), program(2, 1, 0, HOUR)];
        let (_store, manager) = manager_with(&programs, vec![Tuner::new(1, "T1", [1])]);

        manager.add_reservation(1, None).await.unwrap();
        manager.add_reservation(2, None).await.unwrap();

        let due = manager.due(2 * HOUR).await;
        assert_eq!(due.expired, vec![1, 2]);

        manager.drop_expired(&due.expired).await.unwrap();
        assert!(manager.get_all_status().await.is_empty());
    }

    #[tokio::test]
    async fn test_resync_recomputes_from_store() {
        let store = Arc::new(MemoryStore::new());
        let mut a = reservation(1, 1, 0, HOUR, rule());
        a.status = ReservationStatus::Conflict;
        store.upsert_reservation(&a).unwrap();
        store
            .upsert_reservation(&reservation(2, 1, 0, HOUR, ReserveOrigin::Manual))
            .unwrap();

        let manager = ReservationManager::new(store, vec![Tuner::new(1, "T1", [1])]);
        let schedule = manager.resync().await.unwrap();

        assert_eq!(schedule.tuner_for(2), Some(1));
        assert_eq!(schedule.conflicts, vec![1]);
    }

    #[tokio::test]
    async fn test_paging() {
        let programs: Vec<Program> = (1..=5).map(|i| program(i, 1, i * HOUR, (i + 1) * HOUR)).collect();
        let (_store, manager) = manager_with(&programs, vec![Tuner::new(1, "T1", [1])]);
        for p in &programs {
            manager.add_reservation(p.id, None).await.unwrap();
        }

        let page = manager.reserves(Some(2), 1).await;
        assert_eq!(page.total, 5);
        let ids: Vec<ProgramId> = page.reserves.iter().map(|r| r.program_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_notifier_fires_on_every_mutation() {
        let programs = [program(1, 1, 0, HOUR)];
        let store = Arc::new(MemoryStore::new());
        store.put_program(programs[0].clone()).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let manager = ReservationManager::new(store, vec![Tuner::new(1, "T1", [1])])
            .with_notifier(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        manager.add_reservation(1, None).await.unwrap();
        manager.skip_reservation(1).await.unwrap();
        manager.remove_skip(1).await.unwrap();
        let _ = manager.skip_reservation(99).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    /// Store whose reservation writes can be made to fail.
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            Ok(())
        }
    }

    impl Store for FlakyStore {
        fn find_program_by_id(&self, id: ProgramId) -> Result<Option<Program>, StoreError> {
            self.inner.find_program_by_id(id)
        }

        fn find_reservation_by_id(&self, id: ProgramId) -> Result<Option<Reservation>, StoreError> {
            self.inner.find_reservation_by_id(id)
        }

        fn list_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
            self.inner.list_reservations()
        }

        fn upsert_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
            self.check()?;
            self.inner.upsert_reservation(reservation)
        }

        fn delete_reservation(&self, id: ProgramId) -> Result<(), StoreError> {
            self.check()?;
            self.inner.delete_reservation(id)
        }

        fn replace_reservations(&self, reservations: &[Reservation]) -> Result<(), StoreError> {
            self.check()?;
            self.inner.replace_reservations(reservations)
        }

        fn find_recorded_by_id(&self, id: RecordedId) -> Result<Option<RecordedItem>, StoreError> {
            self.inner.find_recorded_by_id(id)
        }

        fn find_encoded_by_id(&self, id: EncodedId) -> Result<Option<EncodedItem>, StoreError> {
            self.inner.find_encoded_by_id(id)
        }

        fn add_recorded(&self, item: RecordedItem) -> Result<RecordedId, StoreError> {
            self.inner.add_recorded(item)
        }

        fn add_encoded(&self, item: EncodedItem) -> Result<EncodedId, StoreError> {
            self.inner.add_encoded(item)
        }

        fn set_recorded_path(&self, id: RecordedId, path: Option<PathBuf>) -> Result<bool, StoreError> {
            self.inner.set_recorded_path(id, path)
        }

        fn set_recorded_size(&self, id: RecordedId, size: Option<u64>) -> Result<bool, StoreError> {
            self.inner.set_recorded_size(id, size)
        }
    }

    #[tokio::test]
    async fn test_failed_store_write_keeps_previous_schedule() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_writes: AtomicBool::new(false),
        });
        store.inner.put_program(program(1, 1, 0, HOUR)).unwrap();
        store.inner.put_program(program(2, 1, 0, HOUR)).unwrap();
        let manager = ReservationManager::new(store.clone(), vec![Tuner::new(1, "T1", [1])]);

        manager.add_rule_reservation(1, 1, None).await.unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        let err = manager.add_reservation(2, None).await.unwrap_err();
        assert_eq!(err.to_string(), "Storage IO error: disk full");

        let in_memory = manager.find(1).await.unwrap();
        let stored = store.find_reservation_by_id(1).unwrap().unwrap();
        assert_eq!(in_memory, stored);
        assert_eq!(stored.status, ReservationStatus::Reserved);
        assert_eq!(stored.tuner_id, Some(1));
        assert!(manager.find(2).await.is_none());
        assert!(store.find_reservation_by_id(2).unwrap().is_none());

        store.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(
            manager.add_reservation(2, None).await.unwrap(),
            ReservationStatus::Reserved
        );
        assert_eq!(
            store.find_reservation_by_id(1).unwrap().unwrap().status,
            ReservationStatus::Conflict
        );
    }

    #[tokio::test]
    async fn test_resync_fails_recording_whose_tuner_is_gone() {
        let store = Arc::new(MemoryStore::new());
        let mut orphan = reservation(1, 1, 0, HOUR, rule());
        orphan.status = ReservationStatus::Recording;
        orphan.tuner_id = Some(9);
        store.upsert_reservation(&orphan).unwrap();
        store
            .upsert_reservation(&reservation(2, 1, 0, HOUR, ReserveOrigin::Manual))
            .unwrap();

        let manager = ReservationManager::new(store.clone(), vec![Tuner::new(1, "T1", [1])]);
        let schedule = manager.resync().await.unwrap();

        assert_eq!(schedule.failed_recordings, vec![1]);
        assert!(manager.find(1).await.is_none());
        assert!(store.find_reservation_by_id(1).unwrap().is_none());
        assert!(manager.due(HOUR).await.to_finish.is_empty());
        assert_eq!(manager.find(2).await.unwrap().tuner_id, Some(1));
    }

    #[tokio::test]
    async fn test_finished_recording_reports_no_status() {
        let programs = [program(1, 1, 0, HOUR)];
        let (_store, manager) = manager_with(&programs, vec![Tuner::new(1, "T1", [1])]);

        manager.add_reservation(1, None).await.unwrap();
        manager.begin_recording(1).await.unwrap();
        let status = manager
            .mutate(1, |set| {
                set.remove(&1);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(status, None);
    }
}
