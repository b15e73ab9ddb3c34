//! Fault triage for flow failures.
//!
//! Every error raised while executing an action batch or evaluating a
//! transition is admitted to the hospital before any flow-state mutation is
//! finalized. Diagnosis is a pure function over the error and the flow's
//! recent record, implemented as a prioritized table of staff members; the
//! first member with an opinion wins. Identical fault injections therefore
//! produce identical, testable disposition counts.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ActionError, ErrorKind};
use crate::flow::{FlowId, FlowRef};

/// What happens to a flow after diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry from the last checkpoint.
    Discharge,
    /// Park in `Suspended` for operator inspection; checkpoint retained,
    /// no further automatic retry.
    Observe,
    /// The flow is unwinding; retry the propagation step.
    Propagate,
    /// Best-effort bookkeeping failed; proceed as if it succeeded.
    Swallow,
}

/// Whether the flow was making forward progress or already unwinding to
/// report a failure when the error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPhase {
    Normal,
    Propagating,
}

/// Process-wide (or per-flow) disposition counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HospitalCounts {
    pub discharged: u64,
    pub discharged_retry: u64,
    pub observation: u64,
    pub propagated: u64,
    pub propagated_retry: u64,
}

impl HospitalCounts {
    /// True when no disposition has ever been recorded.
    pub fn all_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Default)]
struct Counters {
    discharged: AtomicU64,
    discharged_retry: AtomicU64,
    observation: AtomicU64,
    propagated: AtomicU64,
    propagated_retry: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> HospitalCounts {
        HospitalCounts {
            discharged: self.discharged.load(Ordering::Relaxed),
            discharged_retry: self.discharged_retry.load(Ordering::Relaxed),
            observation: self.observation.load(Ordering::Relaxed),
            propagated: self.propagated.load(Ordering::Relaxed),
            propagated_retry: self.propagated_retry.load(Ordering::Relaxed),
        }
    }
}

/// Per-flow diagnosis history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HospitalRecord {
    pub counts: HospitalCounts,
    /// Consecutive discharges for `last_signature` since the last
    /// successful step.
    pub consecutive_discharges: u32,
    pub last_signature: Option<String>,
}

impl HospitalRecord {
    fn consecutive_for(&self, signature: &str) -> u32 {
        match &self.last_signature {
            Some(last) if last == signature => self.consecutive_discharges,
            _ => 0,
        }
    }
}

/// A prioritized triage rule: the first staff member returning an opinion
/// decides the disposition.
///
/// `consecutive` is the number of discharges already granted for this error
/// signature; `budget` is the retry budget in force.
#[derive(Clone, Copy)]
pub struct StaffMember {
    pub name: &'static str,
    pub diagnose: fn(&ActionError, FlowPhase, u32, u32) -> Option<Disposition>,
}

impl std::fmt::Debug for StaffMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaffMember").field("name", &self.name).finish()
    }
}

fn bookkeeping_sister(
    error: &ActionError,
    _phase: FlowPhase,
    _consecutive: u32,
    _budget: u32,
) -> Option<Disposition> {
    error.best_effort.then_some(Disposition::Swallow)
}

fn propagation_specialist(
    _error: &ActionError,
    phase: FlowPhase,
    _consecutive: u32,
    _budget: u32,
) -> Option<Disposition> {
    (phase == FlowPhase::Propagating).then_some(Disposition::Propagate)
}

fn transient_nurse(
    error: &ActionError,
    _phase: FlowPhase,
    consecutive: u32,
    budget: u32,
) -> Option<Disposition> {
    matches!(
        error.kind,
        ErrorKind::StorageContention | ErrorKind::NetworkFault
    )
    .then(|| {
        if consecutive < budget {
            Disposition::Discharge
        } else {
            Disposition::Observe
        }
    })
}

fn integrity_specialist(
    error: &ActionError,
    _phase: FlowPhase,
    _consecutive: u32,
    _budget: u32,
) -> Option<Disposition> {
    (error.kind == ErrorKind::IntegrityViolation).then_some(Disposition::Observe)
}

/// The fault-triage subsystem.
///
/// Holds the staff table, the process-wide counters and the per-flow
/// records. Counters are created with the manager and reset only on process
/// restart; they are mutated exclusively through [`ErrorHospital::admit`]
/// and the two `note_*` methods, and read through the snapshot queries.
pub struct ErrorHospital {
    staff: Vec<StaffMember>,
    budget: u32,
    counters: Counters,
    records: Mutex<HashMap<FlowId, HospitalRecord>>,
}

impl ErrorHospital {
    /// Create a hospital with the default staff table and the given retry
    /// budget.
    pub fn new(budget: u32) -> Self {
        Self::with_staff(budget, Self::default_staff())
    }

    /// Create a hospital with a custom staff table. Entries are consulted
    /// in order; unmatched errors default to observation.
    pub fn with_staff(budget: u32, staff: Vec<StaffMember>) -> Self {
        Self {
            staff,
            budget,
            counters: Counters::default(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// The default staff table, in priority order.
    pub fn default_staff() -> Vec<StaffMember> {
        vec![
            StaffMember {
                name: "bookkeeping-sister",
                diagnose: bookkeeping_sister,
            },
            StaffMember {
                name: "propagation-specialist",
                diagnose: propagation_specialist,
            },
            StaffMember {
                name: "transient-nurse",
                diagnose: transient_nurse,
            },
            StaffMember {
                name: "integrity-specialist",
                diagnose: integrity_specialist,
            },
        ]
    }

    /// The retry budget in force.
    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Pure diagnosis: walk the staff table with the given consecutive
    /// discharge count. Does not touch counters or records.
    pub fn diagnose(
        &self,
        error: &ActionError,
        phase: FlowPhase,
        consecutive: u32,
    ) -> Disposition {
        for member in &self.staff {
            if let Some(disposition) = (member.diagnose)(error, phase, consecutive, self.budget) {
                debug!(
                    staff = member.name,
                    error = %error,
                    ?disposition,
                    consecutive,
                    "diagnosis"
                );
                return disposition;
            }
        }
        Disposition::Observe
    }

    /// Admit a failing flow: diagnose and record the disposition.
    ///
    /// Swallowed failures leave no trace: no counters, no record.
    pub fn admit(&self, flow: &FlowRef, error: &ActionError, phase: FlowPhase) -> Disposition {
        let signature = error.signature();
        let mut records = self.records.lock().unwrap();
        let consecutive = records
            .get(flow.flow_id())
            .map(|record| record.consecutive_for(&signature))
            .unwrap_or(0);

        let disposition = self.diagnose(error, phase, consecutive);

        if disposition == Disposition::Swallow {
            debug!(%flow, error = %error, "best-effort failure swallowed");
            return disposition;
        }

        let record = records.entry(flow.flow_id().clone()).or_default();
        match disposition {
            Disposition::Discharge => {
                self.counters.discharged.fetch_add(1, Ordering::Relaxed);
                record.counts.discharged += 1;
                record.consecutive_discharges = consecutive + 1;
                record.last_signature = Some(signature);
            }
            Disposition::Observe => {
                self.counters.observation.fetch_add(1, Ordering::Relaxed);
                record.counts.observation += 1;
                warn!(%flow, error = %error, "flow held for observation");
            }
            Disposition::Propagate => {
                self.counters.propagated_retry.fetch_add(1, Ordering::Relaxed);
                record.counts.propagated_retry += 1;
            }
            Disposition::Swallow => {}
        }

        disposition
    }

    /// Record a failure of the restart/reload path itself (the manager-level
    /// double fault).
    pub fn note_restart_failure(&self, flow: &FlowRef) {
        self.counters.discharged_retry.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock().unwrap();
        records.entry(flow.flow_id().clone()).or_default().counts.discharged_retry += 1;
    }

    /// Record that a flow's failure has been propagated (successfully or
    /// after exhausting the propagation budget).
    pub fn note_propagated(&self, flow: &FlowRef) {
        self.counters.propagated.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock().unwrap();
        records.entry(flow.flow_id().clone()).or_default().counts.propagated += 1;
    }

    /// Reset the consecutive-discharge streak after a successful step.
    pub fn note_recovered(&self, flow: &FlowRef) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(flow.flow_id()) {
            record.consecutive_discharges = 0;
            record.last_signature = None;
        }
    }

    /// Snapshot of the process-wide counters.
    pub fn counts(&self) -> HospitalCounts {
        self.counters.snapshot()
    }

    /// Snapshot of a single flow's record.
    pub fn record(&self, flow_id: &FlowId) -> Option<HospitalRecord> {
        self.records.lock().unwrap().get(flow_id).cloned()
    }
}

impl std::fmt::Debug for ErrorHospital {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHospital")
            .field("budget", &self.budget)
            .field("staff", &self.staff)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient(action: &str) -> ActionError {
        ActionError::new(ErrorKind::NetworkFault, action, "injected")
    }

    #[test]
    fn transient_errors_discharge_until_budget_then_observe() {
        let hospital = ErrorHospital::new(3);
        let flow = FlowRef::new("ping", "p-1");
        let error = transient("send-initial-message");

        for expected in 1..=3u64 {
            assert_eq!(
                hospital.admit(&flow, &error, FlowPhase::Normal),
                Disposition::Discharge
            );
            assert_eq!(hospital.counts().discharged, expected);
        }

        assert_eq!(
            hospital.admit(&flow, &error, FlowPhase::Normal),
            Disposition::Observe
        );
        assert_eq!(
            hospital.counts(),
            HospitalCounts {
                discharged: 3,
                observation: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn recovery_resets_the_consecutive_streak() {
        let hospital = ErrorHospital::new(3);
        let flow = FlowRef::new("ping", "p-1");
        let error = transient("send-initial-message");

        for _ in 0..2 {
            hospital.admit(&flow, &error, FlowPhase::Normal);
        }
        hospital.note_recovered(&flow);

        // Budget is per consecutive streak, not per lifetime
        for _ in 0..3 {
            assert_eq!(
                hospital.admit(&flow, &error, FlowPhase::Normal),
                Disposition::Discharge
            );
        }
        assert_eq!(hospital.counts().discharged, 5);
    }

    #[test]
    fn a_different_signature_starts_a_fresh_streak() {
        let hospital = ErrorHospital::new(3);
        let flow = FlowRef::new("ping", "p-1");

        for _ in 0..3 {
            hospital.admit(&flow, &transient("send-initial-message"), FlowPhase::Normal);
        }
        // Same flow, different failing action: budget not exhausted
        assert_eq!(
            hospital.admit(&flow, &transient("send-message"), FlowPhase::Normal),
            Disposition::Discharge
        );
    }

    #[test]
    fn integrity_violation_goes_straight_to_observation() {
        let hospital = ErrorHospital::new(3);
        let flow = FlowRef::new("ping", "p-1");
        let error = ActionError::new(ErrorKind::IntegrityViolation, "request-commit", "dup key");

        assert_eq!(
            hospital.admit(&flow, &error, FlowPhase::Normal),
            Disposition::Observe
        );
        assert_eq!(hospital.counts().observation, 1);
        assert_eq!(hospital.counts().discharged, 0);
    }

    #[test]
    fn best_effort_failures_are_swallowed_without_counters() {
        let hospital = ErrorHospital::new(3);
        let flow = FlowRef::new("ping", "p-1");
        let mut error = transient("acknowledge-messages");
        error.best_effort = true;

        for _ in 0..5 {
            assert_eq!(
                hospital.admit(&flow, &error, FlowPhase::Normal),
                Disposition::Swallow
            );
        }
        assert!(hospital.counts().all_zero());
        assert!(hospital.record(flow.flow_id()).is_none());
    }

    #[test]
    fn errors_while_unwinding_are_propagation_retries() {
        let hospital = ErrorHospital::new(3);
        let flow = FlowRef::new("failing", "f-1");
        let error = transient("propagate-error");

        for expected in 1..=3u64 {
            assert_eq!(
                hospital.admit(&flow, &error, FlowPhase::Propagating),
                Disposition::Propagate
            );
            assert_eq!(hospital.counts().propagated_retry, expected);
        }
        hospital.note_propagated(&flow);
        assert_eq!(
            hospital.counts(),
            HospitalCounts {
                propagated: 1,
                propagated_retry: 3,
                ..Default::default()
            }
        );
    }

    #[test]
    fn unmatched_errors_default_to_observation() {
        let hospital = ErrorHospital::new(3);
        let error = ActionError::new(ErrorKind::Internal, "mystery", "?");
        assert_eq!(
            hospital.diagnose(&error, FlowPhase::Normal, 0),
            Disposition::Observe
        );
    }

    #[test]
    fn diagnosis_is_deterministic() {
        // Repeated runs over the same inputs produce the same dispositions:
        // triage depends only on (error kind, phase, consecutive, budget).
        let hospital = ErrorHospital::new(3);
        let error = transient("send-initial-message");

        let run = || {
            (0..6)
                .map(|consecutive| hospital.diagnose(&error, FlowPhase::Normal, consecutive))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
        assert_eq!(
            run(),
            vec![
                Disposition::Discharge,
                Disposition::Discharge,
                Disposition::Discharge,
                Disposition::Observe,
                Disposition::Observe,
                Disposition::Observe,
            ]
        );
    }

    #[test]
    fn per_flow_records_track_their_own_counts() {
        let hospital = ErrorHospital::new(3);
        let a = FlowRef::new("ping", "a");
        let b = FlowRef::new("ping", "b");

        hospital.admit(&a, &transient("send-initial-message"), FlowPhase::Normal);
        hospital.admit(&b, &transient("send-initial-message"), FlowPhase::Normal);
        hospital.admit(&b, &transient("send-initial-message"), FlowPhase::Normal);

        assert_eq!(hospital.record(a.flow_id()).unwrap().counts.discharged, 1);
        assert_eq!(hospital.record(b.flow_id()).unwrap().counts.discharged, 2);
        assert_eq!(hospital.counts().discharged, 3);
    }
}
