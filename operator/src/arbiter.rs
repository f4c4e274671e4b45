//! Pure classification and replica-count arithmetic for the builder fleet.
//!
//! Nothing in this module touches the orchestrator: it consumes a snapshot
//! of pod observations and a pending-request backlog, and returns a
//! classification per pod plus a suggested replica count. The caller
//! (`lease::LeaseManager`) is responsible for turning that into an actual
//! `Scale` call and for any logging.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// One pod's classification, in the order checks are applied: a pod that
/// is both `Leased` and otherwise looks `Operational` is reported `Leased`,
/// because a live lease always dominates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    /// `manager-identity` belongs to a different controller incarnation.
    Unmanaged,
    /// `leased-by` is present and `manager-identity` matches this controller.
    Leased,
    Pending,
    PendingExpired,
    Starting,
    StartingExpired,
    Operational,
    OperationalExpired,
    /// Operational, but `expiry-time` could not be parsed as RFC3339.
    OperationalInvalidExpiry,
    Unusable,
}

impl BuilderState {
    /// States in which this pod may be handed out by the satisfier. Expired
    /// operational pods are still safe to lease: leasing clears `expiry-time`.
    pub fn is_leasable(&self) -> bool {
        matches!(
            self,
            BuilderState::Operational
                | BuilderState::OperationalExpired
                | BuilderState::OperationalInvalidExpiry
        )
    }

    /// States that count toward "keep this ordinal around" in the replica
    /// computation below.
    fn holds_ordinal(&self) -> bool {
        matches!(
            self,
            BuilderState::Leased
                | BuilderState::Pending
                | BuilderState::Starting
                | BuilderState::Operational
        )
    }
}

/// Readiness conditions read off a pod's `status.conditions`. All four must
/// be true for a pod to be `Operational`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub scheduled: bool,
    pub initialized: bool,
    pub containers_ready: bool,
    pub ready: bool,
}

impl Readiness {
    pub fn all_true(&self) -> bool {
        self.scheduled && self.initialized && self.containers_ready && self.ready
    }
}

/// A pod observation, pre-extracted from `k8s_openapi::api::core::v1::Pod`
/// so this module stays free of any orchestrator types.
#[derive(Debug, Clone)]
pub struct PodObservation {
    pub name: String,
    pub ordinal: i64,
    pub phase: String,
    pub readiness: Readiness,
    pub creation_time: DateTime<Utc>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    pub manager_id: Option<String>,
    /// `None` if the annotation is absent, `Some(Err(..))` if present but
    /// unparseable, `Some(Ok(..))` otherwise.
    pub expiry_time: Option<Result<DateTime<Utc>, ()>>,
}

/// Classifies a single pod given the controller's own identity and the
/// configured expiry window for non-operational states.
pub fn classify(
    obs: &PodObservation,
    controller_id: &str,
    now: DateTime<Utc>,
    expiry: Duration,
) -> BuilderState {
    if let Some(manager_id) = obs.manager_id.as_deref()
        && manager_id != controller_id
    {
        return BuilderState::Unmanaged;
    }

    if obs.leased_by.is_some() {
        return BuilderState::Leased;
    }

    let age = (now - obs.creation_time)
        .to_std()
        .unwrap_or(Duration::ZERO);

    match obs.phase.as_str() {
        "Pending" => {
            if age < expiry {
                BuilderState::Pending
            } else {
                BuilderState::PendingExpired
            }
        }
        "Running" => {
            if obs.deletion_timestamp.is_some() {
                return BuilderState::Unusable;
            }
            if obs.readiness.all_true() {
                classify_operational(obs, now, expiry)
            } else if age < expiry {
                BuilderState::Starting
            } else {
                BuilderState::StartingExpired
            }
        }
        _ => BuilderState::Unusable,
    }
}

fn classify_operational(obs: &PodObservation, now: DateTime<Utc>, expiry: Duration) -> BuilderState {
    match &obs.expiry_time {
        None => {
            let age = (now - obs.creation_time)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age > expiry {
                BuilderState::OperationalExpired
            } else {
                BuilderState::Operational
            }
        }
        Some(Err(())) => BuilderState::OperationalInvalidExpiry,
        Some(Ok(expiry_time)) => {
            if now > *expiry_time {
                BuilderState::OperationalExpired
            } else {
                BuilderState::Operational
            }
        }
    }
}

/// Computes the desired replica count given observations (which must be
/// ordered ascending by ordinal) and the size of the pending-request
/// backlog.
///
/// The scan stops at the first ordinal that does not hold a lease, a
/// pending/starting slot, or operational status: because the underlying
/// scaler only ever removes the *highest* ordinal, a pod above a
/// non-holding ordinal can never be preserved independently of it — to
/// reap ordinal `i`, every ordinal above `i` must go too. A single
/// down-scale therefore always prunes from the first reapable ordinal
/// upward; a later tick picks up any remaining backlog once the tail is
/// actually gone. Pruning the tail is always prioritized over expansion.
pub fn suggested_replicas(observations: &[BuilderState], requests: usize) -> usize {
    let mut keep_up_to = 0usize;
    let mut remaining = requests;

    for state in observations {
        if *state == BuilderState::Leased {
            keep_up_to += 1;
        } else if state.holds_ordinal() {
            keep_up_to += 1;
            if remaining > 0 {
                remaining -= 1;
            }
        } else {
            break;
        }
    }

    if observations.len() > keep_up_to {
        keep_up_to
    } else {
        keep_up_to + remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(ordinal: i64, age_secs: i64, phase: &str, ready: bool) -> PodObservation {
        PodObservation {
            name: format!("builder-{ordinal}"),
            ordinal,
            phase: phase.to_string(),
            readiness: Readiness {
                scheduled: ready,
                initialized: ready,
                containers_ready: ready,
                ready,
            },
            creation_time: Utc::now() - chrono::Duration::seconds(age_secs),
            deletion_timestamp: None,
            leased_by: None,
            manager_id: None,
            expiry_time: None,
        }
    }

    const EXPIRY: Duration = Duration::from_secs(600);
    const CTRL: &str = "ctrl-a";

    #[test]
    fn unmanaged_pod_from_a_foreign_controller_is_never_leasable() {
        let mut o = obs(0, 5, "Running", true);
        o.manager_id = Some("ctrl-b".to_string());
        let state = classify(&o, CTRL, Utc::now(), EXPIRY);
        assert_eq!(state, BuilderState::Unmanaged);
        assert!(!state.is_leasable());
    }

    #[test]
    fn leased_pod_dominates_even_if_it_also_looks_operational() {
        let mut o = obs(0, 5, "Running", true);
        o.leased_by = Some("owner-a".to_string());
        o.manager_id = Some(CTRL.to_string());
        assert_eq!(classify(&o, CTRL, Utc::now(), EXPIRY), BuilderState::Leased);
    }

    #[test]
    fn fresh_pending_pod_is_pending_not_expired() {
        let o = obs(0, 5, "Pending", false);
        assert_eq!(
            classify(&o, CTRL, Utc::now(), EXPIRY),
            BuilderState::Pending
        );
    }

    #[test]
    fn old_pending_pod_is_pending_expired() {
        let o = obs(0, 3_600, "Pending", false);
        assert_eq!(
            classify(&o, CTRL, Utc::now(), EXPIRY),
            BuilderState::PendingExpired
        );
    }

    #[test]
    fn running_but_not_ready_is_starting_until_expiry() {
        let o = obs(0, 5, "Running", false);
        assert_eq!(
            classify(&o, CTRL, Utc::now(), EXPIRY),
            BuilderState::Starting
        );
        let stale = obs(0, 3_600, "Running", false);
        assert_eq!(
            classify(&stale, CTRL, Utc::now(), EXPIRY),
            BuilderState::StartingExpired
        );
    }

    #[test]
    fn fully_ready_pod_with_no_expiry_annotation_is_operational_until_expiry() {
        let fresh = obs(0, 5, "Running", true);
        assert_eq!(
            classify(&fresh, CTRL, Utc::now(), EXPIRY),
            BuilderState::Operational
        );
        let stale = obs(0, 3_600, "Running", true);
        assert_eq!(
            classify(&stale, CTRL, Utc::now(), EXPIRY),
            BuilderState::OperationalExpired
        );
    }

    #[test]
    fn unparseable_expiry_annotation_is_reported_distinctly() {
        let mut o = obs(0, 5, "Running", true);
        o.expiry_time = Some(Err(()));
        let state = classify(&o, CTRL, Utc::now(), EXPIRY);
        assert_eq!(state, BuilderState::OperationalInvalidExpiry);
        assert!(state.is_leasable());
    }

    #[test]
    fn deletion_timestamp_makes_a_running_pod_unusable() {
        let mut o = obs(0, 5, "Running", true);
        o.deletion_timestamp = Some(Utc::now());
        assert_eq!(classify(&o, CTRL, Utc::now(), EXPIRY), BuilderState::Unusable);
    }

    #[test]
    fn unknown_phase_is_unusable() {
        let o = obs(0, 5, "Unknown", false);
        assert_eq!(classify(&o, CTRL, Utc::now(), EXPIRY), BuilderState::Unusable);
    }

    #[test]
    fn reap_tail_keeps_everything_up_to_the_last_holding_ordinal() {
        // 0 Leased, 1 future expiry (Operational), 2 fresh Operational, 3 Unmanaged.
        let observations = vec![
            BuilderState::Leased,
            BuilderState::Operational,
            BuilderState::Operational,
            BuilderState::Unmanaged,
        ];
        assert_eq!(suggested_replicas(&observations, 0), 3);
    }

    #[test]
    fn expired_middle_pod_forces_pruning_over_keeping_the_tail() {
        // 0 Leased, 1 Expired, 2 Operational: pruning must go back to 1,
        // so only ordinal 0 survives this tick.
        let observations = vec![
            BuilderState::Leased,
            BuilderState::OperationalExpired,
            BuilderState::Operational,
        ];
        assert_eq!(suggested_replicas(&observations, 0), 1);
    }

    #[test]
    fn empty_fleet_scales_up_to_match_the_backlog() {
        assert_eq!(suggested_replicas(&[], 3), 3);
    }

    #[test]
    fn backlog_is_only_consumed_by_ordinals_that_can_serve_it() {
        // One operational pod already serves one request; only the
        // remainder of the backlog drives expansion.
        let observations = vec![BuilderState::Operational];
        assert_eq!(suggested_replicas(&observations, 3), 3);
    }

    #[test]
    fn no_expansion_while_the_tail_still_needs_pruning() {
        let observations = vec![BuilderState::Operational, BuilderState::Unusable];
        assert_eq!(suggested_replicas(&observations, 5), 1);
    }
}
