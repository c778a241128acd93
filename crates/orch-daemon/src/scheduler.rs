//! The dependency-aware Unit scheduler.
//!
//! Owns the single mutable picture of unit runtime state: the status map,
//! the FIFO ready queue (with its companion membership set so a unit is
//! never double-enqueued), and the parallelism bound. All mutation happens
//! through [`Scheduler::dispatch`], [`Scheduler::complete`], and
//! [`Scheduler::fail`], each of which goes through the single
//! [`Scheduler::transition_rt`] chokepoint — illegal transitions are
//! programmer errors and panic rather than return an error, per the
//! engine's error taxonomy for invariant violations.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use at_core::events::{Event, EventKind, EventSender};
use at_core::types::{Unit, UnitRuntime, UnitStatus};

/// The result of a single, non-blocking `dispatch()` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A unit was popped off the ready queue and transitioned to `in_progress`.
    Dispatched(String),
    /// `active_count >= parallelism`; try again once something completes.
    AtCapacity,
    /// Every unit is `complete`.
    AllComplete,
    /// Every non-complete unit is `failed` or `blocked`; no further progress
    /// is possible.
    AllBlocked,
    /// Nothing is ready right now, but units are still active or pending on
    /// in-flight dependencies.
    NoReadyUnits,
}

struct State {
    status: HashMap<String, UnitRuntime>,
    ready_queue: VecDeque<String>,
    ready_set: HashSet<String>,
}

pub struct Scheduler {
    /// Forward adjacency: unit id -> the unit ids it depends on.
    depends_on: HashMap<String, HashSet<String>>,
    /// Reverse adjacency: unit id -> the unit ids that depend on it.
    dependents: HashMap<String, HashSet<String>>,
    parallelism: usize,
    bus: EventSender,
    state: Mutex<State>,
}

impl Scheduler {
    /// Build a scheduler from a validated unit list with no prior recorded
    /// state — every unit starts `pending`; units with no dependencies are
    /// immediately promoted to `ready` and enqueued in sorted-by-id order,
    /// which is what makes dispatch order deterministic for a given input.
    pub fn new(units: &[Unit], parallelism: usize, bus: EventSender) -> Self {
        Self::with_recovered(units, parallelism, bus, &HashMap::new())
    }

    /// Build a scheduler seeding runtime state from `recovered` — the
    /// on-disk `orch_status` (and `blocked_by`) of each unit from a prior
    /// run, read via [`at_core::state_writer::read_recovered_unit`]. A unit
    /// recovered as `complete`/`failed`/`blocked` is restored terminal and
    /// never re-dispatched; a unit recovered as `in_progress` or one of the
    /// PR phases is restored active (it consumes a parallelism slot
    /// immediately) so the caller can resume it directly by its recorded
    /// branch/worktree/PR number instead of running `dispatch()` for it.
    /// Units with no recorded status (never dispatched before) fall back to
    /// the from-scratch dependency computation.
    pub fn with_recovered(
        units: &[Unit],
        parallelism: usize,
        bus: EventSender,
        recovered: &HashMap<String, UnitStatus>,
    ) -> Self {
        let mut depends_on = HashMap::new();
        let mut dependents: HashMap<String, HashSet<String>> = HashMap::new();
        let mut status = HashMap::new();

        let mut ids: Vec<String> = units.iter().map(|u| u.id.clone()).collect();
        ids.sort();

        for unit in units {
            dependents.entry(unit.id.clone()).or_default();
            depends_on.insert(unit.id.clone(), unit.depends_on.iter().cloned().collect());
            status.insert(unit.id.clone(), UnitRuntime::default());
        }
        for unit in units {
            for dep in &unit.depends_on {
                dependents.entry(dep.clone()).or_default().insert(unit.id.clone());
            }
        }

        // Only terminal and active recorded statuses are trusted verbatim —
        // those are exactly the ones a restart must not re-derive (a
        // `complete` unit must stay complete; an `in_progress`/PR-phase unit
        // must stay active so the caller can resume it by its recorded
        // branch/PR rather than recomputing anything). A recorded `pending`
        // or `ready` carries no extra information over recomputing from the
        // dependency graph, so those fall through to the same readiness
        // pass every from-scratch unit goes through below.
        for id in &ids {
            if let Some(&recovered_status) = recovered.get(id) {
                if recovered_status.is_terminal() || recovered_status.is_active() {
                    status.get_mut(id).expect("unit present").status = recovered_status;
                }
            }
        }

        let mut ready_queue = VecDeque::new();
        let mut ready_set = HashSet::new();
        for id in &ids {
            if status[id].status != UnitStatus::Pending {
                continue;
            }
            let all_deps_complete = depends_on[id]
                .iter()
                .all(|dep| status.get(dep).map(|rt| rt.status) == Some(UnitStatus::Complete));
            if all_deps_complete {
                let rt = status.get_mut(id).expect("unit present");
                Self::transition_rt(rt, UnitStatus::Ready);
                ready_queue.push_back(id.clone());
                ready_set.insert(id.clone());
            }
        }

        let scheduler = Self {
            depends_on,
            dependents,
            parallelism,
            bus,
            state: Mutex::new(State { status, ready_queue, ready_set }),
        };
        for id in &ids {
            if scheduler.state.lock().unwrap().ready_set.contains(id) {
                scheduler.bus.emit(Event::for_unit(EventKind::UnitQueued, id.clone()));
            }
        }
        scheduler
    }

    /// A single non-blocking attempt to start one unit.
    pub fn dispatch(&self) -> DispatchOutcome {
        let mut state = self.state.lock().expect("scheduler state poisoned");

        let active = state.status.values().filter(|rt| rt.status.is_active()).count();
        if active >= self.parallelism {
            return DispatchOutcome::AtCapacity;
        }

        if let Some(id) = state.ready_queue.pop_front() {
            state.ready_set.remove(&id);
            let rt = state.status.get_mut(&id).expect("unit present");
            Self::transition_rt(rt, UnitStatus::InProgress);
            rt.started_at = Some(chrono::Utc::now());
            self.bus.emit(Event::for_unit(EventKind::UnitStarted, id.clone()));
            return DispatchOutcome::Dispatched(id);
        }

        if state.status.values().all(|rt| rt.status == UnitStatus::Complete) {
            return DispatchOutcome::AllComplete;
        }
        if state.status.values().all(|rt| rt.status.is_terminal()) {
            return DispatchOutcome::AllBlocked;
        }
        DispatchOutcome::NoReadyUnits
    }

    /// Record an externally-driven transition (e.g. the Worker announcing it
    /// pushed a branch and opened a PR). Panics if the transition is illegal.
    pub fn transition_to(&self, id: &str, to: UnitStatus) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        let rt = state.status.get_mut(id).unwrap_or_else(|| panic!("unknown unit {id}"));
        Self::transition_rt(rt, to);
    }

    /// A unit finished successfully. Transitions it to `complete` and
    /// promotes any dependent whose dependencies are now all satisfied.
    pub fn complete(&self, id: &str) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        {
            let rt = state.status.get_mut(id).unwrap_or_else(|| panic!("unknown unit {id}"));
            Self::transition_rt(rt, UnitStatus::Complete);
            rt.completed_at = Some(chrono::Utc::now());
        }
        self.bus.emit(Event::for_unit(EventKind::UnitCompleted, id.to_string()));

        let dependents = self.dependents.get(id).cloned().unwrap_or_default();
        let mut newly_ready: Vec<String> = dependents
            .into_iter()
            .filter(|dep_id| {
                state.status.get(dep_id).map(|rt| rt.status) == Some(UnitStatus::Pending)
                    && self.depends_on[dep_id]
                        .iter()
                        .all(|d| state.status[d].status == UnitStatus::Complete)
            })
            .collect();
        newly_ready.sort();

        for dep_id in newly_ready {
            let rt = state.status.get_mut(&dep_id).expect("unit present");
            Self::transition_rt(rt, UnitStatus::Ready);
            state.ready_queue.push_back(dep_id.clone());
            state.ready_set.insert(dep_id.clone());
            self.bus.emit(Event::for_unit(EventKind::UnitQueued, dep_id));
        }
    }

    /// A unit failed terminally. Transitively blocks every non-terminal
    /// dependent, recording `blocked_by` along the way. Units already
    /// `complete` are left untouched — completion is never undone by a later
    /// ancestor failure.
    pub fn fail(&self, id: &str, err: impl Into<String>) {
        let err = err.into();
        let mut state = self.state.lock().expect("scheduler state poisoned");
        {
            let rt = state.status.get_mut(id).unwrap_or_else(|| panic!("unknown unit {id}"));
            Self::transition_rt(rt, UnitStatus::Failed);
        }
        state.ready_set.remove(id);
        state.ready_queue.retain(|x| x != id);
        self.bus.emit(Event::for_unit(EventKind::UnitFailed, id.to_string()).with_error(err));

        let mut queue: VecDeque<String> =
            self.dependents.get(id).cloned().unwrap_or_default().into_iter().collect();
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(dep_id) = queue.pop_front() {
            if !visited.insert(dep_id.clone()) {
                continue;
            }
            let already_terminal = state
                .status
                .get(&dep_id)
                .map(|rt| rt.status.is_terminal())
                .unwrap_or(true);
            if already_terminal {
                continue;
            }

            state.ready_set.remove(&dep_id);
            state.ready_queue.retain(|x| x != &dep_id);

            let blocked_by = {
                let rt = state.status.get_mut(&dep_id).expect("unit present");
                Self::transition_rt(rt, UnitStatus::Blocked);
                rt.blocked_by.push(id.to_string());
                rt.blocked_by.clone()
            };
            self.bus.emit(
                Event::for_unit(EventKind::UnitBlocked, dep_id.clone())
                    .with_payload(serde_json::json!({ "blocked_by": blocked_by })),
            );

            for next in self.dependents.get(&dep_id).cloned().unwrap_or_default() {
                queue.push_back(next);
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.lock().expect("scheduler state poisoned");
        state.status.values().all(|rt| rt.status == UnitStatus::Complete)
    }

    pub fn has_failures(&self) -> bool {
        let state = self.state.lock().expect("scheduler state poisoned");
        state.status.values().any(|rt| matches!(rt.status, UnitStatus::Failed | UnitStatus::Blocked))
    }

    /// Whether every unit has reached a terminal state (complete, failed, or
    /// blocked) — the driver loop's stopping condition alongside `is_complete`.
    pub fn is_settled(&self) -> bool {
        let state = self.state.lock().expect("scheduler state poisoned");
        state.status.values().all(|rt| rt.status.is_terminal())
    }

    pub fn active_count(&self) -> usize {
        let state = self.state.lock().expect("scheduler state poisoned");
        state.status.values().filter(|rt| rt.status.is_active()).count()
    }

    /// A deep copy of one unit's runtime state.
    pub fn get_state(&self, id: &str) -> Option<UnitRuntime> {
        self.state.lock().expect("scheduler state poisoned").status.get(id).cloned()
    }

    /// A deep copy of every unit's runtime state.
    pub fn get_all_states(&self) -> HashMap<String, UnitRuntime> {
        self.state.lock().expect("scheduler state poisoned").status.clone()
    }

    /// The allowed-transitions chokepoint. Every status change in the
    /// scheduler passes through here. An illegal transition is a programmer
    /// error — unreachable in correct operation — and panics rather than
    /// surfacing as a recoverable `Result`.
    fn transition_rt(rt: &mut UnitRuntime, to: UnitStatus) {
        let from = rt.status;
        let allowed = matches!(
            (from, to),
            (UnitStatus::Pending, UnitStatus::Ready)
                | (UnitStatus::Pending, UnitStatus::Blocked)
                | (UnitStatus::Ready, UnitStatus::InProgress)
                | (UnitStatus::Ready, UnitStatus::Blocked)
                | (UnitStatus::InProgress, UnitStatus::PrOpen)
                | (UnitStatus::InProgress, UnitStatus::Complete)
                | (UnitStatus::InProgress, UnitStatus::Failed)
                | (UnitStatus::PrOpen, UnitStatus::InReview)
                | (UnitStatus::PrOpen, UnitStatus::Failed)
                | (UnitStatus::InReview, UnitStatus::Merging)
                | (UnitStatus::InReview, UnitStatus::PrOpen)
                | (UnitStatus::InReview, UnitStatus::Failed)
                | (UnitStatus::Merging, UnitStatus::Complete)
                | (UnitStatus::Merging, UnitStatus::Failed)
        );
        assert!(allowed, "illegal unit status transition: {from:?} -> {to:?}");
        tracing::debug!(?from, ?to, "unit status transition");
        rt.status = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unit(id: &str, deps: &[&str]) -> Unit {
        Unit {
            id: id.to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            tasks: Vec::new(),
            plan_path: PathBuf::from(format!("{id}/IMPLEMENTATION_PLAN.md")),
            plan_body: String::new(),
        }
    }

    fn test_bus() -> (at_core::events::EventBus, EventSender) {
        let bus = at_core::events::EventBus::start(64, vec![]);
        let sender = bus.sender();
        (bus, sender)
    }

    #[test]
    fn independent_units_are_both_ready_immediately() {
        let (_bus, sender) = test_bus();
        let units = vec![unit("a", &[]), unit("b", &[])];
        let sched = Scheduler::new(&units, 2, sender);
        assert_eq!(sched.get_state("a").unwrap().status, UnitStatus::Ready);
        assert_eq!(sched.get_state("b").unwrap().status, UnitStatus::Ready);
    }

    #[test]
    fn dispatch_respects_parallelism_cap() {
        let (_bus, sender) = test_bus();
        let units = vec![unit("a", &[]), unit("b", &[]), unit("c", &[])];
        let sched = Scheduler::new(&units, 2, sender);
        assert!(matches!(sched.dispatch(), DispatchOutcome::Dispatched(_)));
        assert!(matches!(sched.dispatch(), DispatchOutcome::Dispatched(_)));
        assert_eq!(sched.dispatch(), DispatchOutcome::AtCapacity);
        assert_eq!(sched.active_count(), 2);
    }

    #[test]
    fn linear_chain_promotes_dependent_on_completion() {
        let (_bus, sender) = test_bus();
        let units = vec![unit("a", &[]), unit("b", &["a"])];
        let sched = Scheduler::new(&units, 4, sender);
        assert_eq!(sched.get_state("b").unwrap().status, UnitStatus::Pending);

        let DispatchOutcome::Dispatched(dispatched) = sched.dispatch() else { panic!() };
        assert_eq!(dispatched, "a");
        sched.complete("a");
        assert_eq!(sched.get_state("b").unwrap().status, UnitStatus::Ready);

        let DispatchOutcome::Dispatched(dispatched) = sched.dispatch() else { panic!() };
        assert_eq!(dispatched, "b");
        sched.complete("b");
        assert!(sched.is_complete());
    }

    #[test]
    fn failure_cascades_to_all_transitive_dependents() {
        let (_bus, sender) = test_bus();
        // a -> b, a -> c, b -> d
        let units = vec![unit("a", &[]), unit("b", &["a"]), unit("c", &["a"]), unit("d", &["b"])];
        let sched = Scheduler::new(&units, 4, sender);
        sched.dispatch(); // dispatches a
        sched.fail("a", "boom");

        assert_eq!(sched.get_state("b").unwrap().status, UnitStatus::Blocked);
        assert_eq!(sched.get_state("c").unwrap().status, UnitStatus::Blocked);
        assert_eq!(sched.get_state("d").unwrap().status, UnitStatus::Blocked);
        assert_eq!(sched.get_state("d").unwrap().blocked_by, vec!["a".to_string()]);
        assert!(sched.has_failures());
        assert!(sched.is_settled());
    }

    #[test]
    fn completed_unit_is_not_undone_by_later_ancestor_failure() {
        let (_bus, sender) = test_bus();
        let units = vec![unit("a", &[]), unit("b", &[]), unit("c", &["a", "b"])];
        let sched = Scheduler::new(&units, 4, sender);
        sched.dispatch();
        sched.dispatch();
        sched.complete("a");
        sched.fail("b", "boom");
        // c depended on both; b's failure blocks c, a's prior completion stands.
        assert_eq!(sched.get_state("a").unwrap().status, UnitStatus::Complete);
        assert_eq!(sched.get_state("c").unwrap().status, UnitStatus::Blocked);
    }

    #[test]
    fn recovered_complete_unit_is_not_redispatched_and_unblocks_dependents() {
        let (_bus, sender) = test_bus();
        let units = vec![unit("a", &[]), unit("b", &["a"])];
        let mut recovered = HashMap::new();
        recovered.insert("a".to_string(), UnitStatus::Complete);
        let sched = Scheduler::with_recovered(&units, 4, sender, &recovered);

        assert_eq!(sched.get_state("a").unwrap().status, UnitStatus::Complete);
        // `b` has no recorded status of its own, but `a` (its only
        // dependency) was recovered complete, so the readiness pass still
        // promotes it the same as a fresh `Scheduler::complete("a")` would.
        assert_eq!(sched.get_state("b").unwrap().status, UnitStatus::Ready);
        assert!(matches!(sched.dispatch(), DispatchOutcome::Dispatched(id) if id == "b"));
    }

    #[test]
    fn recovered_in_progress_unit_counts_toward_active_count_without_dispatch() {
        let (_bus, sender) = test_bus();
        let units = vec![unit("a", &[])];
        let mut recovered = HashMap::new();
        recovered.insert("a".to_string(), UnitStatus::InProgress);
        let sched = Scheduler::with_recovered(&units, 4, sender, &recovered);

        assert_eq!(sched.active_count(), 1);
        assert_eq!(sched.dispatch(), DispatchOutcome::NoReadyUnits);
    }

    #[test]
    #[should_panic(expected = "illegal unit status transition")]
    fn illegal_transition_panics() {
        let (_bus, sender) = test_bus();
        let units = vec![unit("a", &[])];
        let sched = Scheduler::new(&units, 4, sender);
        sched.transition_to("a", UnitStatus::Merging);
    }
}
