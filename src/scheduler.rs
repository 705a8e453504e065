//! Record-side scheduling.
//!
//! Priorities set by setpriority(2) are honored strictly: the
//! highest-priority runnable task runs, and equal-priority tasks
//! round-robin. Strict priorities help find starvation bugs. When a task
//! calls sched_yield we temporarily switch to a fair queue that ignores
//! priorities, because yielding tasks are usually spinning on something a
//! lower-priority task must do first.
//!
//! A task runs for a timeslice measured in ticks; after that (or when it
//! blocks) the next task is chosen. Chaos mode randomises priorities on a
//! schedule and inserts bounded intervals in which only high-priority tasks
//! may run at all, to reproduce scheduling-dependent bugs.
//!
//! Replay never consults this module: the next task is whatever the next
//! trace frame names.

use crate::ticks::Ticks;
use crate::uid::TaskUid;
use rand::Rng;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Timeslice length. Ticks don't map to wall time in general, but
/// empirically ~50k ticks/ms holds for pointer-chasing code, putting the
/// default near 10ms.
pub const DEFAULT_MAX_TICKS: Ticks = 500_000;

/// Priority range used in chaos mode, mirroring the nice(2) span.
const CHAOS_PRIORITY_MIN: i32 = -20;
const CHAOS_PRIORITY_MAX: i32 = 19;

/// How often chaos mode re-randomises, in seconds.
const PRIORITIES_REFRESH_INTERVAL: f64 = 2.0;
const HIGH_PRIORITY_ONLY_REFRESH_INTERVAL: f64 = 2.0;
const MAX_HIGH_PRIORITY_ONLY_DURATION: f64 = 0.1;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Switch {
    KeepRunning,
    SwitchTask,
}

/// The scheduler tracks tasks by uid; the owning session resolves them and
/// answers runnability queries through the callback handed to
/// `choose_next`.
pub struct Scheduler {
    /// Tasks not in the round-robin queue, ordered by (priority, uid) so a
    /// range scan visits one priority class in uid order.
    task_priority_set: BTreeSet<(i32, TaskUid)>,
    priorities: HashMap<TaskUid, i32>,
    /// Drained before priority scheduling resumes; populated by
    /// sched_yield.
    round_robin_queue: VecDeque<TaskUid>,

    current: Option<TaskUid>,
    current_timeslice_end: Ticks,
    max_ticks: Ticks,

    /// Chaos mode state.
    enable_chaos: bool,
    priorities_refresh_time: f64,
    high_priority_only_start: f64,
    high_priority_only_duration: f64,
    high_priority_only_refresh_time: f64,

    /// Scheduling decision forcing: switch at every opportunity.
    always_switch: bool,

    pretend_num_cores: u32,
}

impl Scheduler {
    pub fn new(max_ticks: Ticks, enable_chaos: bool, always_switch: bool) -> Scheduler {
        Scheduler {
            task_priority_set: BTreeSet::new(),
            priorities: HashMap::new(),
            round_robin_queue: VecDeque::new(),
            current: None,
            current_timeslice_end: 0,
            max_ticks,
            enable_chaos,
            priorities_refresh_time: 0.0,
            high_priority_only_start: 0.0,
            high_priority_only_duration: 0.0,
            high_priority_only_refresh_time: 0.0,
            always_switch,
            pretend_num_cores: 1,
        }
    }

    pub fn set_pretend_num_cores(&mut self, cores: u32) {
        self.pretend_num_cores = cores.max(1);
    }

    /// The core count reported to tracees through the preload globals.
    pub fn pretend_num_cores(&self) -> u32 {
        self.pretend_num_cores
    }

    pub fn max_ticks(&self) -> Ticks {
        self.max_ticks
    }

    pub fn current(&self) -> Option<TaskUid> {
        self.current
    }

    pub fn set_current(&mut self, uid: Option<TaskUid>) {
        self.current = uid;
    }

    pub fn current_timeslice_end(&self) -> Ticks {
        self.current_timeslice_end
    }

    pub fn expire_timeslice(&mut self) {
        self.current_timeslice_end = 0;
    }

    pub fn on_create(&mut self, uid: TaskUid, priority: i32) {
        self.priorities.insert(uid, priority);
        self.task_priority_set.insert((priority, uid));
    }

    pub fn on_destroy(&mut self, uid: TaskUid) {
        if let Some(prio) = self.priorities.remove(&uid) {
            self.task_priority_set.remove(&(prio, uid));
        }
        self.round_robin_queue.retain(|u| *u != uid);
        if self.current == Some(uid) {
            self.current = None;
        }
    }

    pub fn update_task_priority(&mut self, uid: TaskUid, priority: i32) {
        if self.enable_chaos {
            // Chaos owns priorities; tracee nice() calls are recorded but
            // ignored for scheduling.
            return;
        }
        self.set_priority(uid, priority);
    }

    fn set_priority(&mut self, uid: TaskUid, priority: i32) {
        if let Some(old) = self.priorities.insert(uid, priority) {
            self.task_priority_set.remove(&(old, uid));
        }
        if !self.round_robin_queue.contains(&uid) {
            self.task_priority_set.insert((priority, uid));
        }
    }

    /// sched_yield handler: move every task onto the fair queue, yielder
    /// last, and run the queue to empty before priority scheduling resumes.
    pub fn schedule_one_round_robin(&mut self, yielder: TaskUid) {
        if self.round_robin_queue.is_empty() {
            let all: Vec<(i32, TaskUid)> = self.task_priority_set.iter().copied().collect();
            for (_, uid) in all {
                if uid != yielder {
                    self.round_robin_queue.push_back(uid);
                }
            }
            self.round_robin_queue.push_back(yielder);
            self.task_priority_set.clear();
        }
        self.expire_timeslice();
    }

    fn maybe_refresh_chaos(&mut self, now: f64) {
        if !self.enable_chaos {
            return;
        }
        let mut rng = rand::thread_rng();
        if now >= self.priorities_refresh_time {
            self.priorities_refresh_time = now + rng.gen_range(0.0, PRIORITIES_REFRESH_INTERVAL);
            let uids: Vec<TaskUid> = self.priorities.keys().copied().collect();
            for uid in uids {
                let p = rng.gen_range(CHAOS_PRIORITY_MIN, CHAOS_PRIORITY_MAX + 1);
                self.set_priority(uid, p);
            }
        }
        if now >= self.high_priority_only_refresh_time {
            self.high_priority_only_refresh_time =
                now + rng.gen_range(0.0, HIGH_PRIORITY_ONLY_REFRESH_INTERVAL);
            self.high_priority_only_start = now + rng.gen_range(0.0, 1.0);
            self.high_priority_only_duration =
                rng.gen_range(0.0, MAX_HIGH_PRIORITY_ONLY_DURATION);
        }
    }

    fn in_high_priority_only_interval(&self, now: f64) -> bool {
        self.enable_chaos
            && now >= self.high_priority_only_start
            && now < self.high_priority_only_start + self.high_priority_only_duration
    }

    /// Pick the next task to run. `runnable` answers whether a task could
    /// make progress right now. Returns the chosen task and whether the
    /// caller must treat this as a context switch.
    pub fn choose_next(
        &mut self,
        now: f64,
        current_ticks: Ticks,
        runnable: &dyn Fn(TaskUid) -> bool,
    ) -> Option<(TaskUid, Switch)> {
        self.maybe_refresh_chaos(now);

        // The current task keeps its slice while it is runnable, inside
        // its budget, and nothing forces a switch.
        if let Some(cur) = self.current {
            if !self.always_switch
                && self.round_robin_queue.is_empty()
                && current_ticks < self.current_timeslice_end
                && runnable(cur)
            {
                return Some((cur, Switch::KeepRunning));
            }
        }

        // Fairness queue first.
        while let Some(uid) = self.round_robin_queue.pop_front() {
            let prio = self.priorities.get(&uid).copied().unwrap_or(0);
            self.task_priority_set.insert((prio, uid));
            if runnable(uid) {
                return self.start_timeslice(uid, current_ticks);
            }
        }

        // Highest priority (numerically lowest, like nice values) runnable
        // task; equal priorities round-robin by starting after the current
        // task's uid.
        let high_priority_cutoff = if self.in_high_priority_only_interval(now) {
            let median = self.median_priority();
            Some(median)
        } else {
            None
        };

        let mut candidates: Vec<(i32, TaskUid)> = self.task_priority_set.iter().copied().collect();
        if let (Some(cur), true) = (self.current, !candidates.is_empty()) {
            let cur_prio = self.priorities.get(&cur).copied().unwrap_or(0);
            // Rotate the current task's priority class so round-robin
            // starts after it.
            candidates.sort_by_key(|(p, uid)| {
                (*p, *p == cur_prio && *uid <= cur, *uid)
            });
        }
        for (prio, uid) in candidates {
            if let Some(cutoff) = high_priority_cutoff {
                if prio > cutoff {
                    continue;
                }
            }
            if runnable(uid) {
                return self.start_timeslice(uid, current_ticks);
            }
        }
        None
    }

    fn median_priority(&self) -> i32 {
        let mut all: Vec<i32> = self.priorities.values().copied().collect();
        if all.is_empty() {
            return 0;
        }
        all.sort_unstable();
        all[all.len() / 2]
    }

    fn start_timeslice(&mut self, uid: TaskUid, current_ticks: Ticks) -> Option<(TaskUid, Switch)> {
        let switch = if self.current == Some(uid) {
            Switch::KeepRunning
        } else {
            Switch::SwitchTask
        };
        self.current = Some(uid);
        let slice = if self.enable_chaos {
            let mut rng = rand::thread_rng();
            rng.gen_range(1, self.max_ticks + 1)
        } else {
            self.max_ticks
        };
        self.current_timeslice_end = current_ticks + slice;
        Some((uid, switch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: i32) -> TaskUid {
        TaskUid::new(n, n as u32)
    }

    #[test]
    fn highest_priority_runnable_wins() {
        let mut s = Scheduler::new(DEFAULT_MAX_TICKS, false, false);
        s.on_create(uid(1), 0);
        s.on_create(uid(2), -5);
        s.on_create(uid(3), 10);
        let (chosen, _) = s.choose_next(0.0, 0, &|_| true).unwrap();
        assert_eq!(chosen, uid(2));

        // If the best is blocked, the next class runs.
        let (chosen, _) = s.choose_next(0.0, u64::MAX, &|u| u != uid(2)).unwrap();
        assert_eq!(chosen, uid(1));
    }

    #[test]
    fn current_task_keeps_unexpired_timeslice() {
        let mut s = Scheduler::new(1000, false, false);
        s.on_create(uid(1), 0);
        s.on_create(uid(2), 0);
        let (first, _) = s.choose_next(0.0, 0, &|_| true).unwrap();
        let (again, sw) = s.choose_next(0.0, 500, &|_| true).unwrap();
        assert_eq!(first, again);
        assert_eq!(sw, Switch::KeepRunning);
        // Past the budget, the other equal-priority task gets a turn.
        let (next, sw) = s.choose_next(0.0, 1001, &|_| true).unwrap();
        assert_ne!(next, first);
        assert_eq!(sw, Switch::SwitchTask);
    }

    #[test]
    fn sched_yield_drains_fair_queue() {
        let mut s = Scheduler::new(1000, false, false);
        s.on_create(uid(1), -10);
        s.on_create(uid(2), 5);
        let (first, _) = s.choose_next(0.0, 0, &|_| true).unwrap();
        assert_eq!(first, uid(1));

        s.schedule_one_round_robin(uid(1));
        // The yielder goes to the back: the low-priority task runs first
        // from the fair queue.
        let (next, _) = s.choose_next(0.0, 0, &|_| true).unwrap();
        assert_eq!(next, uid(2));
        let (next, _) = s.choose_next(0.0, u64::MAX, &|_| true).unwrap();
        assert_eq!(next, uid(1));
    }

    #[test]
    fn destroy_removes_from_all_queues() {
        let mut s = Scheduler::new(1000, false, false);
        s.on_create(uid(1), 0);
        s.on_create(uid(2), 0);
        s.schedule_one_round_robin(uid(1));
        s.on_destroy(uid(2));
        let (chosen, _) = s.choose_next(0.0, 0, &|_| true).unwrap();
        assert_eq!(chosen, uid(1));
        s.on_destroy(uid(1));
        assert!(s.choose_next(0.0, 0, &|_| true).is_none());
    }

    #[test]
    fn always_switch_rotates_equal_priorities() {
        let mut s = Scheduler::new(1000, false, true);
        s.on_create(uid(1), 0);
        s.on_create(uid(2), 0);
        let (a, _) = s.choose_next(0.0, 0, &|_| true).unwrap();
        let (b, _) = s.choose_next(0.0, 0, &|_| true).unwrap();
        assert_ne!(a, b);
    }
}
