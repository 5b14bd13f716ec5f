// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! C4: the fixed-rate task scheduler (spec §4.4). A single core with a
//! millisecond tick drives five fixed-period tasks; this crate models
//! the one deterministic scheduling shape chosen over the source's
//! ambiguous dual-SysTick setup (spec §9 open question 1) — callers
//! drive it with a monotonic millisecond counter and get back the set
//! of tasks due at that instant, highest priority first.

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskId {
    Control,
    Protection,
    Can,
    Logging,
    Ui,
}

pub const TASKS: [TaskId; 5] = [
    TaskId::Control,
    TaskId::Protection,
    TaskId::Can,
    TaskId::Logging,
    TaskId::Ui,
];

impl TaskId {
    pub fn period_ms(self) -> u64 {
        match self {
            TaskId::Control => 1,
            TaskId::Protection => 1,
            TaskId::Can => 10,
            TaskId::Logging => 2,
            TaskId::Ui => 50,
        }
    }

    /// Higher is more urgent (spec §4.4 priority column).
    pub fn priority(self) -> u8 {
        match self {
            TaskId::Control => 4,
            TaskId::Protection => 3,
            TaskId::Can => 2,
            TaskId::Logging => 1,
            TaskId::Ui => 0,
        }
    }
}

/// 1-second hardware watchdog refreshed once per control tick; three
/// consecutive missed control ticks trigger a full reset (spec §4.4).
#[derive(Default)]
pub struct Watchdog {
    missed_ticks: u32,
    refreshed_since_boundary: bool,
}

impl Watchdog {
    pub fn new() -> Self {
        Watchdog::default()
    }

    pub fn refresh(&mut self) {
        self.refreshed_since_boundary = true;
    }

    pub fn missed_ticks(&self) -> u32 {
        self.missed_ticks
    }

    /// Called once per control-task period boundary. Returns `true` if
    /// the watchdog has now observed three consecutive misses and a
    /// reset should be issued.
    pub fn tick_boundary(&mut self) -> bool {
        if self.refreshed_since_boundary {
            self.missed_ticks = 0;
        } else {
            self.missed_ticks += 1;
        }
        self.refreshed_since_boundary = false;
        self.missed_ticks >= 3
    }
}

/// Reason a boot followed a reset (surfaced to the bootloader, spec
/// §4.7 step 2). `Watchdog` covers only the `IwdgReset` case; the other
/// variants are recorded by whatever observes the hardware reset cause
/// register and are included here so `pmu-core`/`pmu-bootloader` share
/// one vocabulary.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootReason {
    PowerOn,
    SoftwareReset,
    IwdgReset,
    SharedStateOverride,
}

pub struct Scheduler {
    next_due: [u64; TASKS.len()],
    pub watchdog: Watchdog,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            next_due: [0; TASKS.len()],
            watchdog: Watchdog::new(),
        }
    }

    /// Tasks due to run at `now_ms`, ordered highest priority first.
    /// Each due task's next deadline advances by its period (spec §4.4
    /// "suspend only at period boundary"); a task that was somehow
    /// skipped past (caller stalled) catches back up to `now_ms` rather
    /// than queuing a backlog of runs.
    pub fn due_tasks(&mut self, now_ms: u64) -> Vec<TaskId> {
        let mut due: Vec<TaskId> = TASKS
            .iter()
            .copied()
            .filter(|&task| now_ms >= self.next_due[task_index(task)])
            .collect();
        due.sort_by(|a, b| b.priority().cmp(&a.priority()));

        for &task in &due {
            let idx = task_index(task);
            let period = task.period_ms();
            self.next_due[idx] = ((now_ms / period) + 1) * period;
        }
        due
    }
}

fn task_index(task: TaskId) -> usize {
    match task {
        TaskId::Control => 0,
        TaskId::Protection => 1,
        TaskId::Can => 2,
        TaskId::Logging => 3,
        TaskId::Ui => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_and_protection_due_every_ms() {
        let mut sched = Scheduler::new();
        for ms in 0..5u64 {
            let due = sched.due_tasks(ms);
            assert!(due.contains(&TaskId::Control));
            assert!(due.contains(&TaskId::Protection));
        }
    }

    #[test]
    fn ui_due_every_fifty_ms_only() {
        let mut sched = Scheduler::new();
        let mut ui_hits = 0;
        for ms in 0..151u64 {
            if sched.due_tasks(ms).contains(&TaskId::Ui) {
                ui_hits += 1;
            }
        }
        assert_eq!(ui_hits, 4); // ms 0, 50, 100, 150
    }

    #[test]
    fn due_tasks_sorted_by_priority_descending() {
        let mut sched = Scheduler::new();
        let due = sched.due_tasks(0);
        for pair in due.windows(2) {
            assert!(pair[0].priority() >= pair[1].priority());
        }
    }

    #[test]
    fn watchdog_trips_after_three_consecutive_misses() {
        let mut wd = Watchdog::new();
        assert!(!wd.tick_boundary());
        assert!(!wd.tick_boundary());
        assert!(wd.tick_boundary());
        assert_eq!(wd.missed_ticks(), 3);
    }

    #[test]
    fn watchdog_refresh_resets_miss_count() {
        let mut wd = Watchdog::new();
        wd.tick_boundary();
        wd.tick_boundary();
        wd.refresh();
        assert!(!wd.tick_boundary());
        assert_eq!(wd.missed_ticks(), 0);
    }
}
