// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Live bookkeeping of running and broken commands

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::procs::cron::{CronJob, Granularity};
use crate::procs::ManagedProcess;

pub const DEFAULT_BROKEN_GAP: i64 = 5;
pub const DEFAULT_BROKEN_TIMES: u32 = 5;

/// Current wall clock time as unix seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// How many quick exits a daemon may have before it is considered broken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlapPolicy {
    /// Max seconds between two exits for them to count as the same flapping episode
    pub broken_gap: i64,
    /// Retry count at which the command is given up on
    pub broken_times: u32,
}

impl Default for FlapPolicy {
    fn default() -> Self {
        Self {
            broken_gap: DEFAULT_BROKEN_GAP,
            broken_times: DEFAULT_BROKEN_TIMES,
        }
    }
}

/// Outcome of recording an unsolicited exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakVerdict {
    /// First exit, or far enough from the previous one; the retry counter starts over
    Incidental,
    /// Exit inside the tolerance gap, carries the retry count so far
    Retry(u32),
    /// Retry budget exhausted
    Broken,
}

/// A daemon registered as running, tagged with the pid its monitor loop started
#[derive(Debug, Clone)]
pub struct RunningEntry {
    pub process: Arc<ManagedProcess>,
    pub pid: libc::pid_t,
}

#[derive(Debug, Default)]
struct Counters {
    tasks_num: usize,
    running_num: usize,
    broken_num: usize,
    running: HashMap<String, RunningEntry>,
    broken: HashMap<String, Arc<ManagedProcess>>,
    broken_tries: HashMap<String, u32>,
    broken_points: HashMap<String, i64>,
}

/// State of one generation of tasks.
///
/// A new one is built for every start of the task set (initial start and each reload), the old
///  one is retired. Monitor loops keep the `Arc` they were started with, so a loop from an older
///  generation only ever sees the maps of its own generation.
#[derive(Debug, Default)]
pub struct SupervisorState {
    counters: Mutex<Counters>,
    cron_started: AtomicBool,
    retired: AtomicBool,
    second_jobs: Mutex<BTreeMap<String, CronJob>>,
    minute_jobs: Mutex<BTreeMap<String, CronJob>>,
}

impl SupervisorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tasks_num(&self, tasks_num: usize) {
        self.counters.lock().tasks_num = tasks_num;
    }

    pub fn register_running(&self, process: &Arc<ManagedProcess>, pid: libc::pid_t) {
        let mut counters = self.counters.lock();
        let entry = RunningEntry {
            process: Arc::clone(process),
            pid,
        };

        if counters
            .running
            .insert(process.id().to_string(), entry)
            .is_none()
        {
            counters.running_num += 1;
        }
    }

    /// Removes the registration only if it is still the one for `pid`.
    ///
    /// Returns false when an operator action already removed it (or replaced it with a newer
    ///  start), which means the exit was administrative.
    pub fn deregister_running(&self, id: &str, pid: libc::pid_t) -> bool {
        let mut counters = self.counters.lock();
        match counters.running.get(id) {
            Some(entry) if entry.pid == pid => {
                counters.running.remove(id);
                counters.running_num -= 1;
                true
            }
            _ => false,
        }
    }

    /// Administrative removal, must happen before the process is killed
    pub fn remove_running(&self, id: &str) -> Option<RunningEntry> {
        let mut counters = self.counters.lock();
        let entry = counters.running.remove(id);
        if entry.is_some() {
            counters.running_num -= 1;
        }
        entry
    }

    /// Administrative removal of every running command
    pub fn drain_running(&self) -> Vec<RunningEntry> {
        let mut counters = self.counters.lock();
        counters.running_num = 0;
        counters.running.drain().map(|(_, entry)| entry).collect()
    }

    pub fn is_registered(&self, id: &str, pid: libc::pid_t) -> bool {
        self.counters
            .lock()
            .running
            .get(id)
            .map_or(false, |entry| entry.pid == pid)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.counters.lock().running.contains_key(id)
    }

    pub fn mark_broken(&self, process: &Arc<ManagedProcess>) {
        let mut counters = self.counters.lock();
        let id = process.id();

        if counters.running.remove(id).is_some() {
            counters.running_num -= 1;
        }
        if counters
            .broken
            .insert(id.to_string(), Arc::clone(process))
            .is_none()
        {
            counters.broken_num += 1;
        }
    }

    /// Forgets that a command broke, used when an operator restarts it by hand
    pub fn clear_broken(&self, id: &str) {
        let mut counters = self.counters.lock();
        if counters.broken.remove(id).is_some() {
            counters.broken_num -= 1;
        }
        counters.broken_tries.remove(id);
        counters.broken_points.remove(id);
    }

    pub fn is_broken(&self, id: &str) -> bool {
        self.counters.lock().broken.contains_key(id)
    }

    /// Records an unsolicited exit at `now` and classifies it.
    ///
    /// An exit within `broken_gap` seconds of the recorded break counts as a retry. Otherwise the
    ///  counter goes back to 1 and `now` becomes the recorded break, so the gap is measured from
    ///  the first exit of a flapping episode.
    pub fn record_break(&self, id: &str, now: i64, policy: &FlapPolicy) -> BreakVerdict {
        let mut counters = self.counters.lock();

        let within_gap = counters
            .broken_points
            .get(id)
            .map_or(false, |&last| now - last <= policy.broken_gap);

        if !within_gap {
            counters.broken_points.insert(id.to_string(), now);
            counters.broken_tries.insert(id.to_string(), 1);
            return BreakVerdict::Incidental;
        }

        let tries = counters.broken_tries.entry(id.to_string()).or_insert(0);
        *tries += 1;
        if *tries >= policy.broken_times {
            BreakVerdict::Broken
        } else {
            BreakVerdict::Retry(*tries)
        }
    }

    /// Copies the observable fields, the lock is held only for the copy
    pub fn snapshot(&self) -> StatusSnapshot {
        let counters = self.counters.lock();
        StatusSnapshot {
            taken_at: unix_now(),
            tasks_num: counters.tasks_num,
            running_num: counters.running_num,
            broken_num: counters.broken_num,
            running: counters
                .running
                .iter()
                .map(|(id, entry)| (id.clone(), entry.pid))
                .collect(),
            broken: counters.broken.keys().cloned().collect(),
            broken_tries: counters.broken_tries.clone(),
            broken_points: counters.broken_points.clone(),
        }
    }

    pub fn register_cron(&self, job: CronJob) {
        let bucket = match job.granularity() {
            Granularity::Second => &self.second_jobs,
            Granularity::Minute => &self.minute_jobs,
        };
        bucket.lock().insert(job.process().id().to_string(), job);
    }

    pub fn cron_jobs(&self, granularity: Granularity) -> Vec<CronJob> {
        let bucket = match granularity {
            Granularity::Second => &self.second_jobs,
            Granularity::Minute => &self.minute_jobs,
        };
        bucket.lock().values().cloned().collect()
    }

    pub fn has_cron_jobs(&self) -> bool {
        !self.second_jobs.lock().is_empty() || !self.minute_jobs.lock().is_empty()
    }

    /// Returns true for the one caller that gets to start the cron tickers
    pub fn mark_cron_started(&self) -> bool {
        !self.cron_started.swap(true, Ordering::SeqCst)
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

/// Point in time copy of a [`SupervisorState`], read without touching the live lock
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub taken_at: i64,
    pub tasks_num: usize,
    pub running_num: usize,
    pub broken_num: usize,
    pub running: BTreeMap<String, libc::pid_t>,
    pub broken: BTreeSet<String>,
    pub broken_tries: HashMap<String, u32>,
    pub broken_points: HashMap<String, i64>,
}

impl StatusSnapshot {
    /// Retry count and last break time for `id`, zeros if it never broke
    pub fn break_record(&self, id: &str) -> (u32, i64) {
        match self.broken_tries.get(id) {
            Some(&tries) => (tries, self.broken_points.get(id).copied().unwrap_or(0)),
            None => (0, 0),
        }
    }

    pub fn running_pids(&self) -> Vec<libc::pid_t> {
        self.running.values().copied().collect()
    }
}
