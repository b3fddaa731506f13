// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Timelike};
use cron::Schedule;
use tracing::{debug, info, warn};

use crate::procs::process::NOT_RUNNING;
use crate::procs::ManagedProcess;
use crate::state::SupervisorState;
use crate::Error;

/// Ticks land this long after a wall clock boundary, inside the second being evaluated
const TICK_SLACK: Duration = Duration::from_millis(20);

/// Resolution a cron expression needs to be evaluated at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Second,
    Minute,
}

impl Granularity {
    pub fn period(self) -> Duration {
        match self {
            Granularity::Second => Duration::from_secs(1),
            Granularity::Minute => Duration::from_secs(60),
        }
    }

    /// Time from `now_millis`, unix time in milliseconds, to the next boundary of this resolution
    fn until_boundary(self, now_millis: i64) -> Duration {
        let period = self.period().as_millis() as i64;
        let into = now_millis.rem_euclid(period);
        Duration::from_millis(((period - into) % period) as u64)
    }

    fn truncate<Z: TimeZone>(self, now: &DateTime<Z>) -> DateTime<Z> {
        let instant = now.with_nanosecond(0).unwrap_or_else(|| now.clone());
        match self {
            Granularity::Second => instant,
            Granularity::Minute => instant.with_second(0).unwrap_or(instant),
        }
    }
}

/// Parses a 5, 6 or 7 field cron expression.
///
/// Five fields are the classic minute based form and get a `0` seconds field prepended. Six or
///  seven fields start with seconds, they only need the second ticker if that field is not `0`.
pub fn parse_expression(expr: &str) -> Result<(Schedule, Granularity), Error> {
    let fields: Vec<&str> = expr.split_whitespace().collect();

    match fields.len() {
        5 => {
            let schedule = Schedule::from_str(&format!("0 {}", fields.join(" ")))?;
            Ok((schedule, Granularity::Minute))
        }
        6 | 7 => {
            let granularity = if fields[0] == "0" {
                Granularity::Minute
            } else {
                Granularity::Second
            };
            Ok((Schedule::from_str(&fields.join(" "))?, granularity))
        }
        n => Err(format!("cron expression `{}` has {} fields, expected 5 to 7", expr, n).into()),
    }
}

/// A cron command with its parsed schedule
#[derive(Debug, Clone)]
pub struct CronJob {
    process: Arc<ManagedProcess>,
    schedule: Schedule,
    granularity: Granularity,
}

impl CronJob {
    pub fn new(process: Arc<ManagedProcess>) -> Result<Self, Error> {
        let expr = process
            .cron()
            .ok_or_else(|| format!("{} is not a cron command", process.id()))?;
        let (schedule, granularity) = parse_expression(expr)?;

        Ok(Self {
            process,
            schedule,
            granularity,
        })
    }

    pub fn process(&self) -> &Arc<ManagedProcess> {
        &self.process
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// True if the schedule has an occurrence exactly at `now`, at this job's resolution
    pub fn is_due<Z: TimeZone>(&self, now: &DateTime<Z>) -> bool {
        let target = self.granularity.truncate(now);
        let before = target.clone() - chrono::Duration::seconds(1);

        self.schedule
            .after(&before)
            .next()
            .map_or(false, |next| next == target)
    }
}

/// Parses the command's expression and files it in the matching bucket of `state`
pub fn register(state: &SupervisorState, process: &Arc<ManagedProcess>) -> Result<Granularity, Error> {
    let job = CronJob::new(Arc::clone(process))?;
    let granularity = job.granularity();
    state.register_cron(job);
    Ok(granularity)
}

/// Starts the second and minute tickers for `state`, they end once the state is retired
pub fn spawn_tickers(state: Arc<SupervisorState>, running: Arc<AtomicBool>) {
    for &granularity in &[Granularity::Second, Granularity::Minute] {
        tokio::spawn(tick_loop(
            Arc::clone(&state),
            Arc::clone(&running),
            granularity,
        ));
    }
}

/// Wakes up just after every wall clock second (or minute) and spawns the due jobs.
///
/// The wait is computed from the wall clock on every round, so ticks neither drift nor land
///  twice in one second.
async fn tick_loop(state: Arc<SupervisorState>, running: Arc<AtomicBool>, granularity: Granularity) {
    debug!(?granularity, "cron ticker started");

    loop {
        let wait = granularity.until_boundary(Local::now().timestamp_millis());
        tokio::time::sleep(wait + TICK_SLACK).await;
        if state.is_retired() {
            break;
        }
        if !running.load(Ordering::SeqCst) {
            continue;
        }

        let now = Local::now();
        for job in state.cron_jobs(granularity) {
            if job.process().is_paused() || !job.is_due(&now) {
                continue;
            }

            debug!(id = %job.process().id(), "cron tick matched");
            tokio::spawn(run_once(Arc::clone(job.process())));
        }
    }

    debug!(?granularity, "cron ticker stopped");
}

/// Runs a cron command once and waits for it.
///
/// Skipped while a previous run is still alive. A start failure is left for the next matching
///  tick to retry.
pub async fn run_once(process: Arc<ManagedProcess>) {
    if process.is_alive() {
        debug!(id = %process.id(), pid = process.pid(), "previous run still alive, skipping");
        return;
    }

    let pid = process.start();
    if pid == NOT_RUNNING {
        warn!(id = %process.id(), "cron command failed to start");
        return;
    }

    info!(id = %process.id(), pid, "cron run started");
    match process.wait().await {
        Ok(status) => info!(id = %process.id(), pid, "cron run finished: {}", status),
        Err(e) => warn!(id = %process.id(), pid, "cron wait failed: {}", e),
    }

    process.mark_terminated(pid);
}
