// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::procs::process::NOT_RUNNING;
use crate::procs::ManagedProcess;
use crate::state::{unix_now, BreakVerdict, FlapPolicy, SupervisorState};

/// Releases the supervision claim when the loop ends, however it ends
struct Claim {
    process: Arc<ManagedProcess>,
    epoch: u64,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.process.release_supervision(self.epoch);
    }
}

/// Starts a monitor loop for a daemon command and returns its handle.
///
/// Returns `None` without spawning anything if the command has a live pid or a loop already
///  supervises it.
pub fn spawn(
    process: Arc<ManagedProcess>,
    state: Arc<SupervisorState>,
    policy: FlapPolicy,
) -> Option<JoinHandle<()>> {
    if process.is_alive() {
        warn!(id = %process.id(), pid = process.pid(), "already running, not supervising twice");
        return None;
    }

    let epoch = match process.claim_supervision() {
        Some(epoch) => epoch,
        None => {
            warn!(id = %process.id(), "already supervised");
            return None;
        }
    };

    Some(tokio::spawn(supervise(process, state, policy, epoch)))
}

/// Keeps one daemon command running.
///
/// Every exit the loop did not cause goes through the flap policy: isolated exits restart right
///  away, repeated quick exits eventually mark the command broken. If the running registration
///  was removed while the process ran, the exit was an operator action and the loop just ends.
async fn supervise(
    process: Arc<ManagedProcess>,
    state: Arc<SupervisorState>,
    policy: FlapPolicy,
    epoch: u64,
) {
    let _claim = Claim {
        process: Arc::clone(&process),
        epoch,
    };
    let id = process.id().to_string();

    loop {
        if !process.holds_supervision(epoch) {
            debug!(id = %id, "supervision revoked");
            break;
        }
        if process.is_paused() {
            info!(id = %id, "paused, no longer supervised");
            break;
        }

        let pid = process.start();
        if pid == NOT_RUNNING {
            error!(id = %id, "could not be started, marked broken");
            state.mark_broken(&process);
            break;
        }

        state.register_running(&process, pid);
        if !process.holds_supervision(epoch) {
            // a teardown ran between start and registration
            debug!(id = %id, pid, "supervision revoked while starting");
            state.deregister_running(&id, pid);
            process.kill().ok();
            process.wait().await.ok();
            break;
        }
        info!(id = %id, name = %process.name(), pid, "started");

        match process.wait().await {
            Ok(status) => info!(id = %id, pid, "exited: {}", status),
            Err(e) => warn!(id = %id, pid, "wait failed: {}", e),
        }

        if !state.deregister_running(&id, pid) {
            debug!(id = %id, pid, "stopped by operator");
            break;
        }

        if process.take_restart_request() {
            info!(id = %id, "restarting on request");
            continue;
        }

        match state.record_break(&id, unix_now(), &policy) {
            BreakVerdict::Incidental => warn!(id = %id, "exited unexpectedly, restarting"),
            BreakVerdict::Retry(tries) => warn!(
                id = %id,
                tries,
                "exited again within {}s, restarting",
                policy.broken_gap
            ),
            BreakVerdict::Broken => {
                error!(
                    id = %id,
                    "exited {} times within {}s of each other, giving up",
                    policy.broken_times,
                    policy.broken_gap
                );
                state.mark_broken(&process);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "timed out: {}", what);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn sleeper(id: &str) -> Arc<ManagedProcess> {
        Arc::new(ManagedProcess::new(id, "/bin/sleep", vec!["30".into()], None))
    }

    fn running_pid(state: &SupervisorState, id: &str) -> Option<libc::pid_t> {
        state.snapshot().running.get(id).copied()
    }

    #[tokio::test]
    async fn test_start_failure_is_broken_once() {
        let state = Arc::new(SupervisorState::new());
        let process = Arc::new(ManagedProcess::new("bad", "/nonexistent/keeper", vec![], None));

        assert!(spawn(Arc::clone(&process), Arc::clone(&state), FlapPolicy::default()).is_some());
        wait_for("loop end", || !process.is_supervised()).await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.broken_num, 1);
        assert_eq!(snapshot.running_num, 0);
        assert!(snapshot.broken.contains("bad"));
        assert_eq!(snapshot.break_record("bad"), (0, 0));
    }

    #[tokio::test]
    async fn test_flapping_command_is_broken() {
        let state = Arc::new(SupervisorState::new());
        let process = Arc::new(ManagedProcess::new(
            "flappy",
            "/bin/sh",
            vec!["-c".into(), "exit 1".into()],
            None,
        ));

        assert!(spawn(Arc::clone(&process), Arc::clone(&state), FlapPolicy::default()).is_some());
        wait_for("broken", || state.is_broken("flappy")).await;
        wait_for("loop end", || !process.is_supervised()).await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.broken_num, 1);
        assert_eq!(snapshot.running_num, 0);
        assert_eq!(snapshot.break_record("flappy").0, 5);
    }

    #[tokio::test]
    async fn test_operator_kill_is_not_a_break() {
        let state = Arc::new(SupervisorState::new());
        let process = sleeper("calm");

        assert!(spawn(Arc::clone(&process), Arc::clone(&state), FlapPolicy::default()).is_some());
        wait_for("registered", || state.is_running("calm")).await;

        // remove first, then kill
        assert!(state.remove_running("calm").is_some());
        process.kill().expect("kill");
        wait_for("loop end", || !process.is_supervised()).await;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.broken_num, 0);
        assert_eq!(snapshot.running_num, 0);
        assert_eq!(snapshot.break_record("calm"), (0, 0));
    }

    #[tokio::test]
    async fn test_duplicate_spawn_refused() {
        let state = Arc::new(SupervisorState::new());
        let process = sleeper("single");

        assert!(spawn(Arc::clone(&process), Arc::clone(&state), FlapPolicy::default()).is_some());
        assert!(spawn(Arc::clone(&process), Arc::clone(&state), FlapPolicy::default()).is_none());

        wait_for("registered", || state.is_running("single")).await;
        state.remove_running("single");
        process.kill().expect("kill");
        wait_for("loop end", || !process.is_supervised()).await;
    }

    #[tokio::test]
    async fn test_requested_restart() {
        let state = Arc::new(SupervisorState::new());
        let process = sleeper("restartable");

        assert!(spawn(Arc::clone(&process), Arc::clone(&state), FlapPolicy::default()).is_some());
        wait_for("registered", || state.is_running("restartable")).await;
        let first = running_pid(&state, "restartable").expect("pid");

        process.request_restart();
        process.kill().expect("kill");
        wait_for("restarted", || {
            running_pid(&state, "restartable").map_or(false, |pid| pid != first)
        })
        .await;
        assert_eq!(state.snapshot().break_record("restartable"), (0, 0));

        state.remove_running("restartable");
        process.kill().expect("kill");
        wait_for("loop end", || !process.is_supervised()).await;
    }
}
