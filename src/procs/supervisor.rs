// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Launch and monitor processes
//!
//! Rules:
//!   - only the dispatcher changes the command set or the global run flag
//!   - every teardown removes the running registration before it kills
//!   - a reload builds a fresh state, the old one is retired and never reused

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::CommandSource;
use crate::control::{Action, ControlReceiver, Envelope, Signal};
use crate::error::ErrorKind;
use crate::pidfile::ProcessDescription;
use crate::procs::{cron, monitor, CommandRegistry, ManagedProcess};
use crate::state::{unix_now, FlapPolicy, StatusSnapshot, SupervisorState};
use crate::Error;

const SNAPSHOT_PERIOD: Duration = Duration::from_millis(100);

/// When the task set was started and reloaded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub start_time: Option<i64>,
    pub reload_times: Vec<i64>,
}

/// Owns the command set and the state of the running generation.
///
/// Shared by `Arc` between the dispatcher, the protocol handler and the background tasks. The
///  registry and the state are swapped wholesale on reload, readers clone the `Arc` they need.
pub struct Supervisor {
    policy: FlapPolicy,
    source: Box<dyn CommandSource>,
    commands: RwLock<Arc<CommandRegistry>>,
    state: RwLock<Arc<SupervisorState>>,
    snapshot: RwLock<Arc<StatusSnapshot>>,
    running: Arc<AtomicBool>,
    loops: Mutex<HashMap<String, JoinHandle<()>>>,
    history: Mutex<History>,
    description: RwLock<Option<ProcessDescription>>,
}

impl Supervisor {
    /// `commands` is the initial set, `source` is asked again on every reload
    pub fn new(
        commands: CommandRegistry,
        source: Box<dyn CommandSource>,
        policy: FlapPolicy,
    ) -> Self {
        Self {
            policy,
            source,
            commands: RwLock::new(Arc::new(commands)),
            state: RwLock::new(Arc::new(SupervisorState::new())),
            snapshot: RwLock::new(Arc::new(StatusSnapshot::default())),
            running: Arc::new(AtomicBool::new(false)),
            loops: Mutex::new(HashMap::new()),
            history: Mutex::new(History::default()),
            description: RwLock::new(None),
        }
    }

    pub fn set_description(&self, description: ProcessDescription) {
        *self.description.write() = Some(description);
    }

    pub fn description(&self) -> Option<ProcessDescription> {
        self.description.read().clone()
    }

    pub fn policy(&self) -> FlapPolicy {
        self.policy
    }

    pub fn commands(&self) -> Arc<CommandRegistry> {
        Arc::clone(&self.commands.read())
    }

    pub fn state(&self) -> Arc<SupervisorState> {
        Arc::clone(&self.state.read())
    }

    /// The last copy of the state, at most 100ms old
    pub fn snapshot(&self) -> Arc<StatusSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn history(&self) -> History {
        self.history.lock().clone()
    }

    /// True between a start and the next pause or exit
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn refresh_snapshot(&self) {
        let snapshot = self.state().snapshot();
        let previous = std::mem::replace(&mut *self.snapshot.write(), Arc::new(snapshot));

        let current = self.snapshot();
        if all_broken(&current) && !all_broken(&previous) {
            error!(
                broken = current.broken_num,
                "every daemon command is broken, nothing is running"
            );
        }
    }

    fn spawn_snapshot_refresher(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SNAPSHOT_PERIOD);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                match supervisor.upgrade() {
                    Some(supervisor) => supervisor.refresh_snapshot(),
                    None => break,
                }
            }
        })
    }

    /// The dispatcher loop, the only consumer of `control`.
    ///
    /// Handles one signal at a time and answers it once it is fully handled. Returns after an
    ///  `Exit`, or once every sender is gone, with all commands torn down.
    pub async fn run(self: Arc<Self>, mut control: ControlReceiver) {
        let refresher = self.spawn_snapshot_refresher();
        info!("dispatcher started");

        let mut exited = false;
        while let Some(Envelope { signal, reply }) = control.recv().await {
            info!(%signal, "signal received");
            exited = signal == Signal::Exit;

            let outcome = self.handle(signal).await;
            if let Err(e) = &outcome {
                warn!("signal failed: {}", e);
            }

            self.refresh_snapshot();
            reply.send(outcome).ok();

            if exited {
                break;
            }
        }

        if !exited {
            warn!("control channel closed, stopping all commands");
            self.exit_tasks().await;
            self.refresh_snapshot();
        }

        refresher.abort();
        info!("dispatcher stopped");
    }

    async fn handle(&self, signal: Signal) -> Result<(), Error> {
        match signal {
            Signal::Start => self.start_tasks(),
            Signal::Reload => self.reload_tasks().await,
            Signal::Pause => {
                self.pause_tasks().await;
                Ok(())
            }
            Signal::Exit => {
                self.exit_tasks().await;
                Ok(())
            }
            Signal::Action { action, target } => self.act(action, &target).await,
        }
    }

    fn start_tasks(&self) -> Result<(), Error> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("tasks have already been started");
            return Err(ErrorKind::AlreadyRunning.into());
        }

        let commands = self.commands();
        let state = self.state();
        let mut daemons = 0;

        for process in commands.iter() {
            if process.is_cron() {
                match cron::register(&state, process) {
                    Ok(granularity) => {
                        debug!(id = %process.id(), ?granularity, "cron command registered")
                    }
                    Err(e) => warn!(id = %process.id(), "cron command skipped: {}", e),
                }
                continue;
            }

            if process.is_paused() {
                debug!(id = %process.id(), "paused, not started");
                continue;
            }

            daemons += 1;
            if state.is_broken(process.id()) {
                continue;
            }
            if self.supervise(&state, process) {
                info!(id = %process.id(), name = %process.name(), "supervising");
            } else {
                warn!(id = %process.id(), "not started, a previous monitor loop is still alive");
            }
        }
        state.set_tasks_num(daemons);

        if state.has_cron_jobs() && state.mark_cron_started() {
            cron::spawn_tickers(Arc::clone(&state), Arc::clone(&self.running));
        }

        let mut history = self.history.lock();
        let now = unix_now();
        match history.start_time {
            None => history.start_time = Some(now),
            Some(_) => history.reload_times.push(now),
        }

        Ok(())
    }

    async fn reload_tasks(&self) -> Result<(), Error> {
        let commands = self.source.load().await.map_err(|e| {
            warn!("reload failed, keeping the current commands: {}", e);
            e
        })?;

        self.exit_tasks().await;
        info!(commands = commands.len(), "installing reloaded commands");

        *self.commands.write() = Arc::new(commands);
        *self.state.write() = Arc::new(SupervisorState::new());
        self.refresh_snapshot();

        self.start_tasks()
    }

    /// Stops every daemon and waits for their monitor loops, the state keeps its flap records
    async fn pause_tasks(&self) {
        self.running.store(false, Ordering::SeqCst);

        // loops between two runs are not registered, they stop at their next check
        let commands = self.commands();
        for process in commands.iter().filter(|p| !p.is_cron()) {
            process.revoke_supervision();
        }

        for entry in self.state().drain_running() {
            stop(&entry.process);
        }

        let loops: Vec<_> = self.loops.lock().drain().collect();
        for (id, handle) in loops {
            join_loop(&id, handle).await;
        }
    }

    /// Stops everything, including live cron runs, and retires the state
    async fn exit_tasks(&self) {
        self.pause_tasks().await;

        let commands = self.commands();
        for process in commands.iter().filter(|p| p.is_cron() && p.is_alive()) {
            stop(process);
        }

        self.state().retire();
    }

    async fn act(&self, action: Action, target: &str) -> Result<(), Error> {
        let commands = self.commands();
        let process = commands
            .resolve(target)
            .cloned()
            .ok_or_else(|| ErrorKind::NotFound(target.to_string()))?;
        let state = self.state();
        let id = process.id();

        info!(id = %id, action = action.name(), "command action");
        match action {
            Action::Exit => {
                state.remove_running(id);
                stop(&process);
                self.join_loop_of(id).await;
                process.reset_pid();
                Ok(())
            }
            Action::Exec => self.launch(&state, &process),
            Action::Reload if process.is_cron() => {
                if process.is_alive() {
                    stop(&process);
                }
                Ok(())
            }
            Action::Reload => {
                if state.is_running(id) && process.is_supervised() {
                    process.request_restart();
                    process.kill()
                } else {
                    state.clear_broken(id);
                    self.launch(&state, &process)
                }
            }
            Action::Start => {
                process.set_run();
                if !process.is_cron() && self.is_running() && !process.is_supervised() {
                    state.clear_broken(id);
                    self.launch(&state, &process)?;
                }
                Ok(())
            }
            Action::Pause => {
                process.set_pause();
                // a loop past its pause check still sees the revoke after it registers
                process.revoke_supervision();
                state.remove_running(id);
                if process.is_alive() {
                    stop(&process);
                }
                self.join_loop_of(id).await;
                Ok(())
            }
        }
    }

    /// Runs the command now: a single run for cron commands, a monitor loop for daemons
    fn launch(&self, state: &Arc<SupervisorState>, process: &Arc<ManagedProcess>) -> Result<(), Error> {
        if process.is_cron() {
            tokio::spawn(cron::run_once(Arc::clone(process)));
            return Ok(());
        }

        if process.is_paused() {
            return Err(format!("{} is paused", process.id()).into());
        }

        if self.supervise(state, process) {
            Ok(())
        } else {
            Err(format!("{} is already running", process.id()).into())
        }
    }

    /// Spawns a monitor loop and keeps its handle so teardown can wait for it
    fn supervise(&self, state: &Arc<SupervisorState>, process: &Arc<ManagedProcess>) -> bool {
        match monitor::spawn(Arc::clone(process), Arc::clone(state), self.policy) {
            Some(handle) => {
                let mut loops = self.loops.lock();
                loops.retain(|_, handle| !handle.is_finished());
                loops.insert(process.id().to_string(), handle);
                true
            }
            None => false,
        }
    }

    async fn join_loop_of(&self, id: &str) {
        let handle = self.loops.lock().remove(id);
        if let Some(handle) = handle {
            join_loop(id, handle).await;
        }
    }
}

async fn join_loop(id: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!(id = %id, "monitor loop failed: {}", e);
    }
}

/// Ends supervision and kills the process, its running registration must already be gone
fn stop(process: &ManagedProcess) {
    process.revoke_supervision();
    match process.kill() {
        Ok(()) => info!(id = %process.id(), pid = process.pid(), "killed"),
        Err(e) => debug!(id = %process.id(), "kill: {}", e),
    }
}

fn all_broken(snapshot: &StatusSnapshot) -> bool {
    snapshot.tasks_num > 0 && snapshot.broken_num >= snapshot.tasks_num
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::{CommandSpec, StaticCommands};
    use crate::control::{Control, ControlSender};

    fn spec(cmd: &str, args: &[&str], name: &str) -> CommandSpec {
        CommandSpec {
            cmd: cmd.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            name: Some(name.to_string()),
            ..CommandSpec::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "timed out: {}", what);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn supervisor(specs: Vec<CommandSpec>) -> (Arc<Supervisor>, ControlSender, JoinHandle<()>) {
        let source = StaticCommands::new(specs, Path::new("/"));
        let commands = source.load().await.expect("commands");
        let supervisor = Arc::new(Supervisor::new(
            commands,
            Box::new(source),
            FlapPolicy::default(),
        ));

        let (rx, tx) = Control::new().split();
        let dispatcher = tokio::spawn(Arc::clone(&supervisor).run(rx));
        (supervisor, tx, dispatcher)
    }

    fn sleepers() -> Vec<CommandSpec> {
        vec![
            spec("/bin/sleep", &["30"], "alpha"),
            spec("/bin/sleep", &["30"], "beta"),
        ]
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (supervisor, tx, dispatcher) = supervisor(sleepers()).await;

        tx.send(Signal::Start).await.expect("start");
        let err = tx.send(Signal::Start).await.expect_err("second start");
        assert!(matches!(err.kind(), ErrorKind::AlreadyRunning));

        wait_for("both running", || supervisor.state().snapshot().running_num == 2).await;
        assert_eq!(supervisor.snapshot().tasks_num, 2);
        assert!(supervisor.history().start_time.is_some());

        tx.send(Signal::Exit).await.expect("exit");
        dispatcher.await.expect("dispatcher");
        assert_eq!(supervisor.snapshot().running_num, 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (supervisor, tx, dispatcher) = supervisor(sleepers()).await;

        tx.send(Signal::Start).await.expect("start");
        wait_for("both running", || supervisor.state().snapshot().running_num == 2).await;

        tx.send(Signal::Pause).await.expect("pause");
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.snapshot().running_num, 0);
        assert_eq!(supervisor.snapshot().broken_num, 0);

        let commands = supervisor.commands();
        for process in commands.iter() {
            wait_for("loop end", || !process.is_supervised()).await;
        }

        tx.send(Signal::Start).await.expect("resume");
        wait_for("running again", || supervisor.state().snapshot().running_num == 2).await;
        assert_eq!(supervisor.history().reload_times.len(), 1);

        tx.send(Signal::Exit).await.expect("exit");
        dispatcher.await.expect("dispatcher");
    }

    #[tokio::test]
    async fn test_pause_then_start_without_waiting() {
        let (supervisor, tx, dispatcher) = supervisor(sleepers()).await;
        tx.send(Signal::Start).await.expect("start");
        wait_for("both running", || supervisor.state().snapshot().running_num == 2).await;

        for _ in 0..10 {
            tx.send(Signal::Pause).await.expect("pause");
            for process in supervisor.commands().iter() {
                assert!(!process.is_supervised());
                assert!(!process.is_alive());
            }
            tx.send(Signal::Start).await.expect("start");
        }

        wait_for("both running", || supervisor.state().snapshot().running_num == 2).await;
        assert!(supervisor.commands().iter().all(|p| p.is_supervised()));

        tx.send(Signal::Exit).await.expect("exit");
        dispatcher.await.expect("dispatcher");
    }

    #[tokio::test]
    async fn test_pause_right_after_start() {
        let (supervisor, tx, dispatcher) = supervisor(sleepers()).await;
        tx.send(Signal::Start).await.expect("start");

        let alpha = Arc::clone(supervisor.commands().resolve("alpha").expect("alpha"));
        let act = |action| Signal::Action {
            action,
            target: alpha.id().to_string(),
        };

        for _ in 0..10 {
            tx.send(act(Action::Pause)).await.expect("pause alpha");
            assert!(!alpha.is_supervised());
            assert!(!alpha.is_alive());
            assert!(!supervisor.state().is_running(alpha.id()));

            tx.send(act(Action::Start)).await.expect("start alpha");
        }

        tx.send(act(Action::Pause)).await.expect("pause alpha");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!alpha.is_supervised());
        assert!(!supervisor.state().is_running(alpha.id()));

        tx.send(Signal::Exit).await.expect("exit");
        dispatcher.await.expect("dispatcher");
    }

    #[tokio::test]
    async fn test_command_actions() {
        let (supervisor, tx, dispatcher) = supervisor(sleepers()).await;
        tx.send(Signal::Start).await.expect("start");
        wait_for("both running", || supervisor.state().snapshot().running_num == 2).await;

        let alpha = Arc::clone(supervisor.commands().resolve("alpha").expect("alpha"));
        let act = |action| Signal::Action {
            action,
            target: "alp".to_string(),
        };

        tx.send(act(Action::Pause)).await.expect("pause alpha");
        assert!(alpha.is_paused());
        wait_for("alpha loop end", || !alpha.is_supervised()).await;
        assert_eq!(supervisor.snapshot().running_num, 1);

        // a paused daemon is not executed
        assert!(tx.send(act(Action::Exec)).await.is_err());

        tx.send(act(Action::Start)).await.expect("start alpha");
        wait_for("alpha running", || supervisor.state().is_running(alpha.id())).await;

        let pid = alpha.pid();
        tx.send(act(Action::Reload)).await.expect("reload alpha");
        wait_for("alpha restarted", || {
            supervisor.state().is_running(alpha.id()) && alpha.pid() != pid && alpha.pid() > 0
        })
        .await;

        tx.send(act(Action::Exit)).await.expect("exit alpha");
        wait_for("alpha loop end", || !alpha.is_supervised()).await;
        assert!(!supervisor.state().is_running(alpha.id()));

        let snapshot = supervisor.state().snapshot();
        assert_eq!(snapshot.broken_num, 0);
        assert_eq!(snapshot.break_record(alpha.id()), (0, 0));

        let err = tx
            .send(Signal::Action {
                action: Action::Exit,
                target: "nobody".to_string(),
            })
            .await
            .expect_err("unknown target");
        assert!(matches!(err.kind(), ErrorKind::NotFound(_)));

        tx.send(Signal::Exit).await.expect("exit");
        dispatcher.await.expect("dispatcher");
    }

    #[tokio::test]
    async fn test_reload_replaces_generation() {
        let (supervisor, tx, dispatcher) = supervisor(sleepers()).await;
        tx.send(Signal::Start).await.expect("start");
        wait_for("both running", || supervisor.state().snapshot().running_num == 2).await;

        let old_state = supervisor.state();
        let old_ids: Vec<String> = supervisor
            .commands()
            .iter()
            .map(|p| p.id().to_string())
            .collect();

        tx.send(Signal::Reload).await.expect("reload");
        assert!(old_state.is_retired());
        assert_eq!(old_state.snapshot().running_num, 0);

        let commands = supervisor.commands();
        assert_eq!(commands.len(), 2);
        for id in &old_ids {
            assert!(commands.get(id).is_none());
        }
        wait_for("new generation running", || {
            supervisor.state().snapshot().running_num == 2
        })
        .await;

        tx.send(Signal::Exit).await.expect("exit");
        dispatcher.await.expect("dispatcher");
    }

    #[tokio::test]
    async fn test_dropped_sender_tears_down() {
        let (supervisor, tx, dispatcher) = supervisor(sleepers()).await;
        tx.send(Signal::Start).await.expect("start");
        wait_for("both running", || supervisor.state().snapshot().running_num == 2).await;

        drop(tx);
        dispatcher.await.expect("dispatcher");

        assert!(supervisor.state().is_retired());
        for process in supervisor.commands().iter() {
            wait_for("loop end", || !process.is_supervised()).await;
        }
    }
}
