// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, error, warn};

use crate::error::ErrorKind;
use crate::Error;

/// Pid value of a process that has never been started, or was reset administratively
pub const NOT_RUNNING: libc::pid_t = 0;
/// Pid value of a process that has been waited on and reaped
pub const TERMINATED: libc::pid_t = -1;

#[derive(Debug, Default)]
struct Supervision {
    /// Epoch of the monitor loop that is alive, if any
    active: Option<u64>,
    /// Only a loop holding the current epoch may keep restarting
    epoch: u64,
}

/// One configured external program.
///
/// The configuration (id, name, program, args, output, cron) is fixed once the process is placed
///  in a registry. The pid, pause flag and child handle change while the keeper runs and are safe
///  to touch from any task.
#[derive(Debug)]
pub struct ManagedProcess {
    id: String,
    name: Option<String>,
    program: PathBuf,
    args: Vec<String>,
    output: Option<PathBuf>,
    cron: Option<String>,
    paused: AtomicBool,
    pid: AtomicI32,
    child: Mutex<Option<Child>>,
    supervision: Mutex<Supervision>,
    restart_requested: AtomicBool,
}

impl ManagedProcess {
    pub fn new(
        id: impl Into<String>,
        program: impl Into<PathBuf>,
        args: Vec<String>,
        output: Option<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            program: program.into(),
            args,
            output,
            cron: None,
            paused: AtomicBool::new(false),
            pid: AtomicI32::new(NOT_RUNNING),
            child: Mutex::new(None),
            supervision: Mutex::new(Supervision::default()),
            restart_requested: AtomicBool::new(false),
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name.filter(|n| !n.is_empty());
        self
    }

    /// Marks this as a cron command, an empty expression leaves it a daemon
    pub fn set_cron(mut self, expr: impl Into<String>) -> Self {
        let expr = expr.into();
        self.cron = if expr.trim().is_empty() {
            None
        } else {
            Some(expr)
        };
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The configured name, or the id if none was given
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    pub fn cron(&self) -> Option<&str> {
        self.cron.as_deref()
    }

    pub fn is_cron(&self) -> bool {
        self.cron.is_some()
    }

    /// The program and its arguments as one line, for display
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    pub fn set_pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn set_run(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid.load(Ordering::SeqCst)
    }

    /// True while a started process has not been reaped
    pub fn is_alive(&self) -> bool {
        self.pid() > 0
    }

    pub fn reset_pid(&self) {
        self.pid.store(NOT_RUNNING, Ordering::SeqCst);
    }

    /// Marks the pid as reaped, unless it was replaced by a newer start in the meantime
    pub(crate) fn mark_terminated(&self, pid: libc::pid_t) {
        self.pid
            .compare_exchange(pid, TERMINATED, Ordering::SeqCst, Ordering::SeqCst)
            .ok();
    }

    /// Launches the program, returns the new pid or `0` if it could not be started.
    ///
    /// stdout and stderr are appended to the output file. When there is no output file, or it
    ///  can not be opened, the child inherits the keeper's stdout.
    pub fn start(&self) -> libc::pid_t {
        let (stdout, stderr) = self.output_stdio();

        let spawned = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn();

        match spawned {
            Ok(child) => {
                let pid = child
                    .id()
                    .map(|id| id as libc::pid_t)
                    .unwrap_or(NOT_RUNNING);
                *self.child.lock() = Some(child);
                self.pid.store(pid, Ordering::SeqCst);

                debug!(id = %self.id, pid, "started {}", self.command_line());
                pid
            }
            Err(e) => {
                error!(id = %self.id, "{} start failed: {}", self.program.display(), e);
                NOT_RUNNING
            }
        }
    }

    fn output_stdio(&self) -> (Stdio, Stdio) {
        let file = self.output.as_ref().and_then(|path| {
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .map_err(|e| {
                    warn!(id = %self.id, "could not open output {}: {}", path.display(), e)
                })
                .ok()
        });

        match file.and_then(|out| out.try_clone().ok().map(|err| (out, err))) {
            Some((out, err)) => (Stdio::from(out), Stdio::from(err)),
            None => (Stdio::inherit(), Stdio::inherit()),
        }
    }

    /// Waits for the running process to exit.
    ///
    /// Returns `NotStarted` if there is no handle to wait on, i.e. the process was never started
    ///  or some other task already reaped it.
    pub async fn wait(&self) -> Result<ExitStatus, Error> {
        let child = self.child.lock().take();
        let mut child = child.ok_or_else(|| ErrorKind::NotStarted(self.id.clone()))?;

        let pid = child.id().map(|id| id as libc::pid_t);
        let status = child.wait().await;

        if let Some(pid) = pid {
            self.mark_terminated(pid);
        }

        Ok(status?)
    }

    /// Delivers `sig` to the live process
    pub fn signal(&self, sig: Signal) -> Result<(), Error> {
        let pid = self.pid();
        if pid <= 0 {
            return Err(ErrorKind::NotStarted(self.id.clone()).into());
        }

        signal::kill(Pid::from_raw(pid), sig)?;
        Ok(())
    }

    /// Sends SIGKILL, addressed by pid since the handle may be held by a waiting task
    pub fn kill(&self) -> Result<(), Error> {
        self.signal(Signal::SIGKILL)
    }

    /// Claims the right to run a monitor loop, `None` while another loop is still alive
    pub(crate) fn claim_supervision(&self) -> Option<u64> {
        let mut supervision = self.supervision.lock();
        if supervision.active.is_some() {
            return None;
        }

        supervision.epoch += 1;
        supervision.active = Some(supervision.epoch);
        Some(supervision.epoch)
    }

    pub(crate) fn release_supervision(&self, epoch: u64) {
        let mut supervision = self.supervision.lock();
        if supervision.active == Some(epoch) {
            supervision.active = None;
        }
    }

    /// Tells the live monitor loop, if any, to stop at its next check
    pub(crate) fn revoke_supervision(&self) {
        self.supervision.lock().epoch += 1;
    }

    pub(crate) fn holds_supervision(&self, epoch: u64) -> bool {
        let supervision = self.supervision.lock();
        supervision.active == Some(epoch) && supervision.epoch == epoch
    }

    /// True while a monitor loop for this process is alive, revoked or not
    pub fn is_supervised(&self) -> bool {
        self.supervision.lock().active.is_some()
    }

    pub(crate) fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_restart_request(&self) -> bool {
        self.restart_requested.swap(false, Ordering::SeqCst)
    }
}
