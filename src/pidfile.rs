// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Files the keeper leaves behind while it runs: its pid, the pids of its children, and a
//!  description that lets `keeperctl` find it.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal;
use nix::unistd::{self, AccessFlags, Pid};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::procs::Supervisor;
use crate::Error;

const FILE_PREFIX: &str = "taskkeeper";
const SYSTEM_RUN_DIR: &str = "/var/run";
const CHILD_PIDS_PERIOD: Duration = Duration::from_secs(1);

/// Locations of the runtime files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub pid_file: PathBuf,
    pub child_pids_file: PathBuf,
    pub desc_file: PathBuf,
    pub socket: PathBuf,
    pub default_log: PathBuf,
}

impl RuntimePaths {
    /// Uses `/var/run` if this process may write there, the temp dir otherwise
    pub fn detect() -> Self {
        let run_dir = Path::new(SYSTEM_RUN_DIR);
        if unistd::access(run_dir, AccessFlags::W_OK).is_ok() {
            Self::in_dir(run_dir)
        } else {
            Self::in_dir(env::temp_dir())
        }
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            pid_file: dir.join(format!("{}.pid", FILE_PREFIX)),
            child_pids_file: dir.join(format!("{}.childs.pid", FILE_PREFIX)),
            desc_file: dir.join(format!("{}.pid.desc", FILE_PREFIX)),
            socket: dir.join(format!("{}.sock", FILE_PREFIX)),
            default_log: env::temp_dir().join(format!("{}.log", FILE_PREFIX)),
        }
    }
}

/// Fails if the pid file names a process that is still alive.
///
/// Missing files, unreadable contents and stale pids are all fine to start over.
pub fn check_pid_file(path: &Path) -> Result<(), Error> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let pid: libc::pid_t = match contents.trim().parse() {
        Ok(pid) if pid > 0 => pid,
        _ => {
            warn!("ignoring unreadable pid file {}", path.display());
            return Ok(());
        }
    };

    if signal::kill(Pid::from_raw(pid), None).is_ok() {
        return Err(format!("process {} from {} is alive", pid, path.display()).into());
    }

    debug!(pid, "stale pid file {}", path.display());
    Ok(())
}

pub fn write_pid_file(path: &Path, pid: libc::pid_t) -> Result<(), Error> {
    fs::write(path, pid.to_string())?;
    Ok(())
}

/// Removes `path`, a missing file is not an error
pub fn remove_file(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

pub fn write_child_pids(path: &Path, pids: &[libc::pid_t]) -> Result<(), Error> {
    let line = pids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("|");
    fs::write(path, line)?;
    Ok(())
}

pub fn read_child_pids(path: &Path) -> Result<Vec<libc::pid_t>, Error> {
    fs::read_to_string(path)?
        .split('|')
        .filter(|pid| !pid.trim().is_empty())
        .map(|pid| {
            pid.trim()
                .parse()
                .map_err(|_| Error::from(format!("bad pid `{}` in {}", pid, path.display())))
        })
        .collect()
}

/// Rewrites the child pid file from the status snapshot every second
pub fn spawn_child_pids_writer(supervisor: Arc<Supervisor>, path: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CHILD_PIDS_PERIOD);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let pids = supervisor.snapshot().running_pids();
            if let Err(e) = write_child_pids(&path, &pids) {
                warn!("could not write child pids to {}: {}", path.display(), e);
                break;
            }
        }
    })
}

/// Where a running keeper can be reached, written as JSON next to the pid file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescription {
    pub config: PathBuf,
    pub tcp_addr: String,
    pub socket: PathBuf,
    pub pid: libc::pid_t,
    pub pid_file: PathBuf,
    pub child_pids_file: PathBuf,
    pub log_file: Option<PathBuf>,
    pub workdir: PathBuf,
}

impl ProcessDescription {
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, Error> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}
