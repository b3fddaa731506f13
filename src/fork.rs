// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::env;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use nix::unistd::{self, Pid};

use crate::Error;

pub const CONFIG: &str = "config";
pub const WORKDIR: &str = "workdir";
pub const FORCE_LOG: &str = "flog";

/// Starts this binary again in the background, in its own process group, and returns its pid.
///
/// The copy gets the same config and work dir, and `--flog` so that its output is not lost with
///  the terminal.
pub fn relaunch_detached(config: &Path, workdir: &Path) -> Result<u32, Error> {
    if unistd::getppid() == Pid::from_raw(1) {
        return Err("process can not be started by a child process".into());
    }

    let program = env::current_exe()?;
    let child = Command::new(program)
        .arg(format!("--{}", CONFIG))
        .arg(config)
        .arg(format!("--{}", WORKDIR))
        .arg(workdir)
        .arg(format!("--{}", FORCE_LOG))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;

    Ok(child.id())
}
