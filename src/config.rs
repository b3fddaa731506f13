// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Keeper configuration, read from a YAML file
//!
//! ```yaml
//! host: 127.0.0.1
//! port: 17101
//! broken_gap: 5
//! log: logs/keeper.log
//! cmds:
//!   - cmd: bin/worker
//!     args: ["--queue", "default"]
//!     output: logs/worker.log
//!     name: worker
//!   - cmd: bin/report
//!     cron: "0 */5 * * * *"
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ErrorKind;
use crate::procs::{CommandRegistry, ManagedProcess};
use crate::state::{FlapPolicy, DEFAULT_BROKEN_GAP, DEFAULT_BROKEN_TIMES};
use crate::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 17101;

/// Port may be written as a number or a string
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Port {
    Number(u16),
    Text(String),
}

/// One entry of `cmds`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeeperConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<Port>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub broken_gap: Option<i64>,
    #[serde(default)]
    pub broken_times: Option<u32>,
    #[serde(default)]
    pub log: Option<String>,
    #[serde(default)]
    pub cmds: Vec<CommandSpec>,
}

impl FromStr for KeeperConfig {
    type Err = Error;

    fn from_str(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

impl KeeperConfig {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        std::fs::read_to_string(path)?.parse()
    }

    /// `host:port` the tcp listener binds to
    pub fn tcp_addr(&self) -> String {
        let host = self
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_HOST);

        match &self.port {
            Some(Port::Number(port)) => format!("{}:{}", host, port),
            Some(Port::Text(port)) if !port.is_empty() => format!("{}:{}", host, port),
            _ => format!("{}:{}", host, DEFAULT_PORT),
        }
    }

    pub fn policy(&self) -> FlapPolicy {
        FlapPolicy {
            broken_gap: self
                .broken_gap
                .filter(|gap| *gap > 0)
                .unwrap_or(DEFAULT_BROKEN_GAP),
            broken_times: self
                .broken_times
                .filter(|times| *times > 0)
                .unwrap_or(DEFAULT_BROKEN_TIMES),
        }
    }

    /// The configured work dir resolved against `base`, or `base` itself
    pub fn workdir(&self, base: &Path) -> PathBuf {
        match &self.workdir {
            Some(dir) if !dir.as_os_str().is_empty() => resolve_path(base, dir),
            _ => base.to_path_buf(),
        }
    }

    pub fn log_file(&self, workdir: &Path) -> Option<PathBuf> {
        self.log
            .as_deref()
            .filter(|log| !log.is_empty())
            .map(|log| resolve_path(workdir, log))
    }

    pub fn build_registry(&self, workdir: &Path) -> Result<CommandRegistry, Error> {
        build_registry(&self.cmds, workdir)
    }
}

/// Turns command entries into a registry with fresh ids, entries without `cmd` are skipped
pub fn build_registry(specs: &[CommandSpec], workdir: &Path) -> Result<CommandRegistry, Error> {
    let mut registry = CommandRegistry::new();

    for spec in specs.iter().filter(|spec| !spec.cmd.trim().is_empty()) {
        let output = spec
            .output
            .as_deref()
            .filter(|output| !output.is_empty())
            .map(|output| resolve_path(workdir, output));

        let process = ManagedProcess::new(
            registry.generate_id(),
            resolve_command(workdir, spec.cmd.trim()),
            spec.args.clone(),
            output,
        )
        .with_name(spec.name.clone())
        .set_cron(spec.cron.clone().unwrap_or_default());

        registry.insert(process)?;
    }

    if registry.is_empty() {
        return Err(ErrorKind::NoCommands.into());
    }
    Ok(registry)
}

pub fn resolve_path(workdir: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

/// Bare program names are looked up on `PATH`, anything with a separator is relative to `workdir`
pub fn resolve_command(workdir: &Path, cmd: &str) -> PathBuf {
    let path = Path::new(cmd);
    if path.is_absolute() || path.components().count() > 1 {
        return resolve_path(workdir, path);
    }

    env::var_os("PATH")
        .and_then(|paths| {
            env::split_paths(&paths)
                .map(|dir| dir.join(cmd))
                .find(|candidate| candidate.is_file())
        })
        .unwrap_or_else(|| workdir.join(cmd))
}

/// Where a (re)load gets its commands from
#[async_trait]
pub trait CommandSource: Send + Sync {
    async fn load(&self) -> Result<CommandRegistry, Error>;
}

/// Re-reads the `cmds` of a config file, everything else keeps its startup value
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
    workdir: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            workdir: workdir.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CommandSource for ConfigFile {
    async fn load(&self) -> Result<CommandRegistry, Error> {
        let yaml = tokio::fs::read_to_string(&self.path).await?;
        let config: KeeperConfig = yaml.parse()?;
        config.build_registry(&self.workdir)
    }
}

/// A fixed list of commands, each load hands out fresh ids
#[derive(Debug, Clone)]
pub struct StaticCommands {
    specs: Vec<CommandSpec>,
    workdir: PathBuf,
}

impl StaticCommands {
    pub fn new(specs: Vec<CommandSpec>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            specs,
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl CommandSource for StaticCommands {
    async fn load(&self) -> Result<CommandRegistry, Error> {
        build_registry(&self.specs, &self.workdir)
    }
}
