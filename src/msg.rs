// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The line protocol spoken on the control sockets
//!
//! Requests are `<verb> [f] <args...>`, with `f` asking for pretty printed JSON:
//!
//! ```text
//! ctl reload|exit|start|pause
//! ctl act <code> <target>        0=exit 1=exec 2=reload 3=start 4=pause
//! stat cmd <id or prefix>
//! stat cmdlist|server|config
//! ```
//!
//! Every request gets exactly one response line, `<code>|format:compact|<json>`, or
//!  `<code>|format:pretty|` followed by the JSON on the next lines.

use std::fmt;
use std::sync::Arc;

use chrono::{Local, TimeZone};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::control::{Action, ControlSender, Signal};
use crate::error::ErrorKind;
use crate::procs::{ManagedProcess, Supervisor};
use crate::state::{unix_now, StatusSnapshot};
use crate::Error;

pub const VERB_CTL: &str = "ctl";
pub const VERB_STAT: &str = "stat";
pub const PRETTY_FLAG: &str = "f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Compact,
    Pretty,
}

impl Format {
    fn name(self) -> &'static str {
        match self {
            Format::Compact => "compact",
            Format::Pretty => "pretty",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    Malformed = 1,
    UnknownVerb = 2,
    MissingId = 3,
    NotFound = 4,
    UnknownSignal = 5,
    MissingTarget = 6,
    Rejected = 7,
}

impl ErrorCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ErrorCode::Success),
            1 => Some(ErrorCode::Malformed),
            2 => Some(ErrorCode::UnknownVerb),
            3 => Some(ErrorCode::MissingId),
            4 => Some(ErrorCode::NotFound),
            5 => Some(ErrorCode::UnknownSignal),
            6 => Some(ErrorCode::MissingTarget),
            7 => Some(ErrorCode::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatQuery {
    Command(String),
    CommandList,
    Server,
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Control(Signal),
    Stat(StatQuery),
}

/// A request that could not be served, with the code it is answered with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProtocolError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<Error> for ProtocolError {
    fn from(err: Error) -> Self {
        let code = match err.kind() {
            ErrorKind::NotFound(_) => ErrorCode::NotFound,
            _ => ErrorCode::Rejected,
        };
        Self::new(code, err.to_string())
    }
}

/// Splits a request line into its format and the request.
///
/// The format is known as soon as there are two tokens, so even rejected requests are answered
///  in the format that was asked for.
pub fn parse(line: &str) -> (Format, Result<Request, ProtocolError>) {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 2 {
        return (
            Format::Compact,
            Err(ProtocolError::new(ErrorCode::Malformed, "wrong message")),
        );
    }

    let (format, args) = if tokens[1] == PRETTY_FLAG {
        (Format::Pretty, &tokens[2..])
    } else {
        (Format::Compact, &tokens[1..])
    };
    if args.is_empty() {
        return (
            format,
            Err(ProtocolError::new(ErrorCode::Malformed, "wrong message")),
        );
    }

    let request = match tokens[0] {
        VERB_CTL => parse_ctl(args).map(Request::Control),
        VERB_STAT => parse_stat(args).map(Request::Stat),
        verb => Err(ProtocolError::new(
            ErrorCode::UnknownVerb,
            format!("undefined ctl type: {}", verb),
        )),
    };
    (format, request)
}

fn parse_ctl(args: &[&str]) -> Result<Signal, ProtocolError> {
    if args[0] != "act" {
        return Signal::from_name(args[0]).ok_or_else(|| {
            ProtocolError::new(
                ErrorCode::UnknownSignal,
                format!("undefined signal name: {}", args[0]),
            )
        });
    }

    let (code, target) = match args {
        [_, code, target, ..] => (*code, *target),
        _ => {
            return Err(ProtocolError::new(
                ErrorCode::MissingTarget,
                "act needs an action and a target",
            ))
        }
    };

    let action = code
        .parse::<u8>()
        .ok()
        .and_then(Action::from_code)
        .or_else(|| Action::from_name(code))
        .ok_or_else(|| {
            ProtocolError::new(ErrorCode::Malformed, format!("undefined action: {}", code))
        })?;

    Ok(Signal::Action {
        action,
        target: target.to_string(),
    })
}

fn parse_stat(args: &[&str]) -> Result<StatQuery, ProtocolError> {
    match args[0] {
        "cmd" => args
            .get(1)
            .map(|id| StatQuery::Command(id.to_string()))
            .ok_or_else(|| ProtocolError::new(ErrorCode::MissingId, "miss cmd id")),
        "cmdlist" => Ok(StatQuery::CommandList),
        "server" => Ok(StatQuery::Server),
        "config" => Ok(StatQuery::Config),
        category => Err(ProtocolError::new(
            ErrorCode::Malformed,
            format!("undefined stat category: {}", category),
        )),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub code: ErrorCode,
    pub format: Format,
    pub payload: Value,
}

impl Response {
    pub fn ok(format: Format, payload: Value) -> Self {
        Self {
            code: ErrorCode::Success,
            format,
            payload,
        }
    }

    pub fn error(format: Format, err: ProtocolError) -> Self {
        Self {
            code: err.code,
            format,
            payload: json!({ "error": err.message }),
        }
    }

    /// The response as written to the socket, newline terminated
    pub fn to_wire(&self) -> String {
        match self.format {
            Format::Compact => format!(
                "{}|format:{}|{}\n",
                self.code,
                self.format.name(),
                self.payload
            ),
            Format::Pretty => format!(
                "{}|format:{}|\n{}\n",
                self.code,
                self.format.name(),
                serde_json::to_string_pretty(&self.payload).unwrap_or_default()
            ),
        }
    }
}

/// Splits a raw response into its code and the payload text
pub fn split_response(raw: &str) -> Option<(ErrorCode, &str)> {
    let mut parts = raw.splitn(3, '|');
    let code = parts
        .next()?
        .trim()
        .parse()
        .ok()
        .and_then(ErrorCode::from_code)?;

    if !parts.next()?.starts_with("format:") {
        return None;
    }
    Some((code, parts.next()?.trim()))
}

/// Status of one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CmdStatus {
    pub id: String,
    pub name: String,
    pub pid: libc::pid_t,
    pub cmd: String,
    pub output: String,
    pub cron: Option<String>,
    pub paused: bool,
    pub running: bool,
    pub broken: bool,
    pub brokens: u32,
    pub last_broken_time: i64,
}

impl CmdStatus {
    pub fn new(process: &ManagedProcess, snapshot: &StatusSnapshot) -> Self {
        let (brokens, last_broken_time) = snapshot.break_record(process.id());

        Self {
            id: process.id().to_string(),
            name: process.name().to_string(),
            pid: process.pid(),
            cmd: process.command_line(),
            output: process
                .output()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            cron: process.cron().map(ToString::to_string),
            paused: process.is_paused(),
            running: snapshot.running.contains_key(process.id()),
            broken: snapshot.broken.contains(process.id()),
            brokens,
            last_broken_time,
        }
    }
}

/// Status of the keeper itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub start_time: i64,
    pub start_date: String,
    pub reload_time_list: Vec<i64>,
    pub task_total_num: usize,
    pub running_task_list: Vec<String>,
    pub term_task_list: Vec<String>,
    pub running_seconds: i64,
    pub running_time: String,
    pub running: bool,
    pub broken_gap: i64,
    pub broken_times: u32,
}

impl ServerStatus {
    pub fn new(supervisor: &Supervisor) -> Self {
        let snapshot = supervisor.snapshot();
        let history = supervisor.history();
        let policy = supervisor.policy();

        let start_time = history.start_time.unwrap_or(0);
        let running_seconds = history
            .start_time
            .map_or(0, |start| (unix_now() - start).max(0));

        Self {
            start_time,
            start_date: history.start_time.map(format_date).unwrap_or_default(),
            reload_time_list: history.reload_times,
            task_total_num: snapshot.tasks_num,
            running_task_list: snapshot.running.keys().cloned().collect(),
            term_task_list: snapshot.broken.iter().cloned().collect(),
            running_seconds,
            running_time: format_seconds(running_seconds),
            running: supervisor.is_running(),
            broken_gap: policy.broken_gap,
            broken_times: policy.broken_times,
        }
    }
}

/// `93784` becomes `1d 2h 3m 4s`, leading zero units are left out
pub fn format_seconds(seconds: i64) -> String {
    let units: [(i64, &str); 3] = [(86_400, "d"), (3_600, "h"), (60, "m")];
    let mut rest = seconds.max(0);
    let mut parts = Vec::new();

    for (size, unit) in units.iter() {
        let count = rest / size;
        rest %= size;
        if count > 0 || !parts.is_empty() {
            parts.push(format!("{}{}", count, unit));
        }
    }
    parts.push(format!("{}s", rest));
    parts.join(" ")
}

fn format_date(timestamp: i64) -> String {
    Local
        .timestamp_opt(timestamp, 0)
        .single()
        .map(|date| date.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Serves request lines, one at a time
pub struct MessageHandler {
    supervisor: Arc<Supervisor>,
    control: ControlSender,
    lock: Mutex<()>,
}

impl MessageHandler {
    pub fn new(supervisor: Arc<Supervisor>, control: ControlSender) -> Self {
        Self {
            supervisor,
            control,
            lock: Mutex::new(()),
        }
    }

    pub async fn handle(&self, line: &str) -> Response {
        let _serialized = self.lock.lock().await;

        let (format, request) = parse(line);
        debug!(?format, ?request, "request");

        let payload = match request {
            Ok(Request::Control(signal)) => self.control(signal).await,
            Ok(Request::Stat(query)) => self.stat(query),
            Err(e) => Err(e),
        };

        match payload {
            Ok(payload) => Response::ok(format, payload),
            Err(e) => Response::error(format, e),
        }
    }

    async fn control(&self, signal: Signal) -> Result<Value, ProtocolError> {
        let name = signal.to_string();
        self.control.send(signal).await?;
        Ok(json!({ "signal": name, "result": "ok" }))
    }

    fn stat(&self, query: StatQuery) -> Result<Value, ProtocolError> {
        let value = match query {
            StatQuery::Command(reference) => {
                let commands = self.supervisor.commands();
                let process = commands.resolve(&reference).ok_or_else(|| {
                    ProtocolError::new(
                        ErrorCode::NotFound,
                        format!("can not find cmd id `{}`", reference),
                    )
                })?;
                serde_json::to_value(CmdStatus::new(process, &self.supervisor.snapshot()))
            }
            StatQuery::CommandList => {
                let snapshot = self.supervisor.snapshot();
                let list: Vec<CmdStatus> = self
                    .supervisor
                    .commands()
                    .iter()
                    .map(|process| CmdStatus::new(process, &snapshot))
                    .collect();
                serde_json::to_value(list)
            }
            StatQuery::Server => serde_json::to_value(ServerStatus::new(&self.supervisor)),
            StatQuery::Config => {
                let description = self.supervisor.description().ok_or_else(|| {
                    ProtocolError::new(ErrorCode::NotFound, "no process description")
                })?;
                serde_json::to_value(description)
            }
        };

        value.map_err(|e| ProtocolError::from(Error::from(e)))
    }
}
