// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;

use tokio::sync::{mpsc, oneshot};

use crate::error::ErrorKind;
use crate::Error;

/// Operation on a single command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Exit = 0,
    Exec = 1,
    Reload = 2,
    Start = 3,
    Pause = 4,
}

impl Action {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Action::Exit),
            1 => Some(Action::Exec),
            2 => Some(Action::Reload),
            3 => Some(Action::Start),
            4 => Some(Action::Pause),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "exit" => Some(Action::Exit),
            "exec" => Some(Action::Exec),
            "reload" => Some(Action::Reload),
            "start" => Some(Action::Start),
            "pause" => Some(Action::Pause),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Action::Exit => "exit",
            Action::Exec => "exec",
            Action::Reload => "reload",
            Action::Start => "start",
            Action::Pause => "pause",
        }
    }
}

/// Everything the dispatcher reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Start,
    Reload,
    Exit,
    Pause,
    Action { action: Action, target: String },
}

impl Signal {
    /// Looks up the signals that take no arguments
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "start" => Some(Signal::Start),
            "reload" => Some(Signal::Reload),
            "exit" => Some(Signal::Exit),
            "pause" => Some(Signal::Pause),
            _ => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Start => f.write_str("start"),
            Signal::Reload => f.write_str("reload"),
            Signal::Exit => f.write_str("exit"),
            Signal::Pause => f.write_str("pause"),
            Signal::Action { action, target } => write!(f, "act {} {}", action.name(), target),
        }
    }
}

/// A signal together with the slot its outcome is reported on
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) signal: Signal,
    pub(crate) reply: oneshot::Sender<Result<(), Error>>,
}

/// The single slot channel between signal producers and the dispatcher.
///
/// Create it once, hand the receiver to the dispatcher and clone the sender for everyone else.
pub struct Control {
    read: ControlReceiver,
    write: ControlSender,
}

impl Control {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            read: ControlReceiver { rx },
            write: ControlSender { tx },
        }
    }

    pub fn split(self) -> (ControlReceiver, ControlSender) {
        let Control { read, write } = self;
        (read, write)
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<Envelope>,
}

impl ControlSender {
    /// Delivers `signal` and waits until the dispatcher has handled it
    pub async fn send(&self, signal: Signal) -> Result<(), Error> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(Envelope { signal, reply })
            .await
            .map_err(|_| ErrorKind::ChannelClosed)?;

        outcome.await.map_err(|_| ErrorKind::ChannelClosed)?
    }
}

#[derive(Debug)]
pub struct ControlReceiver {
    rx: mpsc::Receiver<Envelope>,
}

impl ControlReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}
