// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Common library functions for the keeper and its control client

pub mod config;
pub mod control;
pub mod error;
pub mod fork;
pub mod listener;
pub mod logging;
pub mod msg;
pub mod pidfile;
pub mod procs;
pub mod state;

pub use error::Error;
