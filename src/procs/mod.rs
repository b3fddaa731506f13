// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub mod cron;
pub mod monitor;
pub mod process;
mod registry;
mod supervisor;

pub use process::ManagedProcess;
pub use registry::CommandRegistry;
pub use supervisor::{History, Supervisor};
