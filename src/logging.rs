// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::Error;

const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber, `RUST_LOG` overrides the `info` default.
///
/// With a log file everything is appended there without ansi colors, otherwise it goes to stdout.
pub fn init(log_file: Option<&Path>) -> Result<(), Error> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let file_layer = fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false);
            subscriber
                .with(file_layer)
                .try_init()
                .map_err(|e| format!("logging already initialized: {}", e))?;
        }
        None => {
            subscriber
                .with(fmt::layer())
                .try_init()
                .map_err(|e| format!("logging already initialized: {}", e))?;
        }
    }

    Ok(())
}
