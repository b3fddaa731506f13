// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use clap::{Arg, ArgAction, ArgGroup, ArgMatches, Command};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime;

use taskkeeper::config::{DEFAULT_HOST, DEFAULT_PORT};
use taskkeeper::control::Action;
use taskkeeper::msg::{self, ErrorCode, PRETTY_FLAG, VERB_CTL, VERB_STAT};
use taskkeeper::pidfile::{ProcessDescription, RuntimePaths};
use taskkeeper::Error;

const SIGNAL: &str = "signal";
const CATEGORY: &str = "cat";
const HOST: &str = "host";
const PORT: &str = "port";
const ARGS: &str = "args";

fn app() -> Command {
    Command::new("keeperctl")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Control client for a running keeper")
        .arg(
            Arg::new(SIGNAL)
                .short('s')
                .long(SIGNAL)
                .value_name("SIGNAL")
                .value_parser(["reload", "exit", "start", "pause", "act"])
                .help("signal to send, `act <exit|exec|reload|start|pause> <cmd>` acts on one command"),
        )
        .arg(
            Arg::new(CATEGORY)
                .long(CATEGORY)
                .value_name("CATEGORY")
                .value_parser(["cmd", "cmdlist", "server", "config"])
                .help("status to show, `cmd` needs a command id, id prefix or name"),
        )
        .arg(
            Arg::new(HOST)
                .short('H')
                .long(HOST)
                .value_name("HOST")
                .requires(PORT)
                .help("keeper host, read from the keeper's description file if not given"),
        )
        .arg(
            Arg::new(PORT)
                .short('p')
                .long(PORT)
                .value_name("PORT")
                .help("keeper port"),
        )
        .arg(
            Arg::new(ARGS)
                .value_name("ARGS")
                .num_args(0..)
                .action(ArgAction::Append),
        )
        .group(
            ArgGroup::new("request")
                .args([SIGNAL, CATEGORY])
                .required(true),
        )
}

fn main() -> Result<(), Error> {
    let args = app().get_matches();

    let request = request_line(&args)?;
    let addr = address(&args)?;

    let runtime = runtime::Builder::new_current_thread().enable_all().build()?;
    let response = runtime.block_on(exchange(&addr, &request))?;

    let (code, payload) =
        msg::split_response(&response).ok_or_else(|| format!("bad response: {}", response))?;
    println!("{}", payload);

    if code != ErrorCode::Success {
        std::process::exit(i32::from(code.code()));
    }
    Ok(())
}

fn positional(args: &ArgMatches) -> Vec<&str> {
    args.get_many::<String>(ARGS)
        .map(|values| values.map(String::as_str).collect())
        .unwrap_or_default()
}

/// Builds the protocol line for the requested signal or status
fn request_line(args: &ArgMatches) -> Result<String, Error> {
    let extra = positional(args);

    if let Some(signal) = args.get_one::<String>(SIGNAL) {
        if signal != "act" {
            return Ok(format!("{} {}", VERB_CTL, signal));
        }

        let (action, target) = match extra.as_slice() {
            [action, target, ..] => (*action, *target),
            _ => return Err("act needs an action and a command".into()),
        };
        let action = Action::from_name(action)
            .ok_or_else(|| format!("need act type, one of exit, exec, reload, start, pause: {}", action))?;

        return Ok(format!("{} act {} {}", VERB_CTL, action.code(), target));
    }

    match args.get_one::<String>(CATEGORY).map(String::as_str) {
        Some("cmd") => {
            let id = extra
                .first()
                .ok_or_else(|| Error::from("cmd needs a command id"))?;
            Ok(format!("{} {} cmd {}", VERB_STAT, PRETTY_FLAG, id))
        }
        Some(category) => Ok(format!("{} {} {}", VERB_STAT, PRETTY_FLAG, category)),
        None => Err("either --signal or --cat is required".into()),
    }
}

fn address(args: &ArgMatches) -> Result<String, Error> {
    if let Some(port) = args.get_one::<String>(PORT) {
        let host = args
            .get_one::<String>(HOST)
            .map(String::as_str)
            .unwrap_or(DEFAULT_HOST);
        return Ok(format!("{}:{}", host, port));
    }

    let desc_file = RuntimePaths::detect().desc_file;
    match ProcessDescription::read(&desc_file) {
        Ok(description) => Ok(description.tcp_addr),
        Err(e) => Err(format!(
            "load pid desc {} error: {}, is the keeper running? the default address is {}:{}",
            desc_file.display(),
            e,
            DEFAULT_HOST,
            DEFAULT_PORT
        )
        .into()),
    }
}

async fn exchange(addr: &str, request: &str) -> Result<String, Error> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| format!("connect {} error: {}", addr, e))?;

    stream.write_all(request.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.shutdown().await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}
