// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tokio::runtime;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use taskkeeper::config::{resolve_path, ConfigFile, KeeperConfig};
use taskkeeper::control::{Control, ControlSender, Signal};
use taskkeeper::fork::{self, CONFIG, FORCE_LOG, WORKDIR};
use taskkeeper::listener;
use taskkeeper::logging;
use taskkeeper::msg::MessageHandler;
use taskkeeper::pidfile::{self, ProcessDescription, RuntimePaths};
use taskkeeper::procs::{CommandRegistry, Supervisor};
use taskkeeper::Error;

const DAEMON: &str = "daemon";
const DEFAULT_CONFIG: &str = "config/config.yml";

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
}

impl SetupClapApp for Command {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
            .about(env!("CARGO_PKG_DESCRIPTION"))
    }
}

fn app() -> Command {
    Command::new("keeper")
        .setup_clap_app()
        .arg(
            Arg::new(DAEMON)
                .short('d')
                .long(DAEMON)
                .action(ArgAction::SetTrue)
                .help("run in the background"),
        )
        .arg(
            Arg::new(CONFIG)
                .short('c')
                .visible_short_alias('f')
                .long(CONFIG)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .default_value(DEFAULT_CONFIG)
                .help("config file in YAML format"),
        )
        .arg(
            Arg::new(WORKDIR)
                .short('w')
                .long(WORKDIR)
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("directory relative paths start from, defaults to the current directory"),
        )
        .arg(
            Arg::new(FORCE_LOG)
                .long(FORCE_LOG)
                .action(ArgAction::SetTrue)
                .help("log to the default log file when the config names none"),
        )
}

/// Everything `serve` needs, gathered before the runtime exists
struct Startup {
    config: KeeperConfig,
    config_path: PathBuf,
    workdir: PathBuf,
    log_file: Option<PathBuf>,
    paths: RuntimePaths,
    commands: CommandRegistry,
}

fn main() -> Result<(), Error> {
    let args = app().get_matches();

    let base = base_dir(&args)?;
    let config_path = args
        .get_one::<PathBuf>(CONFIG)
        .map(|path| resolve_path(&base, path))
        .unwrap_or_else(|| base.join(DEFAULT_CONFIG));
    let config = KeeperConfig::from_file(&config_path)
        .map_err(|e| format!("check config {} error: {}", config_path.display(), e))?;

    let paths = RuntimePaths::detect();
    pidfile::check_pid_file(&paths.pid_file)?;

    if args.get_flag(DAEMON) {
        let pid = fork::relaunch_detached(&config_path, &base)?;
        println!("+[{}]", pid);
        return Ok(());
    }

    let workdir = config.workdir(&base);
    let log_file = config
        .log_file(&workdir)
        .or_else(|| args.get_flag(FORCE_LOG).then(|| paths.default_log.clone()));
    logging::init(log_file.as_deref())?;

    let commands = config
        .build_registry(&workdir)
        .map_err(|e| format!("config file error in {}: {}", config_path.display(), e))?;

    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(serve(Startup {
        config,
        config_path,
        workdir,
        log_file,
        paths,
        commands,
    }))
}

fn base_dir(args: &ArgMatches) -> Result<PathBuf, Error> {
    let current = env::current_dir()?;
    Ok(match args.get_one::<PathBuf>(WORKDIR) {
        Some(dir) => resolve_path(&current, dir),
        None => current,
    })
}

async fn serve(startup: Startup) -> Result<(), Error> {
    let Startup {
        config,
        config_path,
        workdir,
        log_file,
        paths,
        commands,
    } = startup;

    let source = ConfigFile::new(&config_path, &workdir);
    let supervisor = Arc::new(Supervisor::new(
        commands,
        Box::new(source),
        config.policy(),
    ));

    let tcp = listener::bind_tcp(&config.tcp_addr()).await?;
    let unix = listener::bind_unix(&paths.socket)?;

    let pid = std::process::id() as libc::pid_t;
    let description = ProcessDescription {
        config: config_path,
        tcp_addr: tcp.local_addr()?.to_string(),
        socket: paths.socket.clone(),
        pid,
        pid_file: paths.pid_file.clone(),
        child_pids_file: paths.child_pids_file.clone(),
        log_file,
        workdir,
    };
    pidfile::write_pid_file(&paths.pid_file, pid)?;
    description.write(&paths.desc_file)?;
    supervisor.set_description(description);

    let (control_rx, control) = Control::new().split();
    let handler = Arc::new(MessageHandler::new(Arc::clone(&supervisor), control.clone()));

    let tcp_task = listener::serve_tcp(tcp, Arc::clone(&handler));
    let unix_task = listener::serve_unix(unix, handler);
    let pids_task =
        pidfile::spawn_child_pids_writer(Arc::clone(&supervisor), paths.child_pids_file.clone());
    let signals_task = tokio::spawn(forward_os_signals(control.clone()));

    tokio::spawn(async move {
        if let Err(e) = control.send(Signal::Start).await {
            warn!("start failed: {}", e);
        }
    });

    supervisor.run(control_rx).await;

    tcp_task.abort();
    unix_task.abort();
    pids_task.abort();
    signals_task.abort();

    remove_runtime_files(&paths);
    info!("all process exit");
    Ok(())
}

/// SIGHUP reloads, SIGINT, SIGTERM and SIGQUIT end the keeper
async fn forward_os_signals(control: ControlSender) {
    let streams = (
        signal(SignalKind::hangup()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    );
    let (mut hangup, mut interrupt, mut terminate, mut quit) = match streams {
        (Ok(hangup), Ok(interrupt), Ok(terminate), Ok(quit)) => (hangup, interrupt, terminate, quit),
        _ => {
            warn!("could not listen for system signals");
            return;
        }
    };

    loop {
        let name = tokio::select! {
            _ = hangup.recv() => {
                info!("system signal: SIGHUP");
                if let Err(e) = control.send(Signal::Reload).await {
                    warn!("reload failed: {}", e);
                }
                continue;
            }
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = quit.recv() => "SIGQUIT",
        };

        info!("system signal: {}", name);
        if let Err(e) = control.send(Signal::Exit).await {
            warn!("exit failed: {}", e);
        }
        break;
    }
}

fn remove_runtime_files(paths: &RuntimePaths) {
    let files: [&Path; 4] = [
        paths.pid_file.as_path(),
        paths.child_pids_file.as_path(),
        paths.desc_file.as_path(),
        paths.socket.as_path(),
    ];

    for file in files.iter() {
        if let Err(e) = pidfile::remove_file(file) {
            warn!("could not remove {}: {}", file.display(), e);
        }
    }
}
