// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use taskkeeper::config::{CommandSource, CommandSpec, StaticCommands};
use taskkeeper::control::{Control, Signal};
use taskkeeper::listener;
use taskkeeper::msg::{ErrorCode, MessageHandler, Response};
use taskkeeper::procs::Supervisor;
use taskkeeper::state::FlapPolicy;

struct Keeper {
    supervisor: Arc<Supervisor>,
    handler: Arc<MessageHandler>,
    dispatcher: JoinHandle<()>,
}

impl Keeper {
    async fn start(specs: Vec<CommandSpec>) -> Self {
        let source = StaticCommands::new(specs, Path::new("/"));
        let commands = source.load().await.expect("commands");
        let supervisor = Arc::new(Supervisor::new(
            commands,
            Box::new(source),
            FlapPolicy::default(),
        ));

        let (rx, tx) = Control::new().split();
        let dispatcher = tokio::spawn(Arc::clone(&supervisor).run(rx));
        let handler = Arc::new(MessageHandler::new(Arc::clone(&supervisor), tx.clone()));

        tx.send(Signal::Start).await.expect("start");
        Self {
            supervisor,
            handler,
            dispatcher,
        }
    }

    async fn request(&self, line: &str) -> Response {
        self.handler.handle(line).await
    }

    async fn payload(&self, line: &str) -> Value {
        let response = self.request(line).await;
        assert_eq!(response.code, ErrorCode::Success, "{}: {}", line, response.payload);
        response.payload
    }

    async fn ids(&self) -> BTreeSet<String> {
        match self.payload("stat cmdlist").await {
            Value::Array(list) => list
                .iter()
                .map(|cmd| cmd["id"].as_str().expect("id").to_string())
                .collect(),
            other => panic!("not a list: {}", other),
        }
    }

    async fn exit(self) {
        assert_eq!(self.request("ctl exit").await.code, ErrorCode::Success);
        self.dispatcher.await.expect("dispatcher");
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn spec(cmd: &str, args: &[&str], name: &str) -> CommandSpec {
    CommandSpec {
        cmd: cmd.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        name: Some(name.to_string()),
        ..CommandSpec::default()
    }
}

fn sleepers() -> Vec<CommandSpec> {
    vec![
        spec("/bin/sleep", &["30"], "alpha"),
        spec("/bin/sleep", &["30"], "beta"),
    ]
}

fn all_running(supervisor: &Supervisor) -> bool {
    let commands = supervisor.commands();
    let snapshot = supervisor.state().snapshot();

    snapshot.running_num == commands.len()
        && commands
            .iter()
            .all(|p| snapshot.running.get(p.id()) == Some(&p.pid()))
}

#[tokio::test]
async fn test_protocol_error_codes() {
    let keeper = Keeper::start(sleepers()).await;

    assert_eq!(keeper.request("ctl bogus").await.code, ErrorCode::UnknownSignal);
    assert_eq!(keeper.request("stat").await.code, ErrorCode::Malformed);
    assert_eq!(keeper.request("stat f cmd").await.code, ErrorCode::MissingId);
    assert_eq!(keeper.request("stat cmd nobody").await.code, ErrorCode::NotFound);
    assert_eq!(keeper.request("ctl act 0 nobody").await.code, ErrorCode::NotFound);
    assert_eq!(keeper.request("ctl act 3").await.code, ErrorCode::MissingTarget);
    assert_eq!(keeper.request("ctl start").await.code, ErrorCode::Rejected);
    assert_eq!(keeper.request("stat config").await.code, ErrorCode::NotFound);

    keeper.exit().await;
}

#[tokio::test]
async fn test_start_failure_is_broken_once() {
    let keeper = Keeper::start(vec![spec("/nonexistent/keeper-cmd", &[], "ghost")]).await;
    let supervisor = Arc::clone(&keeper.supervisor);

    wait_for("broken", || supervisor.state().snapshot().broken_num == 1).await;
    supervisor.refresh_snapshot();

    let status = keeper.payload("stat cmd ghost").await;
    assert_eq!(status["broken"], Value::Bool(true));
    assert_eq!(status["brokens"], 0);
    assert_eq!(status["pid"], 0);

    let server = keeper.payload("stat server").await;
    assert_eq!(server["task_total_num"], 1);
    assert_eq!(server["term_task_list"].as_array().map(Vec::len), Some(1));
    assert_eq!(server["running_task_list"].as_array().map(Vec::len), Some(0));

    keeper.exit().await;
}

#[tokio::test]
async fn test_prefix_and_exact_id_payloads_match() {
    let keeper = Keeper::start(sleepers()).await;
    let supervisor = Arc::clone(&keeper.supervisor);
    wait_for("running", || all_running(&supervisor)).await;
    supervisor.refresh_snapshot();

    let commands = supervisor.commands();
    let alpha = commands.resolve("alpha").expect("alpha");
    let beta = commands.resolve("beta").expect("beta");

    // shortest prefix of alpha's id that beta's id does not share
    let prefix_len = (1..=alpha.id().len())
        .find(|&n| !beta.id().starts_with(&alpha.id()[..n]))
        .expect("ids differ");
    let prefix = &alpha.id()[..prefix_len];

    let by_id = keeper.payload(&format!("stat cmd {}", alpha.id())).await;
    let by_prefix = keeper.payload(&format!("stat cmd {}", prefix)).await;
    assert_eq!(by_id, by_prefix);
    assert_eq!(by_id["name"], "alpha");
    assert_eq!(by_id["running"], Value::Bool(true));

    keeper.exit().await;
}

#[tokio::test]
async fn test_reload_lists_only_new_generation() {
    let keeper = Keeper::start(sleepers()).await;
    let supervisor = Arc::clone(&keeper.supervisor);
    wait_for("running", || all_running(&supervisor)).await;

    let before = keeper.ids().await;
    assert_eq!(keeper.request("ctl reload").await.code, ErrorCode::Success);
    let after = keeper.ids().await;

    assert_eq!(after.len(), 2);
    assert!(before.is_disjoint(&after));

    wait_for("new generation running", || all_running(&supervisor)).await;
    let server = keeper.payload("stat f server").await;
    assert_eq!(server["reload_time_list"].as_array().map(Vec::len), Some(1));

    keeper.exit().await;
}

#[tokio::test]
async fn test_back_to_back_reloads_stay_consistent() {
    let keeper = Keeper::start(sleepers()).await;
    let supervisor = Arc::clone(&keeper.supervisor);

    let reloads: Vec<_> = (0..4)
        .map(|_| {
            let handler = Arc::clone(&keeper.handler);
            tokio::spawn(async move { handler.handle("ctl reload").await })
        })
        .collect();
    for reload in reloads {
        assert_eq!(reload.await.expect("reload").code, ErrorCode::Success);
    }

    wait_for("consistent running map", || all_running(&supervisor)).await;
    let snapshot = supervisor.state().snapshot();
    assert_eq!(snapshot.running_num, 2);
    assert_eq!(snapshot.broken_num, 0);
    assert_eq!(supervisor.history().reload_times.len(), 4);

    keeper.exit().await;
}

#[tokio::test]
async fn test_exit_ends_dispatcher() {
    let keeper = Keeper::start(sleepers()).await;
    let supervisor = Arc::clone(&keeper.supervisor);
    let handler = Arc::clone(&keeper.handler);
    wait_for("running", || all_running(&supervisor)).await;

    keeper.exit().await;

    assert!(supervisor.state().is_retired());
    assert_eq!(supervisor.snapshot().running_num, 0);
    assert_eq!(handler.handle("ctl start").await.code, ErrorCode::Rejected);
    for process in supervisor.commands().iter() {
        wait_for("loop end", || !process.is_supervised()).await;
    }
}

#[tokio::test]
async fn test_command_action_over_protocol() {
    let keeper = Keeper::start(sleepers()).await;
    let supervisor = Arc::clone(&keeper.supervisor);
    wait_for("running", || all_running(&supervisor)).await;

    assert_eq!(keeper.request("ctl act 4 beta").await.code, ErrorCode::Success);
    let beta = Arc::clone(supervisor.commands().resolve("beta").expect("beta"));
    wait_for("beta stopped", || !beta.is_supervised()).await;

    let status = keeper.payload("stat cmd beta").await;
    assert_eq!(status["paused"], Value::Bool(true));
    assert_eq!(status["running"], Value::Bool(false));

    assert_eq!(keeper.request("ctl act start beta").await.code, ErrorCode::Success);
    wait_for("beta running", || supervisor.state().is_running(beta.id())).await;

    keeper.exit().await;
}

#[tokio::test]
async fn test_cron_command_runs_on_schedule() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out = dir.path().join("cron.out");

    let mut every_second = spec("/bin/sh", &["-c", "echo tick"], "ticker");
    every_second.cron = Some("* * * * * *".to_string());
    every_second.output = Some(out.display().to_string());

    let keeper = Keeper::start(vec![every_second]).await;
    wait_for("cron output", || {
        std::fs::read_to_string(&out).map_or(false, |text| text.contains("tick"))
    })
    .await;

    let status = keeper.payload("stat cmd ticker").await;
    assert_eq!(status["cron"], "* * * * * *");
    assert_eq!(keeper.payload("stat server").await["task_total_num"], 0);

    keeper.exit().await;
}

#[tokio::test]
async fn test_lines_over_a_stream() {
    let keeper = Keeper::start(sleepers()).await;
    let (client, server) = tokio::io::duplex(4096);

    let handler = Arc::clone(&keeper.handler);
    let serving = tokio::spawn(async move { listener::answer_lines(server, &handler).await });

    let (mut read, mut write) = tokio::io::split(client);
    write
        .write_all(b"stat server\n\nctl bogus\n")
        .await
        .expect("write");
    write.shutdown().await.expect("shutdown");

    let mut responses = String::new();
    read.read_to_string(&mut responses).await.expect("read");
    serving.await.expect("serving").expect("answered");

    let lines: Vec<&str> = responses.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("0|format:compact|{"));
    assert!(lines[1].starts_with("5|format:compact|{\"error\""));

    keeper.exit().await;
}

#[tokio::test]
async fn test_invalid_utf8_line_gets_an_answer() {
    let keeper = Keeper::start(sleepers()).await;
    let (client, server) = tokio::io::duplex(4096);

    let handler = Arc::clone(&keeper.handler);
    let serving = tokio::spawn(async move { listener::answer_lines(server, &handler).await });

    let (mut read, mut write) = tokio::io::split(client);
    write
        .write_all(b"stat \xff\xfe\nstat server\n")
        .await
        .expect("write");
    write.shutdown().await.expect("shutdown");

    let mut responses = String::new();
    read.read_to_string(&mut responses).await.expect("read");
    serving.await.expect("serving").expect("answered");

    let lines: Vec<&str> = responses.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("1|format:compact|{\"error\""));
    assert!(lines[1].starts_with("0|format:compact|{"));

    keeper.exit().await;
}
