use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    fake_shell::{remote_words, FakeShell},
    helpers::{fast_config, init_tracing, wait_for_active, write_script},
};
use anyhow::anyhow;
use tlaunch::entry::stopper::{ProgramStopper, LAUNCH_TYPE_ENV, MULTIPLEXER_ENV};
use tlaunch::launch::ssh::kill_sessions;
use tlaunch::{
    EntryPoint, LaunchConfig, LaunchError, LaunchOutcome, Launcher, Node, Program, SshLauncher,
};
use tokio::time::timeout;

fn worker(host: Option<&str>) -> Node {
    let mut node = Node::new(EntryPoint::new("noop"));
    node.allocate_address("rpc");
    match host {
        Some(host) => node.on_host(host).expect("valid host"),
        None => node,
    }
}

#[tokio::test]
async fn sessions_are_uniquified_and_killed_on_shutdown() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "worker", "exit 0");
    let shell = Arc::new(FakeShell::new().with_session("itest-demo"));

    let mut program = Program::new("demo");
    program.add_node(worker(None), Some("workers")).unwrap();
    program.add_node(worker(None), Some("workers")).unwrap();

    let launcher = SshLauncher::with_shell(fast_config(&binary, dir.path()), shell.clone()).unwrap();
    let mut launcher = Launcher::from(launcher);
    let outcome = launcher.launch(&mut program).await.unwrap();
    let LaunchOutcome::Supervised(supervisor) = outcome else {
        panic!("ssh launches are supervised");
    };

    assert_eq!(shell.sessions(), ["itest-demo", "itest-demo_0"]);
    let windows = shell.calls_for("new-window");
    assert_eq!(windows.len(), 2);
    assert!(windows[0].iter().any(|arg| arg == "workers/0"));
    assert!(windows[1].last().unwrap().contains("--task-id 1"));
    assert!(windows[1].last().unwrap().ends_with("exec $SHELL; "));

    let mut active = wait_for_active(&supervisor, 3, Duration::from_secs(5))
        .await
        .unwrap();
    active.sort();
    assert_eq!(active, ["workers/0", "workers/1", "zsh"]);

    supervisor.shutdown().unwrap();
    timeout(Duration::from_secs(10), supervisor.wait())
        .await
        .expect("job should resolve after its session is killed")
        .unwrap();

    let kills = shell.calls_for("kill-session");
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].last().unwrap(), "itest-demo_0");
    assert_eq!(shell.sessions(), ["itest-demo"]);
    assert_eq!(supervisor.telemetry().sessions_opened, 1);
}

#[tokio::test]
async fn remote_hosts_are_reached_over_ssh() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "worker", "exit 0");
    let shell = Arc::new(FakeShell::new());

    let mut program = Program::new("split");
    program
        .add_node(worker(Some("gpu-1:2222")), Some("learner"))
        .unwrap();
    program.add_node(worker(None), Some("actor")).unwrap();

    let mut launcher = SshLauncher::with_shell(fast_config(&binary, dir.path()), shell.clone()).unwrap();
    launcher.bind(&mut program).unwrap();
    let commands = launcher.commands(&program).unwrap();
    assert_eq!(commands[0].host(), "gpu-1");
    assert_eq!(commands[0].port(), Some(2222));
    assert_eq!(commands[1].host(), "localhost");

    let supervisor = launcher.launch(&mut program).await.unwrap();
    assert_eq!(launcher.sessions().len(), 2);

    let calls = shell.calls();
    assert_eq!(calls[0][..4], ["ssh", "-p", "2222", "gpu-1"]);
    assert_eq!(remote_words(&calls[0])[1], "new-session");
    assert_eq!(calls[1][0], "tmux");

    wait_for_active(&supervisor, 4, Duration::from_secs(5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let probes_over_ssh = shell
        .calls()
        .iter()
        .filter(|argv| argv[0] == "ssh" && remote_words(argv)[0] == "kill")
        .count();
    assert!(probes_over_ssh > 0);
    assert_eq!(supervisor.status().await.unwrap().active.len(), 4);

    supervisor.shutdown().unwrap();
    timeout(Duration::from_secs(10), supervisor.wait())
        .await
        .expect("job should resolve")
        .unwrap();
    assert!(shell.sessions().is_empty());
}

#[tokio::test]
async fn groups_must_not_span_hosts() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "worker", "exit 0");
    let shell = Arc::new(FakeShell::new());

    let mut program = Program::new("spread");
    program.add_node(worker(Some("gpu-1")), Some("actor")).unwrap();
    program.add_node(worker(Some("gpu-2")), Some("actor")).unwrap();

    let mut launcher = SshLauncher::with_shell(fast_config(&binary, dir.path()), shell.clone()).unwrap();
    let err = launcher.launch(&mut program).await.unwrap_err();
    match err.downcast_ref::<LaunchError>() {
        Some(LaunchError::CrossHostGroup { group, hosts }) => {
            assert_eq!(group, "actor");
            assert_eq!(hosts.len(), 2);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(shell.calls().is_empty());
}

#[tokio::test]
async fn leftover_sessions_are_killed_by_prefix() {
    let shell = FakeShell::new()
        .with_session("itest-old")
        .with_session("itest-old_0")
        .with_session("notebook");

    let killed = kill_sessions(&shell, &["localhost".to_string()], "itest", "tmux", false)
        .await
        .unwrap();
    assert_eq!(killed, ["localhost:itest-old", "localhost:itest-old_0"]);
    assert_eq!(shell.sessions(), ["notebook"]);

    let killed = kill_sessions(&shell, &["localhost".to_string()], "itest", "tmux", true)
        .await
        .unwrap();
    assert_eq!(killed, ["localhost:*"]);
    assert!(shell.sessions().is_empty());
}

fn confirming_config(binary: &Path, staging: &Path) -> LaunchConfig {
    LaunchConfig::builder()
        .worker_binary(binary)
        .launch_dir(staging)
        .staging_dir(staging)
        .session_prefix("itest")
        .poll_interval(Duration::from_millis(20))
        .termination_grace(Duration::from_millis(500))
        .probe_timeout(Duration::from_secs(2))
        .confirm_on_failure(true)
        .build()
        .expect("valid config")
}

#[tokio::test]
async fn confirm_on_failure_reaches_the_worker_command() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "worker", "exit 0");
    let shell = Arc::new(FakeShell::new());

    let mut program = Program::new("careful");
    program.add_node(worker(None), Some("learner")).unwrap();

    let mut launcher = SshLauncher::with_shell(confirming_config(&binary, dir.path()), shell.clone()).unwrap();
    launcher.bind(&mut program).unwrap();
    let commands = launcher.commands(&program).unwrap();
    assert!(commands[0].args().iter().any(|arg| arg == "--confirm-on-failure"));
    assert_eq!(commands[0].env()[LAUNCH_TYPE_ENV], "ssh");
    assert_eq!(commands[0].env()[MULTIPLEXER_ENV], "tmux");

    let supervisor = launcher.launch(&mut program).await.unwrap();
    let windows = shell.calls_for("new-window");
    let line = windows[0].last().unwrap();
    assert!(line.contains("--task-id 0 --confirm-on-failure"));
    assert!(line.starts_with("TLAUNCH_LAUNCH_TYPE=ssh TLAUNCH_MULTIPLEXER=tmux "));

    supervisor.shutdown().unwrap();
    timeout(Duration::from_secs(10), supervisor.wait())
        .await
        .expect("job should resolve")
        .unwrap();
}

#[tokio::test]
async fn failed_node_kills_its_session_and_fails_the_job() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "worker", "exit 0");
    let shell = Arc::new(FakeShell::new());

    let mut program = Program::new("stoppable");
    program.add_node(worker(None), Some("learner")).unwrap();
    program.add_node(worker(None), Some("actor")).unwrap();

    let mut launcher = SshLauncher::with_shell(fast_config(&binary, dir.path()), shell.clone()).unwrap();
    let supervisor = launcher.launch(&mut program).await.unwrap();
    wait_for_active(&supervisor, 3, Duration::from_secs(5))
        .await
        .unwrap();

    // What the actor's worker process builds from its launch variables.
    let commands = launcher.commands(&program).unwrap();
    let data_file = Path::new(&commands[1].args()[2]);
    shell.enter_session("itest-stoppable");
    let stopper = ProgramStopper::Session {
        shell: shell.clone(),
        multiplexer: "tmux".to_string(),
        report_dir: data_file.parent().unwrap().to_path_buf(),
        worker: commands[1].title().to_string(),
    };
    stopper
        .stop_after_failure(&anyhow!("actor diverged"))
        .await
        .unwrap();
    assert!(shell.sessions().is_empty());

    let failure = timeout(Duration::from_secs(10), supervisor.wait())
        .await
        .expect("job should resolve once the session is gone")
        .unwrap_err();
    assert_eq!(failure.label(), "actor/0");
    assert!(failure.to_string().contains("actor diverged"));
    assert_eq!(supervisor.telemetry().workers_failed, 1);
}
