use std::time::Duration;

use crate::support::helpers::{fast_config, init_tracing, write_script};
use tlaunch::{EntryPoint, LaunchOutcome, Launcher, LocalLauncher, Node, Program};
use tokio::time::timeout;

const WORKER_SCRIPT: &str = r#"
# $2 is the artifact, $4 the task index
test -f "$2" || exit 9
case "$4" in
  0) exit 0 ;;
  1) sleep 0.2; exit 3 ;;
  *) exec sleep 30 ;;
esac
"#;

fn program() -> Program {
    let mut program = Program::new("local-processes");
    for _ in 0..3 {
        let mut node = Node::new(EntryPoint::new("noop"));
        node.allocate_address("rpc");
        program.add_node(node, Some("workers")).unwrap();
    }
    program
}

#[cfg(unix)]
#[tokio::test]
async fn first_failing_process_takes_the_job_down() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "worker", WORKER_SCRIPT);
    let launcher = LocalLauncher::processes(fast_config(&binary, dir.path())).unwrap();

    let mut program = program();
    let outcome = Launcher::from(launcher).launch(&mut program).await.unwrap();
    let supervisor = outcome.supervisor().expect("local launches are supervised");

    let failure = timeout(Duration::from_secs(15), supervisor.wait())
        .await
        .expect("job should resolve once the failure is seen")
        .unwrap_err();
    assert_eq!(failure.label(), "workers/1");
    assert!(failure.to_string().contains("exit status: 3"));

    let telemetry = supervisor.telemetry();
    assert_eq!(telemetry.workers_registered, 3);
    assert!(telemetry.workers_exited >= 1);
}

#[cfg(unix)]
#[tokio::test]
async fn successful_processes_resolve_cleanly() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let binary = write_script(dir.path(), "worker", "test -f \"$2\"");
    let launcher = LocalLauncher::processes(fast_config(&binary, dir.path())).unwrap();

    let mut program = program();
    let mut launcher = Launcher::from(launcher);
    let outcome = launcher.launch(&mut program).await.unwrap();
    assert!(matches!(outcome, LaunchOutcome::Supervised(_)));
    timeout(Duration::from_secs(15), outcome.wait())
        .await
        .expect("job should resolve")
        .unwrap();

    for node in program.get_all_nodes() {
        let endpoint = node.addresses()[0].resolve().unwrap();
        assert!(endpoint.starts_with("127.0.0.1:"));
    }
}
