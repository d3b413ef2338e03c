use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use futures::future::BoxFuture;
use tlaunch::entry::artifact::EntryArtifact;
use tlaunch::launch::kubernetes::{ClusterApi, GroupConfig, LpJob};
use tlaunch::transmit::node::{transmit_node, TRANSMIT_ADDRESS};
use tlaunch::{
    EntryPoint, KubernetesConfig, KubernetesLauncher, LaunchOutcome, Launcher, Node, Program,
    TableSpec,
};

#[derive(Default)]
struct RecordingApi {
    created: Mutex<Vec<(String, LpJob)>>,
}

impl ClusterApi for RecordingApi {
    fn create_job<'a>(&'a self, namespace: &'a str, job: &'a LpJob) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.created
                .lock()
                .expect("recording api mutex poisoned")
                .push((namespace.to_string(), job.clone()));
            Ok(())
        })
    }
}

struct RejectingApi;

impl ClusterApi for RejectingApi {
    fn create_job<'a>(&'a self, _namespace: &'a str, _job: &'a LpJob) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { bail!("lpjobs.realai.cn is forbidden") })
    }
}

fn program() -> Program {
    let mut program = Program::new("RL_Trainer");
    let mailbox = program
        .add_node(transmit_node(TableSpec::sync_tables(2)).unwrap(), Some("mailbox"))
        .unwrap();
    for _ in 0..2 {
        let mut learner = Node::new(EntryPoint::new("learner"));
        learner.depends_on("mailbox", &mailbox);
        program.add_node(learner, Some("learner")).unwrap();
    }
    program
}

fn decode(job: &LpJob, role: &str) -> EntryArtifact {
    let executable = &job.spec.roles[role].executable;
    let bytes = BASE64_STANDARD.decode(executable).unwrap();
    EntryArtifact::from_bytes(&bytes).unwrap()
}

#[tokio::test]
async fn submitted_job_carries_every_role() {
    let api = Arc::new(RecordingApi::default());
    let mut config = KubernetesConfig::default();
    let mut learner = GroupConfig::default();
    learner.container.image = Some("registry.local/learner:1".to_string());
    config.groups.insert("learner".to_string(), learner);

    let launcher = KubernetesLauncher::with_api(config, api.clone()).unwrap();
    let mut program = program();
    let outcome = Launcher::from(launcher).launch(&mut program).await.unwrap();
    match &outcome {
        LaunchOutcome::Submitted { job, namespace } => {
            assert_eq!(job, "rl-trainer");
            assert_eq!(namespace, "default");
        }
        LaunchOutcome::Supervised(_) => panic!("cluster jobs are not supervised locally"),
    }
    assert!(outcome.supervisor().is_none());
    outcome.wait().await.unwrap();

    let created = api.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    let (namespace, job) = &created[0];
    assert_eq!(namespace, "default");
    assert_eq!(job.api_version, "realai.cn/v1alpha1");
    assert_eq!(job.kind, "LpJob");
    assert_eq!(job.spec.roles.keys().collect::<Vec<_>>(), ["learner", "mailbox"]);
    assert_eq!(job.spec.roles["learner"].replicas, 2);
    assert_eq!(job.spec.roles["mailbox"].replicas, 1);

    let image = &job.spec.roles["learner"].template.spec["containers"][0]["image"];
    assert_eq!(image, "registry.local/learner:1");

    let mailbox = decode(job, "mailbox");
    assert_eq!(
        mailbox.entries[0].addresses[TRANSMIT_ADDRESS],
        "mailbox-0.rl-trainer:8001"
    );
    let learners = decode(job, "learner");
    assert_eq!(learners.entries.len(), 2);
    for entry in &learners.entries {
        assert_eq!(entry.handles["mailbox"], "mailbox-0.rl-trainer:8001");
    }
}

#[tokio::test]
async fn rejected_submission_names_the_job() {
    let launcher = KubernetesLauncher::with_api(KubernetesConfig::default(), Arc::new(RejectingApi)).unwrap();
    let mut program = program();
    let err = Launcher::from(launcher)
        .launch(&mut program)
        .await
        .err()
        .expect("submission must fail");
    let message = format!("{err:#}");
    assert!(message.contains("failed to create lpjob rl-trainer in namespace default"));
    assert!(message.contains("forbidden"));
}
