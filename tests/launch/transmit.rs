use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tlaunch::transmit::client::error_code;
use tlaunch::transmit::node::transmit_node;
use tlaunch::transmit::{RATE_LIMITED_CODE, UNKNOWN_TABLE_CODE};
use tlaunch::{
    EntryContext, EntryPoint, EntryRegistry, LocalLauncher, Node, Program, RateLimiter, Runner,
    Selector, ServerOptions, SupervisorOptions, TableSpec, TransmitClient, TransmitClientOptions,
    TransmitServer, WeightSnapshot,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::support::helpers::{init_tracing, wait_for_active};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Status {
    episode: u32,
    reward: f64,
}

fn quick_options() -> ServerOptions {
    ServerOptions {
        blocking_wait: Duration::from_millis(50),
    }
}

async fn start(specs: Vec<TableSpec>) -> (TransmitServer, TransmitClient) {
    let server = TransmitServer::start("127.0.0.1:0", specs, quick_options())
        .await
        .unwrap();
    let options = TransmitClientOptions {
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        ..TransmitClientOptions::default()
    };
    let client = TransmitClient::with_options(server.endpoint(), options).unwrap();
    (server, client)
}

#[tokio::test]
async fn info_delivers_the_latest_value() {
    init_tracing();
    let (server, client) = start(Vec::new()).await;

    let first = Status { episode: 1, reward: 0.5 };
    client.send_info(&first).await.unwrap();
    assert_eq!(client.get_info::<Status>().await.unwrap(), first);

    let second = Status { episode: 2, reward: 1.5 };
    client.send_info(&second).await.unwrap();
    assert_eq!(client.get_info::<Status>().await.unwrap(), second);

    let info = client.tables().await.unwrap();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].name, "info");
    assert_eq!(info[0].inserts, 2);
    assert_eq!(info[0].samples, 2);

    server.shutdown().await;
}

#[tokio::test]
async fn reader_started_first_waits_for_the_writer() {
    init_tracing();
    let (server, client) = start(Vec::new()).await;

    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.get_info::<Status>().await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!reader.is_finished());

    let status = Status { episode: 7, reward: -1.0 };
    client.send_info(&status).await.unwrap();
    let received = timeout(Duration::from_secs(10), reader)
        .await
        .expect("reader should wake up")
        .unwrap()
        .unwrap();
    assert_eq!(received, status);

    server.shutdown().await;
}

#[tokio::test]
async fn bounded_clients_surface_refusals() {
    let server = TransmitServer::start("127.0.0.1:0", Vec::new(), quick_options())
        .await
        .unwrap();
    let options = TransmitClientOptions {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        max_attempts: Some(2),
        ..TransmitClientOptions::default()
    };
    let client = TransmitClient::with_options(server.endpoint(), options).unwrap();

    let err = client.get_info::<Status>().await.unwrap_err();
    assert_eq!(error_code(&err), Some(RATE_LIMITED_CODE));

    let err = client.sample("replay_buffer_9").await.unwrap_err();
    assert_eq!(error_code(&err), Some(UNKNOWN_TABLE_CODE));

    server.shutdown().await;
}

#[tokio::test]
async fn weight_readers_wait_for_their_version() {
    init_tracing();
    let (server, client) = start(TableSpec::sync_tables(1)).await;
    let priorities = BTreeMap::from([("weight_0".to_string(), 1.0)]);

    let mut stale = WeightSnapshot::new(3);
    stale.insert("policy", "w", json!([0.0, 0.0])).insert("policy", "b", json!(0.0));
    let mut fresh = WeightSnapshot::new(4);
    fresh.insert("policy", "w", json!([1.0, 2.0])).insert("policy", "b", json!(0.5));
    let keys = fresh.keys();

    let reader = {
        let client = client.clone();
        let keys = keys.clone();
        tokio::spawn(async move { client.sample_weight(&keys, 4, "weight_0").await })
    };

    client.insert_weight(&stale, &priorities).await.unwrap();
    client.insert_weight(&fresh, &priorities).await.unwrap();

    let received = timeout(Duration::from_secs(10), reader)
        .await
        .expect("reader should see version 4")
        .unwrap()
        .unwrap();
    assert_eq!(received, fresh);

    server.shutdown().await;
}

#[tokio::test]
async fn fan_out_insert_reaches_every_table() {
    let specs = vec![
        TableSpec::new("episodes", Selector::Fifo, Selector::Fifo, 8, RateLimiter::min_size(1)),
        TableSpec::new("latest", Selector::Lifo, Selector::Fifo, 1, RateLimiter::min_size(1)),
    ];
    let (server, client) = start(specs).await;
    let priorities = BTreeMap::from([("episodes".to_string(), 1.0), ("latest".to_string(), 2.0)]);

    for episode in 0..3 {
        let keys = client.insert(&json!(episode), &priorities).await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    assert_eq!(client.sample("episodes").await.unwrap().data, json!(0));
    let latest = client.sample("latest").await.unwrap();
    assert_eq!(latest.data, json!(2));
    assert_eq!(latest.priority, 2.0);

    let tables = client.tables().await.unwrap();
    let latest = tables.iter().find(|table| table.name == "latest").unwrap();
    assert_eq!(latest.size, 1);
    assert_eq!(latest.evictions, 2);

    server.shutdown().await;
}

async fn producer(ctx: EntryContext) -> Result<()> {
    let client: TransmitClient = ctx.connect("mailbox")?;
    let client = client.with_cancellation(ctx.shutdown().clone());
    client
        .send_info(&Status {
            episode: ctx.task_id() as u32,
            reward: 9.0,
        })
        .await
}

#[tokio::test]
async fn launched_nodes_coordinate_through_the_mailbox() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut registry = EntryRegistry::new();
    tlaunch::transmit::node::register(&mut registry);
    registry.register("producer", producer);
    registry.register("consumer", move |ctx: EntryContext| {
        let tx = tx.clone();
        async move {
            let client: TransmitClient = ctx.connect("mailbox")?;
            let status: Status = client.get_info().await?;
            ensure!(status.reward == 9.0, "unexpected status {status:?}");
            let _ = tx.send(status);
            Ok::<_, anyhow::Error>(())
        }
    });

    let mut program = Program::new("coordination");
    let mailbox = program
        .add_node(transmit_node(Vec::new()).unwrap(), Some("mailbox"))
        .unwrap();
    // The consumer is declared first, so it usually starts before anything is sent.
    let mut consumer = Node::new(EntryPoint::new("consumer"));
    consumer.depends_on("mailbox", &mailbox);
    program.add_node(consumer, Some("consumer")).unwrap();
    let mut producer = Node::new(EntryPoint::new("producer"));
    producer.depends_on("mailbox", &mailbox);
    program.add_node(producer, Some("producer")).unwrap();

    let options = SupervisorOptions {
        poll_interval: Duration::from_millis(20),
        ..SupervisorOptions::default()
    };
    let mut runner = Runner::new(program, LocalLauncher::tasks(registry, options));
    runner.start().await.unwrap();

    let status = timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("consumer should receive the status")
        .unwrap();
    assert_eq!(status.episode, 0);

    let supervisor = runner
        .outcome()
        .and_then(|outcome| outcome.supervisor())
        .unwrap();
    let active = wait_for_active(supervisor, 1, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(active, ["mailbox/0"]);

    supervisor.shutdown().unwrap();
    timeout(Duration::from_secs(10), runner.wait())
        .await
        .expect("job should resolve")
        .unwrap();
}
