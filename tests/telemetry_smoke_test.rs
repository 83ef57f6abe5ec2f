//! Smoke test for the OTLP pipeline against a local collector stack
//! (OTLP on :4317, Tempo on :3200, Prometheus on :9090).
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::Arc;
use std::time::Duration;
use taskwire::Producer;
use taskwire::broker::{Broker, MemoryBroker};
use taskwire::model::{EVENTS_TOPIC, NewTask};
use taskwire::telemetry::{TelemetryConfig, init_telemetry};
use taskwire::worker::{Registry, Worker, WorkerConfig, register_builtins};

#[test]
#[ignore]
fn smoke_worker_traces_and_metrics() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = init_telemetry(
            TelemetryConfig::new("taskwire-smoke-test")
                .with_endpoint(Some("http://localhost:4317".to_string())),
        )
        .expect("failed to init telemetry");

        let broker = MemoryBroker::new();
        let mut events = broker.subscribe(EVENTS_TOPIC).await.unwrap();
        let mut registry = Registry::new();
        register_builtins(&mut registry);
        let worker = Worker::new(
            Arc::new(broker.clone()),
            Arc::new(registry),
            WorkerConfig {
                poll_wait: Duration::from_millis(50),
                ..WorkerConfig::default()
            },
        );
        let running = worker.clone();
        let handle = tokio::spawn(async move { running.run().await });

        Producer::new(Arc::new(broker.clone()))
            .send(NewTask::new("echo").arg("smoke"))
            .await
            .unwrap();
        // started, succeeded
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
        }
        worker.shutdown();
        handle.await.unwrap().unwrap();

        guard.force_flush();
        tokio::time::sleep(Duration::from_secs(8)).await;

        let client = reqwest::Client::new();

        let resp = client
            .get("http://localhost:3200/api/search")
            .query(&[("tags", "service.name=taskwire-smoke-test"), ("limit", "5")])
            .send()
            .await
            .expect("failed to query Tempo");
        assert!(resp.status().is_success(), "Tempo query failed: {}", resp.status());
        let body: serde_json::Value = resp.json().await.unwrap();
        let traces = body["traces"].as_array().map_or(0, Vec::len);
        assert!(traces > 0, "no traces found in Tempo: {body}");

        let resp = client
            .get("http://localhost:9090/api/v1/query")
            .query(&[("query", "taskwire_tasks_submitted_total")])
            .send()
            .await
            .expect("failed to query Prometheus");
        let body: serde_json::Value = resp.json().await.unwrap();
        let series = body["data"]["result"].as_array().map_or(0, Vec::len);
        assert!(series > 0, "no submitted-task metric in Prometheus: {body}");
    });
}
