use std::time::Duration;

use comfy_remote::seed::FixedSeedSource;
use comfy_remote::workflow::basic_template;
use comfy_remote::{
    ClientConfig, ComfyClient, ComfyError, JobStatus, OutputRef, Overrides, ResolvedJobPayload,
    Resolver, SeedPolicy,
};
use httpmock::prelude::*;
use serde_json::json;

fn client_for(server: &MockServer, output: &std::path::Path) -> ComfyClient {
    let config = ClientConfig::builder()
        .with_server_url(server.base_url())
        .with_client_id("test-client")
        .with_output_dir(output)
        .with_poll_interval(Duration::from_millis(20))
        .with_tracking_timeout(Duration::from_secs(10))
        .with_reconnect_attempts(0)
        .with_submit_retries(1)
        .build();
    ComfyClient::new(config).unwrap()
}

fn fox_payload() -> ResolvedJobPayload {
    Resolver::new()
        .with_seed_policy(SeedPolicy::new(FixedSeedSource(7)))
        .resolve(
            &basic_template("txt2img", "sd15.safetensors"),
            &Overrides::new().positive("a fox").filename_prefix("fox"),
        )
        .unwrap()
}

fn history_success(job_id: &str) -> serde_json::Value {
    json!({
        job_id: {
            "status": {"status_str": "success", "completed": true, "messages": []},
            "outputs": {
                "7": {"images": [{"filename": "fox_001.png", "subfolder": "", "type": "output"}]}
            }
        }
    })
}

#[tokio::test]
async fn submit_returns_queued_job() {
    let server = MockServer::start_async().await;
    let dir = tempfile::tempdir().unwrap();
    let prompt = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/prompt")
                .json_body_partial(r#"{"client_id": "test-client"}"#);
            then.status(200)
                .json_body(json!({"prompt_id": "job-42", "number": 3, "node_errors": {}}));
        })
        .await;

    let client = client_for(&server, dir.path());
    let job = client.submit(&fox_payload()).await.unwrap();

    prompt.assert_async().await;
    assert_eq!(job.id, "job-42");
    assert_eq!(job.client_id, "test-client");
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.seed, Some(7));
    assert_eq!(job.output_nodes, vec!["7".to_string()]);
}

#[tokio::test]
async fn validation_error_is_not_retried() {
    let server = MockServer::start_async().await;
    let dir = tempfile::tempdir().unwrap();
    let prompt = server
        .mock_async(|when, then| {
            when.method(POST).path("/prompt");
            then.status(400).json_body(json!({
                "error": {"type": "prompt_outputs_failed_validation",
                          "message": "Prompt outputs failed validation", "details": ""},
                "node_errors": {
                    "1": {"class_type": "CheckpointLoaderSimple",
                          "errors": [{"message": "Value not in list",
                                      "details": "ckpt_name: 'sd15.safetensors' not in []"}]}
                }
            }));
        })
        .await;

    let client = client_for(&server, dir.path());
    let err = client.submit_with_retry(&fox_payload()).await.unwrap_err();

    prompt.assert_hits_async(1).await;
    match err {
        ComfyError::Submission { status, diagnostic } => {
            assert_eq!(status, Some(400));
            assert!(diagnostic.contains("sd15.safetensors"));
        }
        other => panic!("Expected Submission, got {other:?}"),
    }
}

#[tokio::test]
async fn gateway_errors_are_retried() {
    let server = MockServer::start_async().await;
    let dir = tempfile::tempdir().unwrap();
    let prompt = server
        .mock_async(|when, then| {
            when.method(POST).path("/prompt");
            then.status(503).body("Service Unavailable");
        })
        .await;

    let client = client_for(&server, dir.path());
    let err = client.submit_with_retry(&fox_payload()).await.unwrap_err();

    // One attempt plus one retry.
    prompt.assert_hits_async(2).await;
    assert!(matches!(err, ComfyError::Http { status: 503, .. }));
}

#[tokio::test]
async fn unreachable_server_is_transport_error() {
    let dir = tempfile::tempdir().unwrap();
    let client = ComfyClient::new(
        ClientConfig::builder()
            .with_server_url("http://127.0.0.1:9")
            .with_output_dir(dir.path())
            .with_connect_timeout(Duration::from_secs(2))
            .with_reconnect_attempts(0)
            .build(),
    )
    .unwrap();

    let err = client.submit(&fox_payload()).await.unwrap_err();
    assert!(matches!(err, ComfyError::Transport { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn generate_polls_and_downloads() {
    let server = MockServer::start_async().await;
    let dir = tempfile::tempdir().unwrap();
    server
        .mock_async(|when, then| {
            when.method(POST).path("/prompt");
            then.status(200)
                .json_body(json!({"prompt_id": "job-42", "number": 1, "node_errors": {}}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/history/job-42");
            then.status(200).json_body(history_success("job-42"));
        })
        .await;
    let view = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/view")
                .query_param("filename", "fox_001.png")
                .query_param("type", "output");
            then.status(200).body("PNG-BYTES");
        })
        .await;

    let client = client_for(&server, dir.path());
    let generation = client.generate(&fox_payload(), |_| {}).await.unwrap();

    view.assert_async().await;
    assert_eq!(generation.job.status, JobStatus::Completed);
    assert_eq!(generation.job.outputs, vec![OutputRef::new("7", "fox_001.png")]);
    assert!(generation.report.is_complete());
    assert_eq!(
        std::fs::read(dir.path().join("fox_001.png")).unwrap(),
        b"PNG-BYTES"
    );
}

#[tokio::test]
async fn failed_generation_downloads_nothing() {
    let server = MockServer::start_async().await;
    let dir = tempfile::tempdir().unwrap();
    server
        .mock_async(|when, then| {
            when.method(POST).path("/prompt");
            then.status(200)
                .json_body(json!({"prompt_id": "job-9", "number": 1, "node_errors": {}}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/history/job-9");
            then.status(200).json_body(json!({
                "job-9": {
                    "status": {"status_str": "error", "completed": false, "messages": [
                        ["execution_error", {"prompt_id": "job-9", "node_id": "5",
                                             "node_type": "KSampler",
                                             "exception_message": "CUDA out of memory\n"}]
                    ]},
                    "outputs": {}
                }
            }));
        })
        .await;
    let view = server
        .mock_async(|when, then| {
            when.method(GET).path("/view");
            then.status(200).body("unexpected");
        })
        .await;

    let client = client_for(&server, dir.path());
    let err = client.generate(&fox_payload(), |_| {}).await.unwrap_err();

    view.assert_hits_async(0).await;
    match err {
        ComfyError::GenerationFailed(message) => assert!(message.contains("CUDA out of memory")),
        other => panic!("Expected GenerationFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn job_status_falls_back_to_queue() {
    let server = MockServer::start_async().await;
    let dir = tempfile::tempdir().unwrap();
    server
        .mock_async(|when, then| {
            when.method(GET).path("/history/job-b");
            then.status(200).json_body(json!({}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/queue");
            then.status(200).json_body(json!({
                "queue_running": [[0, "job-a", {}, {}, ["7"]]],
                "queue_pending": [[1, "job-b", {}, {}, ["7"]]]
            }));
        })
        .await;

    let client = client_for(&server, dir.path());
    let snapshot = client.job_status("job-b").await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Queued);

    let queue = client.queue_status().await.unwrap();
    assert_eq!((queue.running, queue.pending), (1, 1));
}

#[tokio::test]
async fn delete_after_download_posts_to_delete_endpoint() {
    let server = MockServer::start_async().await;
    let dir = tempfile::tempdir().unwrap();
    server
        .mock_async(|when, then| {
            when.method(GET).path("/view");
            then.status(200).body("PNG-BYTES");
        })
        .await;
    let delete = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/delete")
                .json_body_partial(r#"{"filename": "fox_001.png", "type": "output"}"#);
            then.status(200);
        })
        .await;

    let client = ComfyClient::new(
        ClientConfig::builder()
            .with_server_url(server.base_url())
            .with_delete_after_download(true)
            .build(),
    )
    .unwrap();

    let mut job = comfy_remote::Job::new("job-42", client.client_id());
    job.outputs.push(OutputRef::new("7", "fox_001.png"));
    let report = client.fetch(&job, Some(dir.path())).await.unwrap();

    assert!(report.is_complete());
    delete.assert_async().await;
}

#[tokio::test]
async fn model_discovery_reads_object_info() {
    let server = MockServer::start_async().await;
    let dir = tempfile::tempdir().unwrap();
    server
        .mock_async(|when, then| {
            when.method(GET).path("/object_info/KSampler");
            then.status(200).json_body(json!({
                "KSampler": {"input": {"required": {
                    "sampler_name": [["euler", "dpmpp_2m"]],
                    "scheduler": [["normal", "karras"]]
                }}}
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/system_stats");
            then.status(200).json_body(json!({"system": {"comfyui_version": "0.3.10"}}));
        })
        .await;

    let client = client_for(&server, dir.path());
    assert_eq!(client.samplers().await.unwrap(), vec!["euler", "dpmpp_2m"]);
    assert_eq!(client.schedulers().await.unwrap(), vec!["normal", "karras"]);
    assert!(client.health().await.unwrap());
}
