use std::sync::{Arc, Mutex};
use std::time::Duration;

use comfy_remote::{ClientConfig, ClientSession, JobEvent, OutputRef};
use futures_util::SinkExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

fn frame(kind: &str, data: serde_json::Value) -> Message {
    Message::Text(json!({"type": kind, "data": data}).to_string())
}

fn session_for(port: u16) -> ClientSession {
    let config = ClientConfig::builder()
        .with_server_url(format!("http://127.0.0.1:{}", port))
        .with_client_id("ws-test")
        .with_reconnect_delay(Duration::from_millis(50))
        .with_reconnect_attempts(1)
        .build();
    ClientSession::new(&config).unwrap()
}

/// Accept one WebSocket connection, record its request URI, send `frames`
/// and close.
async fn serve_once(listener: &TcpListener, uris: &Arc<Mutex<Vec<String>>>, frames: Vec<Message>) {
    let (tcp, _) = listener.accept().await.unwrap();
    let uris = Arc::clone(uris);
    let mut ws = tokio_tungstenite::accept_hdr_async(tcp, move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        uris.lock().unwrap().push(req.uri().to_string());
        Ok(resp)
    })
    .await
    .unwrap();
    for message in frames {
        ws.send(message).await.unwrap();
    }
    ws.close(None).await.ok();
}

async fn next(events: &mut comfy_remote::JobEvents) -> JobEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

#[tokio::test]
async fn routes_server_events_to_subscriber() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let uris = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let uris = Arc::clone(&uris);
        tokio::spawn(async move {
            serve_once(
                &listener,
                &uris,
                vec![
                    frame("status", json!({"status": {"exec_info": {"queue_remaining": 1}}})),
                    frame("execution_start", json!({"prompt_id": "job-1"})),
                    frame("progress", json!({"value": 3, "max": 20, "prompt_id": "job-1", "node": "5"})),
                    frame("executed", json!({
                        "node": "7",
                        "prompt_id": "job-1",
                        "output": {"images": [{"filename": "fox_001.png", "subfolder": "", "type": "output"}]}
                    })),
                    frame("executing", json!({"node": null, "prompt_id": "job-1"})),
                    frame("some_extension_event", json!({"anything": true})),
                ],
            )
            .await;
            // Keep the listener alive so no reconnect fails mid-test.
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
    };

    let session = session_for(port);
    session.ensure_channel().await.unwrap();
    let mut events = session.subscribe("job-1");

    assert_eq!(next(&mut events).await, JobEvent::Started);
    match next(&mut events).await {
        JobEvent::Progress(p) => assert_eq!((p.current_step, p.total_steps), (3, 20)),
        other => panic!("Expected progress, got {other:?}"),
    }
    assert_eq!(
        next(&mut events).await,
        JobEvent::Executed {
            node: "7".into(),
            outputs: vec![OutputRef::new("7", "fox_001.png")],
        }
    );
    assert_eq!(next(&mut events).await, JobEvent::Finished);

    assert_eq!(uris.lock().unwrap()[0], "/ws?clientId=ws-test");
    session.close().await;
    server.abort();
}

#[tokio::test]
async fn reconnects_once_with_same_client_id() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let uris = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let uris = Arc::clone(&uris);
        tokio::spawn(async move {
            serve_once(
                &listener,
                &uris,
                vec![frame("execution_start", json!({"prompt_id": "job-1"}))],
            )
            .await;
            serve_once(
                &listener,
                &uris,
                vec![frame("execution_success", json!({"prompt_id": "job-1"}))],
            )
            .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
    };

    let session = session_for(port);
    session.ensure_channel().await.unwrap();
    let mut events = session.subscribe("job-1");

    assert_eq!(next(&mut events).await, JobEvent::Started);
    assert_eq!(next(&mut events).await, JobEvent::Resumed);
    assert_eq!(next(&mut events).await, JobEvent::Finished);

    let uris = uris.lock().unwrap().clone();
    assert_eq!(uris.len(), 2);
    assert_eq!(uris[0], uris[1]);
    session.close().await;
    server.abort();
}

#[tokio::test]
async fn failed_reconnect_reports_connection_lost() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let uris = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let uris = Arc::clone(&uris);
        tokio::spawn(async move {
            serve_once(
                &listener,
                &uris,
                vec![frame("execution_start", json!({"prompt_id": "job-1"}))],
            )
            .await;
            // Dropping the listener makes the reconnect attempt fail.
        })
    };

    let session = session_for(port);
    session.ensure_channel().await.unwrap();
    let mut events = session.subscribe("job-1");

    assert_eq!(next(&mut events).await, JobEvent::Started);
    assert!(matches!(next(&mut events).await, JobEvent::ChannelLost(_)));
    assert!(!session.is_channel_open().await);

    server.await.unwrap();
}

#[tokio::test]
async fn subscribe_without_channel_reports_connection_lost() {
    let session = session_for(1);
    let mut events = session.subscribe("job-1");
    assert!(matches!(next(&mut events).await, JobEvent::ChannelLost(_)));
}
