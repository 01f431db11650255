//! Tests for the streaming inference client against a raw TCP mock server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use critique::client::{InferenceClient, PromptBuilder, RequestPayload, RetryPolicy};
use critique::error::ReviewError;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Helper: bind a TCP listener on localhost and return (listener, port).
async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Helper: read one HTTP request (headers plus Content-Length body).
async fn read_request(socket: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&data);
        if let Some(head_end) = text.find("\r\n\r\n") {
            let content_length = text[..head_end]
                .lines()
                .find_map(|line| {
                    let (key, value) = line.split_once(':')?;
                    if key.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if data.len() >= head_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}

/// Helper: one NDJSON record as Ollama writes it.
fn ndjson(content: &str, done: bool) -> String {
    let record = serde_json::json!({
        "model": "test-model",
        "message": {"role": "assistant", "content": content},
        "done": done,
    });
    format!("{record}\n")
}

const NDJSON_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: application/x-ndjson\r\n\
    Connection: close\r\n\r\n";

const UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
    Content-Length: 4\r\n\
    Connection: close\r\n\r\nbusy";

const TAGS_OK: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Length: 13\r\n\
    Connection: close\r\n\r\n{\"models\":[]}";

const SERVER_ERROR: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\
    Content-Length: 0\r\n\
    Connection: close\r\n\r\n";

fn client(port: u16, max_retries: u32) -> InferenceClient {
    InferenceClient::new(
        format!("http://127.0.0.1:{port}/api/chat"),
        Duration::from_secs(5),
        RetryPolicy::new(max_retries).with_backoff_unit(Duration::from_millis(10)),
    )
    .unwrap()
}

fn review_payload() -> RequestPayload {
    PromptBuilder::new("test-model", 50_000)
        .review("def f(): pass")
        .unwrap()
}

async fn collect(client: &InferenceClient) -> Result<Vec<String>, ReviewError> {
    let cancel = CancellationToken::new();
    let stream = client.stream(&review_payload(), &cancel).await?;
    stream.collect::<Vec<_>>().await.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streams_tokens_until_done() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;

        socket.write_all(NDJSON_HEADERS).await.unwrap();
        socket.write_all(ndjson("Looks", false).as_bytes()).await.unwrap();
        socket.write_all(ndjson(" fine.", false).as_bytes()).await.unwrap();
        socket.write_all(ndjson("", true).as_bytes()).await.unwrap();
        request
    });

    let tokens = collect(&client(port, 0)).await.unwrap();
    assert_eq!(tokens.concat(), "Looks fine.");

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /api/chat "), "{request}");
    let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["model"], "test-model");
    assert_eq!(json["stream"], true);
    assert_eq!(json["messages"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn data_prefixed_lines_split_across_writes() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;

        socket.write_all(NDJSON_HEADERS).await.unwrap();
        let line = format!("data: {}", ndjson("split token", false));
        let (head, tail) = line.split_at(10);
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.write_all(tail.as_bytes()).await.unwrap();
        socket.write_all(b"\n{garbage\n").await.unwrap();
        socket.write_all(ndjson("!", true).as_bytes()).await.unwrap();
    });

    let tokens = collect(&client(port, 0)).await.unwrap();
    assert_eq!(tokens, vec!["split token", "!"]);

    server.await.unwrap();
}

#[tokio::test]
async fn invalid_utf8_line_does_not_end_the_stream() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;

        socket.write_all(NDJSON_HEADERS).await.unwrap();
        socket.write_all(ndjson("a", false).as_bytes()).await.unwrap();
        socket.write_all(b"\xff\xfe garbage\n").await.unwrap();
        socket.write_all(ndjson("b", true).as_bytes()).await.unwrap();
    });

    let tokens = collect(&client(port, 0)).await.unwrap();
    assert_eq!(tokens, vec!["a", "b"]);

    server.await.unwrap();
}

#[tokio::test]
async fn error_record_mid_stream_is_surfaced_after_content() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;

        socket.write_all(NDJSON_HEADERS).await.unwrap();
        socket.write_all(ndjson("partial", false).as_bytes()).await.unwrap();
        socket
            .write_all(b"{\"error\":\"model runner has unexpectedly stopped\"}\n")
            .await
            .unwrap();
    });

    let cancel = CancellationToken::new();
    let items: Vec<_> = client(port, 3)
        .stream(&review_payload(), &cancel)
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_deref().unwrap(), "partial");
    match &items[1] {
        Err(ReviewError::Response { message, status }) => {
            assert!(message.contains("unexpectedly stopped"));
            assert_eq!(*status, None);
        }
        other => panic!("expected Response error, got {other:?}"),
    }

    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Spawn a server that drops the first `drops` connections, then streams a
/// short reply on every later one. Returns the accept counter.
fn flaky_server(
    listener: TcpListener,
    drops: usize,
) -> (Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            read_request(&mut socket).await;
            if n < drops {
                drop(socket);
                continue;
            }
            socket.write_all(NDJSON_HEADERS).await.unwrap();
            socket.write_all(ndjson("recovered", true).as_bytes()).await.unwrap();
        }
    });
    (accepted, handle)
}

#[tokio::test]
async fn succeeds_after_max_retries_failures() {
    let (listener, port) = mock_listener().await;
    let (accepted, server) = flaky_server(listener, 3);

    let tokens = collect(&client(port, 3)).await.unwrap();
    assert_eq!(tokens, vec!["recovered"]);
    assert_eq!(accepted.load(Ordering::SeqCst), 4);

    server.abort();
}

#[tokio::test]
async fn gives_up_after_max_retries_plus_one_attempts() {
    let (listener, port) = mock_listener().await;
    let (accepted, server) = flaky_server(listener, usize::MAX);

    let err = collect(&client(port, 2)).await.unwrap_err();
    assert!(matches!(err, ReviewError::Connection(_)), "got {err:?}");
    assert_eq!(accepted.load(Ordering::SeqCst), 3);

    server.abort();
}

#[tokio::test]
async fn http_error_status_is_not_retried() {
    let (listener, port) = mock_listener().await;
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    let server = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            read_request(&mut socket).await;
            socket.write_all(UNAVAILABLE).await.unwrap();
        }
    });

    let err = collect(&client(port, 3)).await.unwrap_err();
    match &err {
        ReviewError::Response { message, status } => {
            assert_eq!(*status, Some(503));
            assert_eq!(message, "busy");
        }
        other => panic!("expected Response error, got {other:?}"),
    }
    assert_eq!(err.user_message(), "inference server returned HTTP 503: busy");
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    server.abort();
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let (listener, port) = mock_listener().await;
    let (_accepted, server) = flaky_server(listener, usize::MAX);

    let client = InferenceClient::new(
        format!("http://127.0.0.1:{port}/api/chat"),
        Duration::from_secs(5),
        RetryPolicy::new(3).with_backoff_unit(Duration::from_secs(30)),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let start = std::time::Instant::now();
    let result = client.stream(&review_payload(), &cancel).await;
    assert!(matches!(result, Err(ReviewError::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(5));

    server.abort();
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_connection_hits_tags_endpoint() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        socket.write_all(TAGS_OK).await.unwrap();
        request
    });

    assert!(client(port, 0).test_connection().await);
    let request = server.await.unwrap();
    assert!(request.starts_with("GET /api/tags "), "{request}");
}

#[tokio::test]
async fn test_connection_false_on_server_error() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        socket.write_all(SERVER_ERROR).await.unwrap();
    });

    assert!(!client(port, 0).test_connection().await);
    server.await.unwrap();
}

#[tokio::test]
async fn test_connection_false_when_unreachable() {
    let (listener, port) = mock_listener().await;
    drop(listener);
    assert!(!client(port, 0).test_connection().await);
}
