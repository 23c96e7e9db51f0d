use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use migrx::prelude::{Error, HttpClient, NetworkOptions, TimeoutPhase, TransportRequest};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
}

impl MockResponse {
    fn new(status: u16, headers: Vec<(&str, &str)>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value.to_owned()))
                .collect(),
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

struct MockServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let served_clone = Arc::clone(&served);
        let captured_clone = Arc::clone(&captured);

        let join = thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            let mut response_index = 0;

            while response_index < responses.len() && std::time::Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        if let Ok(request) = read_request(&mut stream) {
                            captured_clone
                                .lock()
                                .expect("lock captured requests")
                                .push(request);
                        }

                        served_clone.fetch_add(1, Ordering::SeqCst);
                        let response = &responses[response_index];
                        response_index += 1;

                        if !response.delay.is_zero() {
                            thread::sleep(response.delay);
                        }

                        let _ = write_response(&mut stream, response);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            captured,
            join: Some(join),
        }
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 4096];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if find_header_end(&raw).is_some() {
            break;
        }
    }

    let header_end = find_header_end(&raw).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "malformed request without header terminator",
        )
    })?;

    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut request_line_parts = request_line.split_whitespace();
    let method = request_line_parts.next().unwrap_or_default().to_owned();
    let path = request_line_parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0_u8; 4096];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        response.body.len()
    );
    for (name, value) in &response.headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        206 => "Partial Content",
        404 => "Not Found",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn fast_options() -> NetworkOptions {
    NetworkOptions::new()
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
        .with_jitter_ratio(0.0)
        .with_request_timeout(Duration::from_secs(3))
}

fn client_for(server: &MockServer, options: NetworkOptions) -> HttpClient {
    HttpClient::builder()
        .base_url(server.base_url.clone())
        .client_name("migrx-test")
        .options(options)
        .try_build()
        .expect("client should build")
}

#[derive(Debug, Deserialize)]
struct SiteEnvelope {
    site: Site,
}

#[derive(Debug, Deserialize)]
struct Site {
    id: String,
    name: String,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_typed_decodes_json_payload() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        vec![("Content-Type", "application/json; charset=utf-8")],
        r#"{"site":{"id":"site-1","name":"Finance"}}"#,
    )]);
    let client = client_for(&server, fast_options());

    let envelope = client
        .send_typed::<SiteEnvelope>(
            client.get("/api/3.22/sites/site-1").expect("path should resolve"),
            &CancellationToken::new(),
        )
        .await
        .expect("request should succeed");

    let site = envelope.into_payload().expect("payload should decode").site;
    assert_eq!(site.id, "site-1");
    assert_eq!(site.name, "Finance");

    let requests = server.requests();
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/api/3.22/sites/site-1");
    assert_eq!(
        requests[0].headers.get("accept").map(String::as_str),
        Some("application/json")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retryable_status_is_retried_over_http() {
    let server = MockServer::start(vec![
        MockResponse::new(503, vec![("Retry-After", "0")], "busy"),
        MockResponse::new(200, vec![("Content-Type", "application/json")], r#"{"ok":true}"#),
    ]);
    let client = client_for(&server, fast_options().with_retry_limit(2));

    let response = client
        .send(
            client.get("/api/jobs/1").expect("path should resolve"),
            &CancellationToken::new(),
        )
        .await
        .expect("second attempt should succeed");
    assert!(response.is_success());
    assert_eq!(server.served_count(), 2);

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.attempts, 2);
    assert_eq!(metrics.retries, 1);
    assert_eq!(metrics.requests_succeeded, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_throttle_reissues_after_retry_after() {
    let server = MockServer::start(vec![
        MockResponse::new(429, vec![("Retry-After", "0")], "slow down"),
        MockResponse::new(200, vec![], ""),
    ]);
    let client = client_for(&server, fast_options().with_retry_limit(0));

    let response = client
        .send(
            client.get("/api/3.22/sites").expect("path should resolve"),
            &CancellationToken::new(),
        )
        .await
        .expect("throttled request should be re-issued");
    assert!(response.is_success());
    assert_eq!(server.served_count(), 2);
    assert_eq!(client.metrics_snapshot().server_throttles, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_retryable_status_returns_failed_envelope() {
    let server = MockServer::start(vec![MockResponse::new(
        404,
        vec![("Content-Type", "application/json")],
        r#"{"error":{"code":"404000","summary":"Resource Not Found"}}"#,
    )]);
    let client = client_for(&server, fast_options());

    let envelope = client
        .send_typed::<serde_json::Value>(
            client.get("/api/3.22/sites/missing").expect("path should resolve"),
            &CancellationToken::new(),
        )
        .await
        .expect("404 is not a pipeline error");
    assert!(!envelope.is_success());
    assert!(envelope.payload().is_none());
    assert!(envelope.response().text_lossy().contains("404000"));
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_attempt_times_out_and_exhausts_retries() {
    let server = MockServer::start(vec![
        MockResponse::new(200, vec![], "late").delayed(Duration::from_millis(400)),
    ]);
    let client = client_for(
        &server,
        fast_options()
            .with_retry_limit(0)
            .with_request_timeout(Duration::from_millis(50)),
    );

    let error = client
        .send(
            client.get("/api/slow").expect("path should resolve"),
            &CancellationToken::new(),
        )
        .await
        .expect_err("attempt should time out");
    match error {
        Error::RetryExhausted { attempts, last } => {
            assert_eq!(attempts, 1);
            assert!(matches!(
                *last,
                Error::Timeout {
                    phase: TimeoutPhase::Attempt,
                    ..
                }
            ));
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(client.metrics_snapshot().attempt_timeouts, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chunked_upload_sends_ordered_put_requests() {
    let server = MockServer::start(vec![
        MockResponse::new(200, vec![], ""),
        MockResponse::new(200, vec![], ""),
        MockResponse::new(
            201,
            vec![("Content-Type", "application/json")],
            r#"{"committed":true}"#,
        ),
    ]);
    let client = client_for(&server, fast_options().with_chunk_size_kb(1));
    let source: Vec<u8> = (0..2_500_u32).map(|value| (value % 251) as u8).collect();
    let mut reader = source.as_slice();

    let envelopes = client
        .process::<serde_json::Value, _, _>(
            &mut reader,
            |chunk| {
                Ok(client
                    .put("/api/3.22/sites/site-1/fileUploads/upload-1")?
                    .try_header("x-chunk-index", &chunk.index().to_string())?
                    .body(chunk.data().clone()))
            },
            &CancellationToken::new(),
        )
        .await
        .expect("upload should succeed");

    assert_eq!(envelopes.len(), 3);
    assert_eq!(
        envelopes[2].payload(),
        Some(&serde_json::json!({ "committed": true }))
    );

    let requests = server.requests();
    let indexes: Vec<_> = requests
        .iter()
        .map(|request| request.headers.get("x-chunk-index").cloned().unwrap_or_default())
        .collect();
    assert_eq!(indexes, ["0", "1", "2"]);
    let lengths: Vec<_> = requests.iter().map(|request| request.body.len()).collect();
    assert_eq!(lengths, [1024, 1024, 452]);
    let reassembled: Vec<u8> = requests
        .iter()
        .flat_map(|request| request.body.iter().copied())
        .collect();
    assert_eq!(reassembled, source);
    assert!(requests.iter().all(|request| request.method == "PUT"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chunked_download_writes_ranges_in_order() {
    let source: Vec<u8> = (0..1_500_u32).map(|value| (value % 199) as u8).collect();
    let server = MockServer::start(vec![
        MockResponse::new(206, vec![], source[..1024].to_vec()),
        MockResponse::new(206, vec![], source[1024..].to_vec()),
    ]);
    let client = client_for(&server, fast_options().with_chunk_size_kb(1));
    let mut sink = Vec::new();

    let summary = client
        .download(
            source.len() as u64,
            |range| {
                client
                    .get("/api/3.22/sites/site-1/workbooks/wb-1/content")?
                    .try_header("range", &range.range_header_value())
            },
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .expect("download should succeed");

    assert_eq!(summary.chunks, 2);
    assert_eq!(summary.bytes_written, 1_500);
    assert_eq!(sink, source);
    let ranges: Vec<_> = server
        .requests()
        .iter()
        .map(|request| request.headers.get("range").cloned().unwrap_or_default())
        .collect();
    assert_eq!(ranges, ["bytes=0-1023", "bytes=1024-1499"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_error_is_classified_as_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind unused port");
    let address = listener.local_addr().expect("read unused port address");
    drop(listener);

    let client = HttpClient::builder()
        .options(fast_options().with_retry_limit(0))
        .try_build()
        .expect("client should build");
    let error = client
        .send(
            TransportRequest::get(&format!("http://{address}/unreachable"))
                .expect("uri should parse"),
            &CancellationToken::new(),
        )
        .await
        .expect_err("connection must be refused");
    match error {
        Error::RetryExhausted { last, .. } => {
            assert!(matches!(
                *last,
                Error::Transport {
                    kind: migrx::TransportErrorKind::Connect,
                    ..
                }
            ));
        }
        other => panic!("unexpected error variant: {other}"),
    }
}
