use std::io::{self, Read, Write};
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::{debug, error};

use crate::point::{DataPoint, JsonPoint, TagMap};
use crate::sanitize::Sanitizer;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Hard cap on how much of a response body is kept in memory.
const MAX_RESPONSE_LEN: usize = 5 * 1024 * 1024;
/// Body recorded in place of one that exceeded [`MAX_RESPONSE_LEN`].
const RESPONSE_TOO_LONG: &str = "Response too long";

/// The `?details` flag asks the backend to report per-point errors in its
/// response body.
const DEFAULT_PUT_ENDPOINT: &str = "http://127.0.0.1:4242/api/put?details";

/// Errors surfaced by [`PutClient::send`].
///
/// Transport failures and HTTP rejections are distinct kinds so callers can
/// tell "could not reach the backend" apart from "the backend rejected the
/// data". Nothing is retried internally; the caller owns backoff policy.
#[derive(Debug, Error)]
pub enum SendError {
    /// The backend could not be reached: connection refused, DNS failure, or
    /// a timeout.
    #[error("error reaching metrics backend: {0}")]
    Transport(#[source] ureq::Transport),

    /// The backend answered with an HTTP error status. The body (possibly
    /// the truncation sentinel) typically carries a
    /// `{"success":N,"failed":M,"errors":[...]}` payload which this layer
    /// preserves but does not parse.
    #[error("metrics backend rejected batch with status {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The response body, truncated to a sentinel when oversized.
        body: String,
    },

    /// A local failure while encoding the request or draining the response.
    #[error("i/o error during send: {0}")]
    Io(#[from] io::Error),
}

impl SendError {
    /// Returns the HTTP status code for [`SendError::Status`] failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            SendError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Bulk-PUT client for the backend's HTTP ingest API.
///
/// Batches are serialized as a JSON array of point objects, gzip-compressed,
/// and `POST`ed with bearer authentication. The call blocks on the calling
/// thread and is bounded by the connect and read timeouts, so a hung endpoint
/// cannot stall a reporting scheduler indefinitely.
pub struct PutClient {
    endpoint: String,
    token: String,
    global_tags: TagMap,
    agent: ureq::Agent,
}

impl PutClient {
    /// Creates a client for the default ingest endpoint,
    /// `http://127.0.0.1:4242/api/put?details`.
    pub fn new(token: impl Into<String>, global_tags: TagMap) -> Self {
        Self::with_endpoint(token, global_tags, DEFAULT_PUT_ENDPOINT)
    }

    /// Creates a client for a specific ingest endpoint.
    pub fn with_endpoint(
        token: impl Into<String>,
        global_tags: TagMap,
        endpoint: impl Into<String>,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .user_agent(&user_agent())
            .build();
        PutClient { endpoint: endpoint.into(), token: token.into(), global_tags, agent }
    }

    /// Returns the configured ingest endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Ships `points` to the ingest API, blocking until the backend answers.
    ///
    /// Empty input returns immediately without a network call. A `2xx`/`3xx`
    /// answer is a success; the response body is read (up to a 5 MiB cap)
    /// only for diagnostics.
    ///
    /// # Errors
    ///
    /// [`SendError::Transport`] when the backend is unreachable,
    /// [`SendError::Status`] when it answers with a status of 400 or above,
    /// and [`SendError::Io`] on local encoding or response-read failures.
    pub fn send(&self, points: &[DataPoint], sanitizer: &Sanitizer) -> Result<(), SendError> {
        if points.is_empty() {
            return Ok(());
        }

        let body = self.encode_body(points, sanitizer)?;

        let result = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .set("Content-Encoding", "gzip")
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_bytes(&body);

        match result {
            Ok(response) => {
                let status = response.status();
                let body = read_response_body(response)?;
                debug!(status, body = %body, "datapoints accepted");
                Ok(())
            }
            Err(ureq::Error::Status(status, response)) => {
                let body = read_response_body(response)?;
                Err(SendError::Status { status, body })
            }
            Err(ureq::Error::Transport(transport)) => Err(SendError::Transport(transport)),
        }
    }

    /// Fire-and-forget variant of [`send`](Self::send): any error is logged
    /// and swallowed, symmetric with the UDP forwarder's semantics.
    pub fn put(&self, points: &[DataPoint], sanitizer: &Sanitizer) {
        if let Err(e) = self.send(points, sanitizer) {
            error!(error = %e, "error sending datapoints");
        }
    }

    /// Builds the gzip-compressed JSON array body, streaming each point's
    /// object straight into the compressor.
    fn encode_body(&self, points: &[DataPoint], sanitizer: &Sanitizer) -> Result<Vec<u8>, SendError> {
        let global_tags = (!self.global_tags.is_empty()).then_some(&self.global_tags);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"[\n")?;
        for (i, point) in points.iter().enumerate() {
            if i > 0 {
                encoder.write_all(b",\n")?;
            }
            serde_json::to_writer(&mut encoder, &JsonPoint { point, global_tags, sanitizer })
                .map_err(io::Error::from)?;
        }
        encoder.write_all(b"\n]")?;
        Ok(encoder.finish()?)
    }
}

fn user_agent() -> String {
    format!(
        "{}/{} {}-{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}

/// Reads the response body up to [`MAX_RESPONSE_LEN`]; anything longer is
/// discarded and replaced with the [`RESPONSE_TOO_LONG`] sentinel.
fn read_response_body(response: ureq::Response) -> Result<String, SendError> {
    let mut reader = response.into_reader().take(MAX_RESPONSE_LEN as u64 + 1);
    let mut body = Vec::new();
    reader.read_to_end(&mut body)?;
    if body.len() > MAX_RESPONSE_LEN {
        return Ok(RESPONSE_TOO_LONG.to_owned());
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::thread::{self, JoinHandle};

    use flate2::read::GzDecoder;

    use super::{PutClient, SendError};
    use crate::point::{DataPoint, TagMap};
    use crate::sanitize::{Policy, Sanitizer};

    /// Accepts one connection, reads one request, answers with a canned
    /// response, and hands the raw request bytes back.
    fn one_shot_server(status: &'static str, body: &'static str) -> (SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len(),
            );
            stream.write_all(response.as_bytes()).unwrap();
            request
        });

        (addr, handle)
    }

    fn read_request(stream: &mut std::net::TcpStream) -> Vec<u8> {
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if let Some(headers_end) = find(&request, b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&request[..headers_end]).to_ascii_lowercase();
                let content_length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= headers_end + 4 + content_length {
                    break;
                }
            }
        }
        request
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|window| window == needle)
    }

    fn request_body(request: &[u8]) -> Vec<u8> {
        let headers_end = find(request, b"\r\n\r\n").unwrap();
        request[headers_end + 4..].to_vec()
    }

    fn sample_points() -> Vec<DataPoint> {
        let mut tags = TagMap::new();
        tags.insert("host".to_string(), "web-1".to_string());
        vec![
            DataPoint::new("proc.stat.cpu", 1515021070, 1515i64, tags),
            DataPoint::new("proc.load.avg", 1515021070, 0.25f64, TagMap::new()),
        ]
    }

    #[test]
    fn successful_send_posts_gzip_json() {
        let (addr, handle) = one_shot_server("200 OK", "{\"success\":2,\"failed\":0}");
        let client =
            PutClient::with_endpoint("s3cr3t", TagMap::new(), format!("http://{addr}/api/put?details"));

        client.send(&sample_points(), &Sanitizer::new(Policy::Noop)).unwrap();

        let request = handle.join().unwrap();
        let headers = String::from_utf8_lossy(&request).to_ascii_lowercase();
        assert!(headers.contains("post /api/put?details http/1.1"));
        assert!(headers.contains("authorization: bearer s3cr3t"));
        assert!(headers.contains("content-type: application/json"));
        assert!(headers.contains("content-encoding: gzip"));
        assert!(headers.contains(&format!("user-agent: tsdb-client/{}", env!("CARGO_PKG_VERSION"))));

        let mut json = String::new();
        GzDecoder::new(&request_body(&request)[..]).read_to_string(&mut json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!([
                {
                    "metric": "proc.stat.cpu",
                    "timestamp": 1_515_021_070u64,
                    "value": 1515,
                    "tags": {"host": "web-1"}
                },
                {
                    "metric": "proc.load.avg",
                    "timestamp": 1_515_021_070u64,
                    "value": 0.25,
                    "tags": {}
                }
            ])
        );
    }

    #[test]
    fn global_tags_reach_the_wire() {
        let (addr, handle) = one_shot_server("200 OK", "");
        let mut globals = TagMap::new();
        globals.insert("dc".to_string(), "eu-1".to_string());
        let client = PutClient::with_endpoint("t", globals, format!("http://{addr}/api/put"));

        let points = vec![DataPoint::new("m", 1, 2i64, TagMap::new())];
        client.send(&points, &Sanitizer::new(Policy::Noop)).unwrap();

        let request = handle.join().unwrap();
        let mut json = String::new();
        GzDecoder::new(&request_body(&request)[..]).read_to_string(&mut json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["tags"]["dc"], "eu-1");
    }

    #[test]
    fn rejection_carries_status_and_body() {
        let (addr, handle) = one_shot_server("400 Bad Request", "bad datapoints");
        let client = PutClient::with_endpoint("t", TagMap::new(), format!("http://{addr}/api/put"));

        let err = client.send(&sample_points(), &Sanitizer::default()).unwrap_err();
        match err {
            SendError::Status { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad datapoints");
            }
            other => panic!("expected status error, got {other:?}"),
        }

        handle.join().unwrap();
    }

    #[test]
    fn unreachable_backend_is_a_transport_error() {
        // Bind a port and close it again so nothing is listening there.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = PutClient::with_endpoint("t", TagMap::new(), format!("http://{addr}/api/put"));
        let err = client.send(&sample_points(), &Sanitizer::default()).unwrap_err();
        assert!(matches!(err, SendError::Transport(_)), "got {err:?}");
        assert_eq!(err.status(), None);
    }

    #[test]
    fn empty_batch_sends_nothing() {
        // The endpoint is never contacted, so a bogus port is fine.
        let client = PutClient::with_endpoint("t", TagMap::new(), "http://127.0.0.1:1/api/put");
        client.send(&[], &Sanitizer::default()).unwrap();
    }

    #[test]
    fn put_swallows_errors() {
        let client = PutClient::with_endpoint("t", TagMap::new(), "http://127.0.0.1:1/api/put");
        client.put(&sample_points(), &Sanitizer::default());
    }
}
