use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

/// `session_type` reported by a server running in bridge mode. Anything else
/// answering on the proxy port is not a viewer bridge.
pub const BRIDGE_SESSION_TYPE: &str = "viewer_bridge_session";

const BODY_PREVIEW_CHARS: usize = 240;

/// How long a successful probe vouches for the endpoint before calls
/// re-check that a viewer bridge is still the one answering.
const BRIDGE_CONFIRMATION_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed creating proxy client: {0}")]
    Client(String),
    #[error("viewer bridge at {endpoint} is unreachable: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("viewer bridge at {0} did not answer in time")]
    Timeout(String),
    #[error("viewer bridge returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("viewer bridge sent an unreadable reply: {0}")]
    Protocol(String),
    #[error("server at {endpoint} is not a viewer bridge (session_type={session_type:?})")]
    NotBridge {
        endpoint: String,
        session_type: Option<String>,
    },
}

/// Tool calls served by another process that owns a live viewer.
#[async_trait]
pub trait RemoteTools: Send + Sync {
    fn endpoint(&self) -> String;

    /// Forwards one tool call. `Ok` carries the remote ToolResult, including
    /// remote tool failures; `Err` means the bridge could not be used.
    async fn call(&self, name: &str, params: &Value) -> Result<Value, TransportError>;

    /// Session report of the remote bridge, or `None` when nothing usable
    /// answers.
    async fn probe(&self) -> Option<Value>;
}

pub struct ProxyClient {
    endpoint: Url,
    timeout: Duration,
    probe_timeout: Duration,
    next_id: AtomicU64,
    confirmed_at: Mutex<Option<Instant>>,
}

impl ProxyClient {
    pub fn new(
        host: &str,
        port: u16,
        path: &str,
        timeout: Duration,
        probe_timeout: Duration,
    ) -> Result<Self> {
        let base = Url::parse(&format!("http://{host}:{port}/"))
            .with_context(|| format!("invalid proxy host '{host}'"))?;
        let endpoint = base
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("invalid proxy path '{path}'"))?;
        Ok(Self {
            endpoint,
            timeout,
            probe_timeout,
            next_id: AtomicU64::new(1),
            confirmed_at: Mutex::new(None),
        })
    }

    /// Asks the peer for its session report and accepts it only when it
    /// identifies as a viewer bridge.
    async fn confirm_bridge(&self) -> Result<Value, TransportError> {
        let envelope = self
            .rpc(
                "tools/call",
                json!({ "name": "session_information", "arguments": {} }),
                self.probe_timeout,
            )
            .await?;
        let report = decode_tool_reply(&envelope)?;
        let session_type = report.get("session_type").and_then(Value::as_str);
        if session_type != Some(BRIDGE_SESSION_TYPE) {
            return Err(TransportError::NotBridge {
                endpoint: self.endpoint.to_string(),
                session_type: session_type.map(str::to_owned),
            });
        }
        self.mark_confirmed(Some(Instant::now()));
        Ok(report)
    }

    fn recently_confirmed(&self) -> bool {
        self.confirmed_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() < BRIDGE_CONFIRMATION_TTL)
    }

    fn mark_confirmed(&self, at: Option<Instant>) {
        *self.confirmed_at.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    /// One JSON-RPC round trip. A fresh client per call keeps no pooled
    /// connections to a bridge that may restart between calls.
    async fn rpc(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|err| TransportError::Client(err.to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let endpoint = self.endpoint.to_string();
        let response = client
            .post(self.endpoint.clone())
            .header("Accept", "application/json, text/event-stream")
            .json(&payload)
            .send()
            .await
            .map_err(|err| classify(&endpoint, err))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| classify(&endpoint, err))?;
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: preview(&body),
            });
        }
        parse_envelope(&body)
    }
}

#[async_trait]
impl RemoteTools for ProxyClient {
    fn endpoint(&self) -> String {
        self.endpoint.to_string()
    }

    async fn call(&self, name: &str, params: &Value) -> Result<Value, TransportError> {
        if !self.recently_confirmed() {
            self.confirm_bridge().await?;
        }
        let reply = self
            .rpc(
                "tools/call",
                json!({ "name": name, "arguments": params }),
                self.timeout,
            )
            .await
            .and_then(|envelope| decode_tool_reply(&envelope));
        if reply.is_err() {
            self.mark_confirmed(None);
        }
        reply
    }

    async fn probe(&self) -> Option<Value> {
        match self.confirm_bridge().await {
            Ok(report) => Some(report),
            Err(err) => {
                debug!("viewer bridge probe failed: {err}");
                self.mark_confirmed(None);
                None
            }
        }
    }
}

fn classify(endpoint: &str, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(endpoint.to_owned())
    } else {
        TransportError::Connect {
            endpoint: endpoint.to_owned(),
            reason: err.to_string(),
        }
    }
}

fn preview(body: &str) -> String {
    let mut out = body.chars().take(BODY_PREVIEW_CHARS).collect::<String>();
    if body.chars().count() > BODY_PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}

/// Accepts a plain JSON body or an event stream whose last `data:` line
/// holds the envelope.
fn parse_envelope(body: &str) -> Result<Value, TransportError> {
    let trimmed = body.trim();
    let json_text = if trimmed.starts_with('{') {
        trimmed
    } else {
        trimmed
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .last()
            .ok_or_else(|| TransportError::Protocol(format!("not JSON-RPC: {}", preview(body))))?
    };
    let envelope: Value = serde_json::from_str(json_text)
        .map_err(|err| TransportError::Protocol(format!("{err}: {}", preview(json_text))))?;
    if !envelope.is_object() {
        return Err(TransportError::Protocol("envelope is not an object".to_owned()));
    }
    Ok(envelope)
}

/// Turns a `tools/call` envelope into a ToolResult. A JSON-RPC error is a
/// remote tool failure; an envelope without text content is not a bridge
/// reply at all.
fn decode_tool_reply(envelope: &Value) -> Result<Value, TransportError> {
    if let Some(error) = envelope.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("remote call failed");
        return Ok(json!({ "status": "error", "message": message }));
    }
    let text = envelope
        .pointer("/result/content")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .find(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        })
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str);
    let text = text.ok_or_else(|| {
        TransportError::Protocol(format!(
            "reply has neither tool content nor an error: {}",
            preview(&envelope.to_string())
        ))
    })?;
    Ok(serde_json::from_str(text).unwrap_or_else(|_| {
        json!({
            "status": "error",
            "message": format!("invalid JSON response: {text}"),
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::thread::JoinHandle;

    fn read_request(stream: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0_u8; 4096];
        loop {
            let read = stream.read(&mut chunk).expect("read request");
            if read == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..read]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(split) = text.find("\r\n\r\n") {
                let content_length = text[..split]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= split + 4 + content_length {
                    return text[split + 4..].to_string();
                }
            }
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    type Reply = (&'static str, &'static str, String);

    /// Answers one connection per reply, in order, and hands back the bodies
    /// of the requests it saw.
    fn serve_sequence(replies: Vec<Reply>) -> (SocketAddr, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = listener.local_addr().expect("listener addr");
        let server = std::thread::spawn(move || {
            let mut requests = Vec::new();
            for (status, content_type, body) in replies {
                let (mut stream, _) = listener.accept().expect("accept request");
                requests.push(read_request(&mut stream));
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream
                    .write_all(response.as_bytes())
                    .expect("write response");
            }
            requests
        });
        (addr, server)
    }

    fn serve_once(status: &'static str, content_type: &'static str, body: String) -> (SocketAddr, JoinHandle<Vec<String>>) {
        serve_sequence(vec![(status, content_type, body)])
    }

    fn json_reply(body: String) -> Reply {
        ("200 OK", "application/json", body)
    }

    fn bridge_reply() -> Reply {
        let report = json!({ "status": "ok", "session_type": BRIDGE_SESSION_TYPE }).to_string();
        json_reply(tool_envelope(&report))
    }

    fn tool_envelope(text: &str) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "content": [{ "type": "text", "text": text }] },
        })
        .to_string()
    }

    fn client(addr: SocketAddr) -> ProxyClient {
        ProxyClient::new(
            "127.0.0.1",
            addr.port(),
            "/mcp",
            Duration::from_secs(5),
            Duration::from_secs(2),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn call_posts_tools_call_and_decodes_text_content() {
        let (addr, server) = serve_sequence(vec![
            bridge_reply(),
            json_reply(tool_envelope(r#"{"status":"ok","n_layers":0,"layers":[]}"#)),
        ]);
        let client = client(addr);
        assert!(client.endpoint().ends_with("/mcp"));
        let result = client
            .call("list_layers", &json!({}))
            .await
            .expect("call");
        assert_eq!(result["status"], "ok");
        assert_eq!(result["n_layers"], 0);

        let requests = server.join().expect("join");
        let confirm: Value = serde_json::from_str(&requests[0]).expect("confirm json");
        assert_eq!(confirm["params"]["name"], "session_information");
        let request: Value = serde_json::from_str(&requests[1]).expect("request json");
        assert_eq!(request["method"], "tools/call");
        assert_eq!(request["params"]["name"], "list_layers");
        assert_eq!(request["jsonrpc"], "2.0");
    }

    #[tokio::test]
    async fn bridge_confirmation_is_reused_between_calls() {
        let ok = || json_reply(tool_envelope(r#"{"status":"ok"}"#));
        let (addr, server) = serve_sequence(vec![bridge_reply(), ok(), ok()]);
        let client = client(addr);
        client.call("reset_view", &json!({})).await.expect("first");
        client.call("reset_view", &json!({})).await.expect("second");
        assert_eq!(server.join().expect("join").len(), 3);
    }

    #[tokio::test]
    async fn non_json_text_becomes_error_result() {
        let (addr, server) = serve_sequence(vec![
            bridge_reply(),
            json_reply(tool_envelope("not json at all")),
        ]);
        let result = client(addr).call("reset_view", &json!({})).await.expect("call");
        assert_eq!(result["status"], "error");
        assert_eq!(result["message"], "invalid JSON response: not json at all");
        server.join().expect("join");
    }

    #[tokio::test]
    async fn rpc_error_and_event_stream_replies() {
        let error = json!({
            "jsonrpc": "2.0",
            "id": 2,
            "error": { "code": -32601, "message": "unknown tool" },
        })
        .to_string();
        let (addr, server) = serve_sequence(vec![bridge_reply(), json_reply(error)]);
        let result = client(addr).call("nope", &json!({})).await.expect("call");
        assert_eq!(result, json!({ "status": "error", "message": "unknown tool" }));
        server.join().expect("join");

        let stream = format!(
            "event: message\ndata: {}\n\n",
            tool_envelope(r#"{"status":"ok","grid":true}"#)
        );
        let (addr, server) = serve_sequence(vec![
            bridge_reply(),
            ("200 OK", "text/event-stream", stream),
        ]);
        let result = client(addr).call("set_grid", &json!({})).await.expect("call");
        assert_eq!(result["grid"], true);
        server.join().expect("join");
    }

    #[tokio::test]
    async fn transport_failures_are_errors() {
        let (addr, server) = serve_once("500 Internal Server Error", "text/plain", "boom".to_owned());
        let err = client(addr).call("list_layers", &json!({})).await.expect_err("status");
        assert!(matches!(err, TransportError::Status { status: 500, .. }));
        server.join().expect("join");

        let closed = TcpListener::bind("127.0.0.1:0")
            .expect("bind")
            .local_addr()
            .expect("addr");
        let err = client(closed).call("list_layers", &json!({})).await.expect_err("refused");
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[tokio::test]
    async fn unrelated_json_servers_are_transport_errors() {
        let (addr, server) = serve_once("200 OK", "application/json", "{}".to_owned());
        let err = client(addr).call("list_layers", &json!({})).await.expect_err("plain json");
        assert!(matches!(err, TransportError::Protocol(_)), "{err}");
        server.join().expect("join");

        let empty_result = json!({ "jsonrpc": "2.0", "id": 2, "result": {} }).to_string();
        let (addr, server) = serve_sequence(vec![bridge_reply(), json_reply(empty_result)]);
        let err = client(addr).call("list_layers", &json!({})).await.expect_err("no content");
        assert!(matches!(err, TransportError::Protocol(_)), "{err}");
        server.join().expect("join");

        let standalone = json!({ "status": "ok", "session_type": "viewer_mcp_standalone_session" }).to_string();
        let (addr, server) = serve_once("200 OK", "application/json", tool_envelope(&standalone));
        let err = client(addr).call("list_layers", &json!({})).await.expect_err("not a bridge");
        assert!(matches!(err, TransportError::NotBridge { .. }), "{err}");
        server.join().expect("join");
    }

    #[tokio::test]
    async fn probe_accepts_only_bridge_sessions() {
        let (addr, server) = serve_sequence(vec![bridge_reply()]);
        let report = client(addr).probe().await.expect("bridge");
        assert_eq!(report["session_type"], BRIDGE_SESSION_TYPE);
        server.join().expect("join");

        let standalone = json!({ "status": "ok", "session_type": "viewer_mcp_standalone_session" }).to_string();
        let (addr, server) = serve_once("200 OK", "application/json", tool_envelope(&standalone));
        assert!(client(addr).probe().await.is_none());
        server.join().expect("join");
    }
}
