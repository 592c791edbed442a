use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::tools::CATALOG;
use crate::types::{result_status, ToolRequest};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "viewer-mcp";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

const HTTP_MAX_HEADER_BYTES: usize = 64 * 1024;
const HTTP_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// JSON-RPC front of the dispatcher, shared by both transports.
pub struct McpHandler {
    dispatcher: Arc<Dispatcher>,
}

impl McpHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Handles one raw message (single or batch). `None` means nothing is
    /// to be sent back, as for notifications.
    pub async fn handle_text(&self, text: &str) -> Option<Value> {
        let message = match serde_json::from_str::<Value>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!("failed to parse JSON-RPC message: {err}");
                return Some(failure(Value::Null, PARSE_ERROR, format!("parse error: {err}")));
            }
        };
        match message {
            Value::Array(batch) => {
                let mut replies = Vec::with_capacity(batch.len());
                for entry in batch {
                    if let Some(reply) = self.handle_message(entry).await {
                        replies.push(reply);
                    }
                }
                (!replies.is_empty()).then_some(Value::Array(replies))
            }
            single => self.handle_message(single).await,
        }
    }

    pub async fn handle_message(&self, message: Value) -> Option<Value> {
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            let id = message.get("id").cloned().unwrap_or(Value::Null);
            return Some(failure(id, INVALID_REQUEST, "missing method"));
        };
        let Some(id) = message.get("id").cloned() else {
            debug!("received notification {method}");
            return None;
        };
        let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
        debug!("received request {method}");

        let reply = match method {
            "initialize" => success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "instructions": "Controls an image viewer. Start with init_viewer or session_information.",
                }),
            ),
            "ping" => success(id, json!({})),
            "tools/list" => success(id, json!({ "tools": tool_listing() })),
            "tools/call" => match serde_json::from_value::<ToolRequest>(params) {
                Ok(request) => {
                    let result = self.dispatcher.dispatch_request(request).await;
                    success(id, tool_call_result(&result))
                }
                Err(err) => failure(id, INVALID_PARAMS, format!("invalid tools/call params: {err}")),
            },
            other => failure(id, METHOD_NOT_FOUND, format!("method not found: {other}")),
        };
        Some(reply)
    }
}

pub fn tool_listing() -> Vec<Value> {
    CATALOG.iter().map(|spec| spec.describe()).collect()
}

/// The whole ToolResult travels as one text item so a proxying peer can
/// recover it verbatim.
fn tool_call_result(result: &Value) -> Value {
    json!({
        "content": [{ "type": "text", "text": result.to_string() }],
        "isError": result_status(result) == "error",
    })
}

fn success(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn failure(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    })
}

/// Line-delimited JSON-RPC until the reader reaches EOF.
pub async fn serve_stdio<R, W>(handler: &McpHandler, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!("MCP server listening on stdio");
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await.context("failed reading stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(reply) = handler.handle_text(line).await else {
            continue;
        };
        let mut encoded = serde_json::to_vec(&reply).context("failed serializing reply")?;
        encoded.push(b'\n');
        writer
            .write_all(&encoded)
            .await
            .context("failed writing reply")?;
        writer.flush().await.context("failed flushing reply")?;
    }
    info!("stdin closed, shutting down");
    Ok(())
}

pub async fn bind_http(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed binding MCP bridge listener on {host}:{port}"))
}

/// Serves MCP over HTTP POST at `path` until `shutdown` resolves.
pub async fn serve_http<F>(
    listener: TcpListener,
    handler: Arc<McpHandler>,
    path: String,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let bound_addr = listener
        .local_addr()
        .context("failed reading bound address")?;
    info!("MCP bridge listening on http://{bound_addr}{path}");
    let path = Arc::new(path);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let handler = handler.clone();
                        let path = path.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_http_connection(stream, &handler, &path).await {
                                warn!("MCP bridge connection failed: {err:#}");
                            }
                        });
                    }
                    Err(err) => warn!("MCP bridge accept failed: {err}"),
                }
            }
        }
    }
    info!("MCP bridge stopped");
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

struct HttpResponse {
    status: u16,
    body: Option<Vec<u8>>,
}

impl HttpResponse {
    fn json(status: u16, payload: &Value) -> Self {
        Self {
            status,
            body: Some(payload.to_string().into_bytes()),
        }
    }

    fn accepted() -> Self {
        Self {
            status: 202,
            body: None,
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            202 => "Accepted",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            _ => "",
        }
    }

    async fn send<W: AsyncWrite + Unpin>(self, writer: &mut W) -> Result<()> {
        let body = self.body.as_deref().unwrap_or_default();
        let mut encoded = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            self.status,
            self.reason(),
            body.len()
        )
        .into_bytes();
        encoded.extend_from_slice(body);
        writer
            .write_all(&encoded)
            .await
            .context("failed writing HTTP response")?;
        let _ = writer.shutdown().await;
        Ok(())
    }
}

async fn handle_http_connection(mut stream: TcpStream, handler: &McpHandler, mcp_path: &str) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let request = match read_http_request(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err) => {
            let payload = json!({ "error": "bad_request", "message": format!("{err:#}") });
            HttpResponse::json(400, &payload).send(&mut writer).await?;
            return Err(err);
        }
    };
    route_http(handler, mcp_path, request).await.send(&mut writer).await
}

async fn route_http(handler: &McpHandler, mcp_path: &str, request: HttpRequest) -> HttpResponse {
    match (request.method.as_str(), request.path.as_str()) {
        ("POST", path) if path == mcp_path => {
            let body = String::from_utf8_lossy(&request.body);
            match handler.handle_text(&body).await {
                Some(reply) => HttpResponse::json(200, &reply),
                None => HttpResponse::accepted(),
            }
        }
        ("GET", "/health") => HttpResponse::json(
            200,
            &json!({
                "status": "ok",
                "session_type": handler.dispatcher().session_type(),
                "protocol_version": PROTOCOL_VERSION,
            }),
        ),
        ("GET", path) if path == mcp_path => HttpResponse::json(
            405,
            &json!({ "error": "method_not_allowed", "allow": "POST" }),
        ),
        ("GET", _) | ("POST", _) => HttpResponse::json(
            404,
            &json!({ "error": "not_found", "path": request.path }),
        ),
        _ => HttpResponse::json(405, &json!({ "error": "method_not_allowed" })),
    }
}

/// Reads one line of the request head, charging it against `budget`.
/// `None` means the peer closed the connection before sending anything.
async fn read_head_line<R>(reader: &mut R, budget: &mut usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    if *budget == 0 {
        anyhow::bail!("HTTP request head exceeds {HTTP_MAX_HEADER_BYTES} bytes");
    }
    let mut line = String::new();
    let read = (&mut *reader)
        .take(*budget as u64)
        .read_line(&mut line)
        .await
        .context("failed reading HTTP request head")?;
    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        if read == *budget {
            anyhow::bail!("HTTP request head exceeds {HTTP_MAX_HEADER_BYTES} bytes");
        }
        anyhow::bail!("connection closed inside the HTTP request head");
    }
    *budget -= read;
    Ok(Some(line))
}

/// Request line, headers up to the blank line, then exactly
/// `Content-Length` body bytes.
async fn read_http_request<R>(reader: &mut R) -> Result<Option<HttpRequest>>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = HTTP_MAX_HEADER_BYTES;
    let Some(request_line) = read_head_line(reader, &mut budget).await? else {
        return Ok(None);
    };
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        anyhow::bail!("malformed HTTP request line {:?}", request_line.trim_end());
    };
    let method = method.to_ascii_uppercase();
    let path = request_path(target);

    let mut content_length = 0_usize;
    loop {
        let line = read_head_line(reader, &mut budget)
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed inside the HTTP headers"))?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .with_context(|| format!("invalid Content-Length {:?}", value.trim()))?;
        }
    }
    if content_length > HTTP_MAX_BODY_BYTES {
        anyhow::bail!("HTTP body of {content_length} bytes exceeds {HTTP_MAX_BODY_BYTES}");
    }

    let mut body = vec![0_u8; content_length];
    reader
        .read_exact(&mut body)
        .await
        .context("truncated HTTP request body")?;
    Ok(Some(HttpRequest { method, path, body }))
}

/// Drops the query string and any trailing slash.
fn request_path(target: &str) -> String {
    let path = target.split('?').next().unwrap_or(target);
    match path.trim_end_matches('/') {
        "" => "/".to_owned(),
        trimmed => trimmed.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::config::Config;
    use crate::dispatcher::{DispatcherSettings, STANDALONE_SESSION_TYPE};
    use crate::executor::MainContextExecutor;
    use crate::output_store::OutputStore;
    use crate::proxy::{ProxyClient, RemoteTools, BRIDGE_SESSION_TYPE};
    use crate::session::SessionContext;
    use crate::viewer::HeadlessViewerFactory;

    fn dispatcher(session_type: &'static str, remote: Option<Arc<dyn RemoteTools>>) -> Arc<Dispatcher> {
        let config = Config::default();
        let factory = Arc::new(HeadlessViewerFactory::new((24, 24)));
        let session = Arc::new(SessionContext::new(factory, "mcp-test"));
        let executor = Arc::new(
            MainContextExecutor::spawn("mcp-test", Duration::from_secs(5)).expect("executor"),
        );
        Arc::new(Dispatcher::new(
            session,
            executor,
            OutputStore::new(config.outputs.max_items),
            remote,
            DispatcherSettings::from_config(&config, session_type),
        ))
    }

    fn handler() -> McpHandler {
        McpHandler::new(dispatcher(STANDALONE_SESSION_TYPE, None))
    }

    fn call_text(reply: &Value) -> Value {
        let text = reply
            .pointer("/result/content/0/text")
            .and_then(Value::as_str)
            .expect("text content");
        serde_json::from_str(text).expect("tool result json")
    }

    #[tokio::test]
    async fn initialize_list_and_notifications() {
        let handler = handler();
        let init = handler
            .handle_text(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
            .await
            .expect("reply");
        assert_eq!(init["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init["id"], 1);

        assert!(handler
            .handle_text(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .is_none());

        let listed = handler
            .handle_text(r#"{"jsonrpc":"2.0","id":"l","method":"tools/list"}"#)
            .await
            .expect("reply");
        let tools = listed["result"]["tools"].as_array().expect("tools");
        assert_eq!(tools.len(), CATALOG.len());
        assert!(tools.iter().any(|tool| tool["name"] == "timelapse_screenshot"));
    }

    #[tokio::test]
    async fn protocol_errors_use_jsonrpc_codes() {
        let handler = handler();
        let parse = handler.handle_text("{not json").await.expect("reply");
        assert_eq!(parse["error"]["code"], PARSE_ERROR);
        let unknown = handler
            .handle_text(r#"{"jsonrpc":"2.0","id":2,"method":"resources/list"}"#)
            .await
            .expect("reply");
        assert_eq!(unknown["error"]["code"], METHOD_NOT_FOUND);
        let nameless = handler
            .handle_text(r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{}}"#)
            .await
            .expect("reply");
        assert_eq!(nameless["error"]["code"], INVALID_PARAMS);
        let numeric_name = handler
            .handle_text(r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":7}}"#)
            .await
            .expect("reply");
        assert_eq!(numeric_name["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn tool_calls_carry_the_full_result_as_text() {
        let handler = handler();
        let reply = handler
            .handle_text(
                r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"session_information","arguments":{}}}"#,
            )
            .await
            .expect("reply");
        assert_eq!(reply["result"]["isError"], false);
        let result = call_text(&reply);
        assert_eq!(result["session_type"], STANDALONE_SESSION_TYPE);

        let failed = handler
            .handle_text(
                r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"set_ndisplay","arguments":{"ndisplay":7}}}"#,
            )
            .await
            .expect("reply");
        assert_eq!(failed["result"]["isError"], true);
        assert_eq!(call_text(&failed)["code"], "invalid_argument");
        handler.dispatcher().shutdown().await;
    }

    #[tokio::test]
    async fn stdio_loop_answers_requests_in_order() {
        let handler = handler();
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n",
        );
        let mut output = Vec::new();
        serve_stdio(&handler, input.as_bytes(), &mut output)
            .await
            .expect("serve");
        let replies = String::from_utf8(output).expect("utf8");
        let replies = replies
            .lines()
            .map(|line| serde_json::from_str::<Value>(line).expect("json line"))
            .collect::<Vec<_>>();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], 1);
        assert_eq!(replies[1]["id"], 2);
    }

    async fn raw_exchange(port: u16, chunks: &[&[u8]]) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        for chunk in chunks {
            stream.write_all(chunk).await.expect("write");
            stream.flush().await.expect("flush");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.expect("read reply");
        String::from_utf8(reply).expect("utf8 reply")
    }

    #[tokio::test]
    async fn http_bodies_may_arrive_in_pieces_and_bad_heads_get_400() {
        let handler = Arc::new(handler());
        let listener = bind_http("127.0.0.1", 0).await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_http(listener, handler.clone(), "/mcp".to_owned(), async move {
            let _ = shutdown_rx.await;
        }));

        let body = r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#;
        let head = format!(
            "POST /mcp/?session=1 HTTP/1.1\r\nHost: localhost\r\ncontent-length: {}\r\n\r\n",
            body.len()
        );
        let (first, rest) = body.as_bytes().split_at(10);
        let reply = raw_exchange(port, &[head.as_bytes(), first, rest]).await;
        assert!(reply.starts_with("HTTP/1.1 200 OK"), "{reply}");
        let (_, payload) = reply.split_once("\r\n\r\n").expect("response head");
        let payload: Value = serde_json::from_str(payload).expect("json payload");
        assert_eq!(payload["id"], 9);
        assert_eq!(payload["result"], json!({}));

        let notification = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let request = format!(
            "POST /mcp HTTP/1.1\r\nContent-Length: {}\r\n\r\n{notification}",
            notification.len()
        );
        let reply = raw_exchange(port, &[request.as_bytes()]).await;
        assert!(reply.starts_with("HTTP/1.1 202 Accepted"), "{reply}");

        let reply = raw_exchange(port, &[b"garbage\r\n\r\n"]).await;
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request"), "{reply}");
        let reply = raw_exchange(port, &[b"POST /mcp HTTP/1.1\r\nContent-Length: lots\r\n\r\n"]).await;
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request"), "{reply}");

        let _ = shutdown_tx.send(());
        server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn standalone_proxies_through_http_bridge() {
        let bridge = Arc::new(McpHandler::new(dispatcher(BRIDGE_SESSION_TYPE, None)));
        let listener = bind_http("127.0.0.1", 0).await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_http(listener, bridge.clone(), "/mcp".to_owned(), async move {
            let _ = shutdown_rx.await;
        }));

        let proxy = ProxyClient::new(
            "127.0.0.1",
            port,
            "/mcp",
            Duration::from_secs(10),
            Duration::from_secs(2),
        )
        .expect("proxy");
        let report = proxy.probe().await.expect("bridge answers probe");
        assert_eq!(report["session_type"], BRIDGE_SESSION_TYPE);

        let client = dispatcher(STANDALONE_SESSION_TYPE, Some(Arc::new(proxy)));
        let added = client
            .dispatch("add_points", json!({ "points": [[1, 2], [3, 4]], "name": "remote" }))
            .await;
        assert_eq!(added["status"], "ok");
        assert_eq!(added["n_points"], 2);
        let listed = client.dispatch("list_layers", Value::Null).await;
        assert_eq!(listed["layers"][0]["name"], "remote");

        let executed = client
            .dispatch("execute_code", json!({ "code": "print(1)\nprint(2)", "line_limit": 1 }))
            .await;
        assert_eq!(executed["status"], "ok");
        assert_eq!(executed["truncated"], true);
        let output_id = executed["output_id"].as_str().expect("output id").to_owned();
        assert!(output_id.starts_with("bridge:"), "{output_id}");
        let full = client
            .dispatch("read_output", json!({ "output_id": output_id }))
            .await;
        assert_eq!(full["status"], "ok");
        assert_eq!(full["total_lines"], 2);
        assert_eq!(full["output_id"], executed["output_id"]);

        let info = client.dispatch("session_information", json!({})).await;
        assert_eq!(info["session"]["event_pump_running"], false);
        assert_eq!(info["session"]["code_executions"], 0);

        let health = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .expect("health")
            .json::<Value>()
            .await
            .expect("health json");
        assert_eq!(health["session_type"], BRIDGE_SESSION_TYPE);
        let missing = reqwest::get(format!("http://127.0.0.1:{port}/nope"))
            .await
            .expect("404");
        assert_eq!(missing.status().as_u16(), 404);

        let _ = shutdown_tx.send(());
        server.await.expect("join").expect("serve");
        bridge.dispatcher().shutdown().await;
    }
}
