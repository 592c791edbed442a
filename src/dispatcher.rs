use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::capture::{self, BatchCaptureSpec};
use crate::config::{Config, FallbackPolicy};
use crate::executor::MainContextExecutor;
use crate::output_store::{truncate_output, OutputStore, UNLIMITED_WARNING};
use crate::proxy::RemoteTools;
use crate::pump::{EventPump, PumpStart};
use crate::script::{CodeExecutionEngine, ENGINE_NAME};
use crate::session::{ResourceHandle, SessionContext};
use crate::tools::{self, normalize_request, ToolSpec};
use crate::types::{
    first_bool_arg, first_i64_arg, first_string_arg, normalize_params, now_ms, result_status,
    ToolError, ToolErrorCode, ToolOutcome, ToolRequest,
};
use crate::viewer::{layer_type_counts, Layer, Viewer};

pub const STANDALONE_SESSION_TYPE: &str = "viewer_mcp_standalone_session";

const RECENT_CALLS_REPORTED: usize = 10;

/// Marks output ids handed out by a remote bridge; `read_output` sends
/// these back to the bridge that stores the output.
const REMOTE_OUTPUT_PREFIX: &str = "bridge:";

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub session_type: &'static str,
    pub fallback: FallbackPolicy,
    pub batch_timeout: Duration,
    pub pump_interval: Duration,
    pub transcript_limit: usize,
    pub default_line_limit: i64,
    pub byte_budget: usize,
    pub restore_position: bool,
}

impl DispatcherSettings {
    pub fn from_config(config: &Config, session_type: &'static str) -> Self {
        Self {
            session_type,
            fallback: config.proxy.fallback,
            batch_timeout: config.executor.batch_timeout(),
            pump_interval: config.executor.pump_interval(),
            transcript_limit: config.executor.transcript_limit,
            default_line_limit: config.outputs.default_line_limit,
            byte_budget: config.capture.byte_budget,
            restore_position: config.capture.restore_position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub tool: String,
    pub route: Route,
    pub status: String,
    pub duration_ms: u64,
    pub at_ms: u64,
}

/// Entry point for every tool call: forwards proxyable tools to a remote
/// bridge when one answers, otherwise runs them against the local session.
pub struct Dispatcher {
    session: Arc<SessionContext>,
    executor: Arc<MainContextExecutor>,
    outputs: OutputStore,
    engine: Arc<Mutex<CodeExecutionEngine>>,
    code_executions: AtomicU64,
    remote: Option<Arc<dyn RemoteTools>>,
    pump: EventPump,
    settings: DispatcherSettings,
    transcript: Mutex<VecDeque<TranscriptEntry>>,
    started: Instant,
}

impl Dispatcher {
    pub fn new(
        session: Arc<SessionContext>,
        executor: Arc<MainContextExecutor>,
        outputs: OutputStore,
        remote: Option<Arc<dyn RemoteTools>>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            session,
            executor,
            outputs,
            engine: Arc::new(Mutex::new(CodeExecutionEngine::new())),
            code_executions: AtomicU64::new(0),
            remote,
            pump: EventPump::new(settings.pump_interval),
            settings,
            transcript: Mutex::new(VecDeque::new()),
            started: Instant::now(),
        }
    }

    pub fn session_type(&self) -> &'static str {
        self.settings.session_type
    }

    pub async fn dispatch(&self, name: &str, params: Value) -> Value {
        self.dispatch_request(ToolRequest::new(name, params)).await
    }

    /// Always produces exactly one ToolResult.
    pub async fn dispatch_request(&self, request: ToolRequest) -> Value {
        let started = Instant::now();
        let ToolRequest { name, params } = normalize_request(request);
        let (route, result) = self.route(&name, params).await;
        let status = result_status(&result).to_owned();
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!("tool {name} -> {status} via {route:?} in {duration_ms}ms");
        self.record_transcript(TranscriptEntry {
            tool: name,
            route,
            status,
            duration_ms,
            at_ms: now_ms(),
        });
        result
    }

    async fn route(&self, name: &str, params: Value) -> (Route, Value) {
        let params = match normalize_params(params) {
            Ok(map) => Value::Object(map),
            Err(err) => return (Route::Local, err.into_result()),
        };
        let Some(spec) = tools::find(name) else {
            let err = ToolError::new(
                ToolErrorCode::UnsupportedTool,
                format!("unknown tool '{name}'"),
            );
            return (Route::Local, err.into_result());
        };

        if spec.name == "read_output" {
            if let Some(remote_id) = remote_output_id(&params) {
                return self.read_remote_output(remote_id, params).await;
            }
        }

        if spec.proxied {
            if let Some(remote) = &self.remote {
                match remote.call(name, &params).await {
                    Ok(result) if spec.name == "execute_code" => {
                        return (Route::Remote, tag_remote_output(result))
                    }
                    Ok(result) => return (Route::Remote, result),
                    Err(err) => match self.settings.fallback {
                        FallbackPolicy::Local => {
                            debug!("remote unavailable for {name} ({err}); serving locally");
                        }
                        FallbackPolicy::Fail => {
                            let err = ToolError::new(
                                ToolErrorCode::TransportUnavailable,
                                err.to_string(),
                            );
                            return (Route::Remote, err.into_result());
                        }
                    },
                }
            }
        }

        let result = self
            .call_local(spec, &params)
            .await
            .unwrap_or_else(ToolError::into_result);
        (Route::Local, result)
    }

    async fn read_remote_output(&self, remote_id: String, mut params: Value) -> (Route, Value) {
        let Some(remote) = &self.remote else {
            let err = ToolError::new(
                ToolErrorCode::NotFound,
                format!("Output ID '{REMOTE_OUTPUT_PREFIX}{remote_id}' not found"),
            );
            return (Route::Local, err.into_result());
        };
        params["output_id"] = json!(remote_id);
        match remote.call("read_output", &params).await {
            Ok(result) => (Route::Remote, tag_remote_output(result)),
            Err(err) => {
                let err = ToolError::new(
                    ToolErrorCode::TransportUnavailable,
                    format!("output is stored by the viewer bridge, which is unreachable: {err}"),
                );
                (Route::Remote, err.into_result())
            }
        }
    }

    async fn call_local(&self, spec: &ToolSpec, params: &Value) -> ToolOutcome<Value> {
        match spec.name {
            "detect_viewers" => Ok(self.detect_viewers().await),
            "init_viewer" => self.init_viewer(params).await,
            "close_viewer" => self.close_viewer().await,
            "session_information" => self.session_information().await,
            "execute_code" => self.execute_code(params).await,
            "read_output" => self.read_output(params).await,
            "timelapse_screenshot" => self.timelapse_screenshot(params).await,
            name => {
                let name = name.to_owned();
                let params = params.clone();
                self.with_viewer(self.executor.call_timeout(), move |viewer| {
                    tools::apply(viewer, &name, &params)
                })
                .await
            }
        }
    }

    /// Runs `op` against the live viewer on the viewer thread, creating the
    /// viewer first when needed.
    async fn with_viewer<T, F>(&self, timeout: Duration, op: F) -> ToolOutcome<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Viewer) -> ToolOutcome<T> + Send + 'static,
    {
        let session = self.session.clone();
        let (value, created) = self
            .executor
            .run_with_timeout(timeout, move || {
                let (handle, created) = ensure_live(&session, None)?;
                let value = handle.with(op)??;
                Ok::<_, ToolError>((value, created))
            })
            .await??;
        if created {
            self.start_pump();
        }
        Ok(value)
    }

    fn start_pump(&self) -> PumpStart {
        self.pump.start(self.session.clone(), self.executor.clone())
    }

    async fn detect_viewers(&self) -> Value {
        let external = match &self.remote {
            Some(remote) => match remote.probe().await {
                Some(report) => json!({
                    "available": true,
                    "endpoint": remote.endpoint(),
                    "session": report,
                }),
                None => json!({ "available": false, "endpoint": remote.endpoint() }),
            },
            None => json!({ "available": false, "reason": "proxy disabled" }),
        };
        let preference = if external["available"] == true {
            "external"
        } else {
            "local"
        };
        json!({
            "status": "ok",
            "viewers": {
                "local": {
                    "available": true,
                    "backend": "headless",
                    "session": self.session.describe(),
                },
                "external": external,
            },
            "auto_detect": self.remote.is_some(),
            "preference": preference,
        })
    }

    async fn init_viewer(&self, params: &Value) -> ToolOutcome<Value> {
        if let Some(remote) = &self.remote {
            if let Some(report) = remote.probe().await {
                info!("using external viewer bridge at {}", remote.endpoint());
                return Ok(json!({
                    "status": "ok",
                    "viewer_type": "external",
                    "endpoint": remote.endpoint(),
                    "session": report,
                }));
            }
        }

        let title = first_string_arg(params, &["title"]);
        let width = first_i64_arg(params, &["width"])?;
        let height = first_i64_arg(params, &["height"])?;
        let canvas = match (width, height) {
            (None, None) => None,
            (width, height) => {
                let width = canvas_dim(width, "width")?;
                let height = canvas_dim(height, "height")?;
                Some((width, height))
            }
        };

        let session = self.session.clone();
        let (summary, created, generation) = self
            .executor
            .run(move || {
                let (handle, created) = ensure_live(&session, title.as_deref())?;
                let summary = handle.with(|viewer| {
                    let model = viewer.model_mut();
                    if let Some(title) = title {
                        model.title = title;
                    }
                    if let Some((width, height)) = canvas {
                        let (current_width, current_height) = model.canvas_size;
                        model.canvas_size = (
                            width.unwrap_or(current_width),
                            height.unwrap_or(current_height),
                        );
                    }
                    viewer.show();
                    viewer.model().summary()
                })?;
                Ok::<_, ToolError>((summary, created, handle.generation()))
            })
            .await??;
        let pump = match self.start_pump() {
            PumpStart::Started => "started",
            PumpStart::AlreadyRunning => "already_running",
        };
        Ok(json!({
            "status": "ok",
            "viewer_type": "local",
            "created": created,
            "generation": generation,
            "event_pump": pump,
            "viewer": summary,
        }))
    }

    async fn close_viewer(&self) -> ToolOutcome<Value> {
        let session = self.session.clone();
        let closed = self.executor.run(move || session.close()).await??;
        self.pump.stop().await;
        if closed {
            info!("viewer closed");
            Ok(json!({ "status": "closed", "message": "Viewer closed" }))
        } else {
            Ok(json!({ "status": "no_viewer", "message": "No viewer to close" }))
        }
    }

    /// Reports on the session without creating a viewer.
    async fn session_information(&self) -> ToolOutcome<Value> {
        let session = self.session.clone();
        let viewer = self
            .executor
            .run(move || {
                session
                    .current()
                    .map(|handle| handle.with(|viewer| describe_viewer(viewer)))
                    .transpose()
            })
            .await??;
        let (viewer, layers) = match viewer {
            Some((summary, layers)) => (summary, layers),
            None => (Value::Null, Vec::new()),
        };

        let executions = self.code_executions.load(Ordering::Relaxed);
        let recent_calls = self
            .recent_calls()
            .into_iter()
            .rev()
            .take(RECENT_CALLS_REPORTED)
            .collect::<Vec<_>>();
        let proxy = match &self.remote {
            Some(remote) => json!({
                "enabled": true,
                "endpoint": remote.endpoint(),
                "fallback": self.settings.fallback.as_str(),
            }),
            None => json!({ "enabled": false }),
        };

        Ok(json!({
            "status": "ok",
            "session_type": self.settings.session_type,
            "viewer": viewer,
            "layers": layers,
            "system": {
                "version": env!("CARGO_PKG_VERSION"),
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "pid": std::process::id(),
                "uptime_ms": self.started.elapsed().as_millis() as u64,
                "script_engine": ENGINE_NAME,
            },
            "session": {
                "lifecycle": self.session.describe(),
                "event_pump_running": self.pump.is_running(),
                "code_executions": executions,
                "stored_outputs": self.outputs.len().await,
                "output_capacity": self.outputs.capacity(),
                "proxy": proxy,
            },
            "recent_calls": recent_calls,
        }))
    }

    async fn execute_code(&self, params: &Value) -> ToolOutcome<Value> {
        let source = params
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid("missing required parameter `code`"))?
            .to_owned();
        let line_limit =
            first_i64_arg(params, &["line_limit"])?.unwrap_or(self.settings.default_line_limit);

        self.code_executions.fetch_add(1, Ordering::Relaxed);
        let engine = self.engine.clone();
        let outcome = self
            .with_viewer_handle(move |handle| {
                let mut engine = engine.lock().map_err(|_| {
                    ToolError::new(ToolErrorCode::Internal, "script engine lock poisoned")
                })?;
                Ok(engine.execute(&source, Some(&handle)))
            })
            .await?;

        let mut metadata = Map::new();
        metadata.insert("status".to_owned(), json!(outcome.status()));
        metadata.insert("line_limit".to_owned(), json!(line_limit));
        let output_id = self
            .outputs
            .store(
                "execute_code",
                &outcome.stdout,
                &outcome.stderr,
                outcome.result_repr.clone(),
                metadata,
            )
            .await;

        let mut result = json!({
            "status": outcome.status(),
            "output_id": output_id,
        });
        if let Some(repr) = &outcome.result_repr {
            result["result_repr"] = json!(repr);
        }
        let mut notes = Vec::new();
        if let Some(error) = &outcome.error {
            result["code"] = json!(ToolErrorCode::ExecutionError.as_str());
            notes.push(format!("Code execution failed: {error}."));
        }
        if line_limit < 0 {
            result["stdout"] = json!(outcome.stdout);
            result["stderr"] = json!(outcome.stderr);
            result["warning"] = json!(UNLIMITED_WARNING);
        } else {
            let (stdout, stdout_cut) = truncate_output(&outcome.stdout, line_limit);
            let (stderr, stderr_cut) = truncate_output(&outcome.stderr, line_limit);
            result["stdout"] = json!(stdout);
            result["stderr"] = json!(stderr);
            if stdout_cut || stderr_cut {
                result["truncated"] = json!(true);
                notes.push(format!(
                    "Output truncated to {line_limit} lines. Use read_output('{output_id}') to retrieve the full output."
                ));
            }
        }
        if !notes.is_empty() {
            result["message"] = json!(notes.join(" "));
        }
        Ok(result)
    }

    /// Like [`Self::with_viewer`] but hands out the handle itself, for code
    /// that re-enters the viewer through it.
    async fn with_viewer_handle<T, F>(&self, op: F) -> ToolOutcome<T>
    where
        T: Send + 'static,
        F: FnOnce(ResourceHandle) -> ToolOutcome<T> + Send + 'static,
    {
        let session = self.session.clone();
        let (value, created) = self
            .executor
            .run(move || {
                let (handle, created) = ensure_live(&session, None)?;
                Ok::<_, ToolError>((op(handle)?, created))
            })
            .await??;
        if created {
            self.start_pump();
        }
        Ok(value)
    }

    async fn read_output(&self, params: &Value) -> ToolOutcome<Value> {
        let output_id = match params.get("output_id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_owned(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(ToolError::invalid("missing required parameter `output_id`")),
        };
        let start = first_i64_arg(params, &["start"])?.unwrap_or(0);
        let end = first_i64_arg(params, &["end"])?.unwrap_or(-1);
        self.outputs.read(&output_id, start, end).await
    }

    async fn timelapse_screenshot(&self, params: &Value) -> ToolOutcome<Value> {
        let axis = first_i64_arg(params, &["axis"])?
            .ok_or_else(|| ToolError::invalid("missing required parameter `axis`"))?;
        let range = first_string_arg(params, &["slice_range", "range"]).unwrap_or_else(|| ":".to_owned());
        let canvas_only = first_bool_arg(params, &["canvas_only"])?.unwrap_or(true);
        let interpolate = first_bool_arg(params, &["interpolate_to_fit"])?;
        let restore_position =
            first_bool_arg(params, &["restore_position"])?.unwrap_or(self.settings.restore_position);
        let explicit_budget = match first_i64_arg(params, &["byte_budget"])? {
            Some(budget) if budget <= 0 => {
                return Err(ToolError::invalid("byte_budget must be positive"))
            }
            Some(budget) => Some(budget as usize),
            None => None,
        };
        // Fitting is opt-in: `interpolate_to_fit: true` or an explicit budget.
        let byte_budget = match (interpolate, explicit_budget) {
            (Some(false), _) => None,
            (Some(true), budget) => Some(budget.unwrap_or(self.settings.byte_budget)),
            (None, budget) => budget,
        };
        let spec = BatchCaptureSpec {
            axis,
            range,
            byte_budget,
            canvas_only,
            restore_position,
        };
        let budget = spec.byte_budget;
        self.with_viewer(self.settings.batch_timeout, move |viewer| {
            capture::capture(viewer, &spec).map(|batch| batch.to_result(budget))
        })
        .await
    }

    fn record_transcript(&self, entry: TranscriptEntry) {
        let Ok(mut transcript) = self.transcript.lock() else {
            warn!("dispatch transcript lock poisoned");
            return;
        };
        transcript.push_back(entry);
        while transcript.len() > self.settings.transcript_limit {
            transcript.pop_front();
        }
    }

    pub fn recent_calls(&self) -> Vec<TranscriptEntry> {
        self.transcript
            .lock()
            .map(|transcript| transcript.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stops the pump and closes any local viewer.
    pub async fn shutdown(&self) {
        self.pump.stop().await;
        let session = self.session.clone();
        match self.executor.run(move || session.close()).await {
            Ok(Ok(true)) => info!("viewer closed on shutdown"),
            Ok(Ok(false)) => {}
            Ok(Err(err)) => warn!("closing viewer on shutdown failed: {err}"),
            Err(err) => warn!("closing viewer on shutdown failed: {err}"),
        }
    }
}

fn output_id_of(result: &Value) -> Option<String> {
    match result.get("output_id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Namespaces a bridge-issued output id, including the hint in `message`.
fn tag_remote_output(mut result: Value) -> Value {
    let Some(id) = output_id_of(&result) else {
        return result;
    };
    let tagged = format!("{REMOTE_OUTPUT_PREFIX}{id}");
    if let Some(message) = result.get("message").and_then(Value::as_str) {
        let message = message.replace(
            &format!("read_output('{id}')"),
            &format!("read_output('{tagged}')"),
        );
        result["message"] = json!(message);
    }
    result["output_id"] = json!(tagged);
    result
}

fn remote_output_id(params: &Value) -> Option<String> {
    params
        .get("output_id")
        .and_then(Value::as_str)
        .and_then(|id| id.trim().strip_prefix(REMOTE_OUTPUT_PREFIX))
        .map(str::to_owned)
}

/// Ensures a viewer exists; newly created viewers are shown.
fn ensure_live(session: &SessionContext, title: Option<&str>) -> ToolOutcome<(ResourceHandle, bool)> {
    let (handle, created) = session.ensure(title)?;
    if created {
        handle.with(|viewer| viewer.show())?;
    }
    Ok((handle, created))
}

fn describe_viewer(viewer: &mut dyn Viewer) -> (Value, Vec<Value>) {
    let model = viewer.model();
    let mut summary = model.summary();
    summary["layer_types"] = json!(layer_type_counts(model));
    summary["window"] = viewer.window_info();
    let layers = model.layers.iter().map(Layer::describe).collect();
    (summary, layers)
}

fn canvas_dim(value: Option<i64>, label: &str) -> ToolOutcome<Option<u32>> {
    match value {
        None => Ok(None),
        Some(px) if (16..=8192).contains(&px) => Ok(Some(px as u32)),
        Some(_) => Err(ToolError::invalid(format!(
            "{label} must be between 16 and 8192 pixels"
        ))),
    }
}
