use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::capture::DEFAULT_BYTE_BUDGET;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub outputs: OutputsConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_mode")]
    pub mode: ServerMode,
    /// Interface the bridge listens on; the port is shared with `[proxy]`.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: default_server_mode(),
            bind_host: default_bind_host(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    /// MCP over stdio; forwards to a bridge when one is reachable.
    Standalone,
    /// MCP over HTTP at the proxy path; always serves locally.
    Bridge,
}

impl ServerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::Bridge => "bridge",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default = "default_proxy_path")]
    pub path: String,
    #[serde(default = "default_fallback")]
    pub fallback: FallbackPolicy,
    #[serde(default = "default_proxy_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_bind_host(),
            port: default_proxy_port(),
            path: default_proxy_path(),
            fallback: default_fallback(),
            timeout_ms: default_proxy_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// What a proxied call does when the bridge cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    Local,
    Fail,
}

impl FallbackPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_pump_interval_ms")]
    pub pump_interval_ms: u64,
    #[serde(default = "default_transcript_limit")]
    pub transcript_limit: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            batch_timeout_ms: default_batch_timeout_ms(),
            pump_interval_ms: default_pump_interval_ms(),
            transcript_limit: default_transcript_limit(),
        }
    }
}

impl ExecutorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputsConfig {
    /// `<= 0` keeps every output.
    #[serde(default = "default_max_items")]
    pub max_items: i64,
    #[serde(default = "default_line_limit")]
    pub default_line_limit: i64,
}

impl Default for OutputsConfig {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            default_line_limit: default_line_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_byte_budget")]
    pub byte_budget: usize,
    #[serde(default = "default_true")]
    pub restore_position: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            byte_budget: default_byte_budget(),
            restore_position: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerConfig {
    #[serde(default = "default_viewer_title")]
    pub title: String,
    #[serde(default = "default_canvas_px")]
    pub canvas_width: u32,
    #[serde(default = "default_canvas_px")]
    pub canvas_height: u32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            title: default_viewer_title(),
            canvas_width: default_canvas_px(),
            canvas_height: default_canvas_px(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        let mode = cfg.server.mode;
        cfg.set_mode(mode);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(&mut self, port: Option<u16>, no_proxy: bool) {
        if let Some(port) = port {
            self.proxy.port = port;
        }
        if no_proxy {
            self.proxy.enabled = false;
        }
    }

    /// Bridge mode never proxies, or it would forward to itself.
    pub fn set_mode(&mut self, mode: ServerMode) {
        self.server.mode = mode;
        if mode == ServerMode::Bridge {
            self.proxy.enabled = false;
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|key| env::var(key).ok());
    }

    fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("VIEWER_MCP_MODE") {
            if let Some(mode) = parse_server_mode(&v) {
                self.server.mode = mode;
            }
        }
        if let Some(v) = lookup("VIEWER_MCP_BIND_HOST") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.server.bind_host = trimmed.to_owned();
            }
        }
        if let Some(v) = lookup("VIEWER_MCP_PROXY") {
            self.proxy.enabled = parse_bool(&v);
        }
        if let Some(v) = lookup("VIEWER_MCP_BRIDGE_HOST") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.proxy.host = trimmed.to_owned();
            }
        }
        if let Some(v) = lookup("VIEWER_MCP_BRIDGE_PORT") {
            if let Ok(n) = v.trim().parse::<u16>() {
                self.proxy.port = n;
            }
        }
        if let Some(v) = lookup("VIEWER_MCP_FALLBACK") {
            if let Some(policy) = parse_fallback(&v) {
                self.proxy.fallback = policy;
            }
        }
        if let Some(v) = lookup("VIEWER_MCP_PROXY_TIMEOUT_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.proxy.timeout_ms = n.max(100);
            }
        }
        if let Some(v) = lookup("VIEWER_MCP_CALL_TIMEOUT_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.executor.call_timeout_ms = n.max(50);
            }
        }
        if let Some(v) = lookup("VIEWER_MCP_BATCH_TIMEOUT_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.executor.batch_timeout_ms = n.max(50);
            }
        }
        if let Some(v) = lookup("VIEWER_MCP_MAX_OUTPUT_ITEMS") {
            if let Ok(n) = v.trim().parse::<i64>() {
                self.outputs.max_items = n;
            }
        }
        if let Some(v) = lookup("VIEWER_MCP_LINE_LIMIT") {
            if let Ok(n) = v.trim().parse::<i64>() {
                self.outputs.default_line_limit = n;
            }
        }
        if let Some(v) = lookup("VIEWER_MCP_BYTE_BUDGET") {
            if let Ok(n) = v.trim().parse::<usize>() {
                self.capture.byte_budget = n;
            }
        }
        if let Some(v) = lookup("VIEWER_MCP_VIEWER_TITLE") {
            if !v.trim().is_empty() {
                self.viewer.title = v.trim().to_owned();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind_host.trim().is_empty() {
            anyhow::bail!("server.bind_host must not be empty");
        }
        if self.proxy.host.trim().is_empty() {
            anyhow::bail!("proxy.host must not be empty");
        }
        if self.proxy.port == 0 {
            anyhow::bail!("proxy.port must be > 0");
        }
        if !self.proxy.path.starts_with('/') {
            anyhow::bail!("proxy.path must start with '/'");
        }
        if self.proxy.timeout_ms == 0 || self.proxy.probe_timeout_ms == 0 {
            anyhow::bail!("proxy timeouts must be > 0");
        }
        if self.executor.call_timeout_ms == 0 {
            anyhow::bail!("executor.call_timeout_ms must be > 0");
        }
        if self.executor.batch_timeout_ms < self.executor.call_timeout_ms {
            anyhow::bail!("executor.batch_timeout_ms must be >= executor.call_timeout_ms");
        }
        if self.executor.pump_interval_ms == 0 {
            anyhow::bail!("executor.pump_interval_ms must be > 0");
        }
        if self.executor.transcript_limit == 0 {
            anyhow::bail!("executor.transcript_limit must be > 0");
        }
        if self.capture.byte_budget == 0 {
            anyhow::bail!("capture.byte_budget must be > 0");
        }
        if self.viewer.canvas_width == 0 || self.viewer.canvas_height == 0 {
            anyhow::bail!("viewer canvas dimensions must be > 0");
        }
        Ok(())
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_server_mode(s: &str) -> Option<ServerMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "standalone" | "stdio" | "serve" => Some(ServerMode::Standalone),
        "bridge" | "http" => Some(ServerMode::Bridge),
        _ => None,
    }
}

fn parse_fallback(s: &str) -> Option<FallbackPolicy> {
    match s.trim().to_ascii_lowercase().as_str() {
        "local" => Some(FallbackPolicy::Local),
        "fail" | "error" => Some(FallbackPolicy::Fail),
        _ => None,
    }
}

fn default_true() -> bool {
    true
}

fn default_server_mode() -> ServerMode {
    ServerMode::Standalone
}

fn default_bind_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_proxy_port() -> u16 {
    9999
}

fn default_proxy_path() -> String {
    "/mcp".to_owned()
}

fn default_fallback() -> FallbackPolicy {
    FallbackPolicy::Local
}

fn default_proxy_timeout_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    1_500
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_batch_timeout_ms() -> u64 {
    120_000
}

fn default_pump_interval_ms() -> u64 {
    20
}

fn default_transcript_limit() -> usize {
    256
}

fn default_max_items() -> i64 {
    1_000
}

fn default_line_limit() -> i64 {
    30
}

fn default_byte_budget() -> usize {
    DEFAULT_BYTE_BUDGET
}

fn default_viewer_title() -> String {
    "viewer-mcp".to_owned()
}

fn default_canvas_px() -> u32 {
    512
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = toml::from_str::<Config>(
            r#"
            [proxy]
            port = 8123
            fallback = "fail"

            [outputs]
            max_items = -1
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.proxy.port, 8123);
        assert_eq!(cfg.proxy.fallback, FallbackPolicy::Fail);
        assert_eq!(cfg.proxy.path, "/mcp");
        assert_eq!(cfg.outputs.max_items, -1);
        assert_eq!(cfg.outputs.default_line_limit, 30);
        assert_eq!(cfg.capture.byte_budget, 1_309_246);
        assert_eq!(cfg.server.mode, ServerMode::Standalone);
        cfg.validate().expect("valid");
    }

    #[test]
    fn missing_file_loads_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/viewer-mcp.toml")).expect("defaults");
        cfg.validate().expect("valid");
        assert_eq!(cfg.executor.batch_timeout_ms, 120_000);
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let vars = HashMap::from([
            ("VIEWER_MCP_BRIDGE_PORT", "7001"),
            ("VIEWER_MCP_FALLBACK", "FAIL"),
            ("VIEWER_MCP_PROXY", "off"),
            ("VIEWER_MCP_CALL_TIMEOUT_MS", "not-a-number"),
            ("VIEWER_MCP_MODE", "bridge"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env_overrides_from(|key| vars.get(key).map(|v| (*v).to_owned()));
        assert_eq!(cfg.proxy.port, 7001);
        assert_eq!(cfg.proxy.fallback, FallbackPolicy::Fail);
        assert!(!cfg.proxy.enabled);
        assert_eq!(cfg.executor.call_timeout_ms, 5_000);
        assert_eq!(cfg.server.mode, ServerMode::Bridge);
    }

    #[test]
    fn cli_overrides_and_bridge_mode_disable_proxy() {
        let mut cfg = Config::default();
        cfg.apply_cli_overrides(Some(9100), false);
        assert_eq!(cfg.proxy.port, 9100);
        assert!(cfg.proxy.enabled);
        cfg.set_mode(ServerMode::Bridge);
        assert!(!cfg.proxy.enabled);
    }

    #[test]
    fn configured_bridge_mode_disables_proxy_on_load() {
        let path = env::temp_dir().join(format!("viewer-mcp-mode-{}.toml", std::process::id()));
        std::fs::write(&path, "[server]\nmode = \"bridge\"\n[proxy]\nenabled = true\n")
            .expect("write config");
        let cfg = Config::load(&path);
        let _ = std::fs::remove_file(&path);
        let cfg = cfg.expect("load");
        assert_eq!(cfg.server.mode, ServerMode::Bridge);
        assert!(!cfg.proxy.enabled);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.proxy.path = "mcp".to_owned();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.executor.batch_timeout_ms = 10;
        assert!(cfg.validate().is_err());
    }
}
