mod capture;
mod config;
mod dispatcher;
mod executor;
mod mcp_server;
mod output_store;
mod proxy;
mod pump;
mod runtime;
mod script;
mod session;
mod tools;
mod types;
mod viewer;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{Config, ServerMode};
use proxy::{ProxyClient, RemoteTools};
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "MCP server exposing a scriptable image viewer")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "VIEWER_MCP_CONFIG",
        default_value = "viewer-mcp.toml"
    )]
    config: PathBuf,

    /// Override the bridge port (used for both proxying and bridge mode).
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Never forward tool calls to a running bridge.
    #[arg(long, global = true)]
    no_proxy: bool,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "VIEWER_MCP_LOG", default_value = "info")]
    log: String,

    /// Without a subcommand the server runs in the configured `server.mode`
    /// (`VIEWER_MCP_MODE`).
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Serve MCP over stdio.
    Serve,
    /// Serve MCP over HTTP so other processes can drive this viewer.
    Bridge,
    /// Run a single tool call and print its result.
    Call(CallArgs),
    /// Print the tool catalog.
    Tools,
    /// Run non-interactive diagnostics.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Args)]
struct CallArgs {
    /// Tool name, e.g. list_layers.
    tool: String,
    /// Tool parameters as a JSON object.
    #[arg(long, default_value = "{}")]
    params: String,
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    id: &'static str,
    status: CheckStatus,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Only `fail` checks make the report unhealthy.
#[derive(Debug, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    fn new() -> Self {
        Self {
            ok: true,
            checks: Vec::new(),
        }
    }

    fn record(
        &mut self,
        id: &'static str,
        status: CheckStatus,
        message: impl Into<String>,
        detail: Option<String>,
    ) {
        self.ok &= status != CheckStatus::Fail;
        self.checks.push(DoctorCheck {
            id,
            status,
            message: message.into(),
            detail,
        });
    }
}

impl fmt::Display for DoctorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.ok { "healthy" } else { "blocking issues found" };
        writeln!(f, "viewer-mcp doctor: {verdict}")?;
        for check in &self.checks {
            let marker = match check.status {
                CheckStatus::Pass => "ok",
                CheckStatus::Warn => "warn",
                CheckStatus::Fail => "FAIL",
            };
            writeln!(f, "  {marker:<4}  {:<14} {}", check.id, check.message)?;
            if let Some(detail) = &check.detail {
                writeln!(f, "        {detail}")?;
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    match cli.command.clone() {
        None => run_server(&cli, None).await,
        Some(CliCommand::Serve) => run_server(&cli, Some(ServerMode::Standalone)).await,
        Some(CliCommand::Bridge) => run_server(&cli, Some(ServerMode::Bridge)).await,
        Some(CliCommand::Call(args)) => run_call(&cli, args).await,
        Some(CliCommand::Tools) => {
            print_json_value(&Value::Array(mcp_server::tool_listing()));
            Ok(())
        }
        Some(CliCommand::Doctor(args)) => run_doctor(&cli, args).await,
    }
}

/// `mode` comes from an explicit subcommand; `None` keeps the configured one.
fn load_config(cli: &Cli, mode: Option<ServerMode>) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.port, cli.no_proxy);
    if let Some(mode) = mode {
        cfg.set_mode(mode);
    }
    cfg.validate()?;
    Ok(cfg)
}

async fn run_server(cli: &Cli, mode: Option<ServerMode>) -> Result<()> {
    let cfg = load_config(cli, mode)?;
    let runtime = runtime::ServerRuntime::new(cfg)?;
    runtime.run().await
}

async fn run_call(cli: &Cli, args: CallArgs) -> Result<()> {
    let params = parse_call_params(&args.params)?;
    let cfg = load_config(cli, Some(ServerMode::Standalone))?;
    let dispatcher = runtime::build_dispatcher(&cfg)?;
    let result = dispatcher.dispatch(&args.tool, params).await;
    dispatcher.shutdown().await;
    print_json_value(&result);
    if result.get("status").and_then(Value::as_str) == Some("error") {
        return Err(anyhow!("tool '{}' reported an error", args.tool));
    }
    Ok(())
}

fn parse_call_params(raw: &str) -> Result<Value> {
    let params: Value =
        serde_json::from_str(raw).with_context(|| format!("--params is not valid JSON: {raw}"))?;
    if !params.is_object() {
        return Err(anyhow!("--params must be a JSON object"));
    }
    Ok(params)
}

async fn run_doctor(cli: &Cli, args: DoctorArgs) -> Result<()> {
    let config_result = load_config(cli, Some(ServerMode::Standalone)).map_err(|err| format!("{err:#}"));
    let bridge = match config_result.as_ref() {
        Ok(cfg) if cfg.proxy.enabled => Some(probe_bridge(cfg).await),
        _ => None,
    };
    let report = build_doctor_report(config_result, &cli.config, bridge);
    if args.json {
        print_json_value(&serde_json::to_value(&report).context("failed encoding doctor report")?);
    } else {
        print!("{report}");
    }
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

async fn probe_bridge(cfg: &Config) -> Option<Value> {
    let client = ProxyClient::new(
        &cfg.proxy.host,
        cfg.proxy.port,
        &cfg.proxy.path,
        Duration::from_millis(cfg.proxy.timeout_ms),
        Duration::from_millis(cfg.proxy.probe_timeout_ms),
    )
    .ok()?;
    client.probe().await
}

/// `bridge` is `None` when proxying is disabled, `Some(None)` when no
/// bridge answered.
fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
    bridge: Option<Option<Value>>,
) -> DoctorReport {
    let mut report = DoctorReport::new();

    match config_result {
        Ok(cfg) => {
            report.record(
                "config.load",
                CheckStatus::Pass,
                format!("loaded {}", config_path.display()),
                None,
            );
            report.record(
                "proxy.fallback",
                CheckStatus::Pass,
                cfg.proxy.fallback.as_str(),
                Some(format!(
                    "bridge endpoint http://{}:{}{}",
                    cfg.proxy.host, cfg.proxy.port, cfg.proxy.path
                )),
            );
        }
        Err(err) => report.record(
            "config.load",
            CheckStatus::Fail,
            format!("failed to load {}", config_path.display()),
            Some(err),
        ),
    }

    match bridge {
        None => report.record("proxy.bridge", CheckStatus::Pass, "proxying disabled", None),
        Some(Some(_)) => report.record(
            "proxy.bridge",
            CheckStatus::Pass,
            "bridge is reachable",
            Some("proxyable tools will run in the bridge viewer".to_owned()),
        ),
        Some(None) => report.record(
            "proxy.bridge",
            CheckStatus::Warn,
            "bridge is not reachable",
            Some("tools will run in a local viewer".to_owned()),
        ),
    }
    report
}

fn print_json_value(value: &Value) {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    println!("{rendered}");
}

/// Logs go to stderr; stdout carries the MCP stream.
fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
