use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::info;

use crate::config::{Config, ServerMode};
use crate::dispatcher::{Dispatcher, DispatcherSettings, STANDALONE_SESSION_TYPE};
use crate::executor::MainContextExecutor;
use crate::mcp_server::{self, McpHandler};
use crate::output_store::OutputStore;
use crate::proxy::{ProxyClient, RemoteTools, BRIDGE_SESSION_TYPE};
use crate::session::SessionContext;
use crate::viewer::HeadlessViewerFactory;

pub struct ServerRuntime {
    config: Config,
    handler: Arc<McpHandler>,
}

impl ServerRuntime {
    pub fn new(config: Config) -> Result<Self> {
        let dispatcher = Arc::new(build_dispatcher(&config)?);
        Ok(Self {
            config,
            handler: Arc::new(McpHandler::new(dispatcher)),
        })
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "starting viewer MCP server (mode={}, proxy={}, bridge={}:{}{}, fallback={}, call_timeout_ms={}, max_outputs={})",
            self.config.server.mode.as_str(),
            self.config.proxy.enabled,
            self.config.proxy.host,
            self.config.proxy.port,
            self.config.proxy.path,
            self.config.proxy.fallback.as_str(),
            self.config.executor.call_timeout_ms,
            self.config.outputs.max_items
        );

        let result = match self.config.server.mode {
            ServerMode::Standalone => {
                tokio::select! {
                    res = mcp_server::serve_stdio(&self.handler, tokio::io::stdin(), tokio::io::stdout()) => res,
                    _ = signal::ctrl_c() => {
                        info!("received ctrl-c, shutting down");
                        Ok(())
                    }
                }
            }
            ServerMode::Bridge => {
                let listener =
                    mcp_server::bind_http(&self.config.server.bind_host, self.config.proxy.port)
                        .await?;
                mcp_server::serve_http(
                    listener,
                    self.handler.clone(),
                    self.config.proxy.path.clone(),
                    async {
                        let _ = signal::ctrl_c().await;
                        info!("received ctrl-c, shutting down");
                    },
                )
                .await
            }
        };
        self.handler.dispatcher().shutdown().await;
        result
    }
}

/// Wires the session, executor, output store and optional bridge client
/// into one dispatcher.
pub fn build_dispatcher(config: &Config) -> Result<Dispatcher> {
    let factory = Arc::new(HeadlessViewerFactory::new((
        config.viewer.canvas_width,
        config.viewer.canvas_height,
    )));
    let session = Arc::new(SessionContext::new(factory, config.viewer.title.clone()));
    let executor = Arc::new(MainContextExecutor::spawn(
        "viewer-main",
        config.executor.call_timeout(),
    )?);
    let outputs = OutputStore::new(config.outputs.max_items);

    let remote: Option<Arc<dyn RemoteTools>> = if config.proxy.enabled {
        Some(Arc::new(ProxyClient::new(
            &config.proxy.host,
            config.proxy.port,
            &config.proxy.path,
            std::time::Duration::from_millis(config.proxy.timeout_ms),
            std::time::Duration::from_millis(config.proxy.probe_timeout_ms),
        )?))
    } else {
        None
    };

    let session_type = match config.server.mode {
        ServerMode::Standalone => STANDALONE_SESSION_TYPE,
        ServerMode::Bridge => BRIDGE_SESSION_TYPE,
    };
    Ok(Dispatcher::new(
        session,
        executor,
        outputs,
        remote,
        DispatcherSettings::from_config(config, session_type),
    ))
}
