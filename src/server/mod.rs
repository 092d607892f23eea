pub mod connection;
mod control_channel;
pub mod registry;

pub use connection::ListenerManager;
pub use registry::{ControlSession, ServerChannelRegistry, UserSession};

use crate::config::{ConfigEvent, ProxyMappings, ServerConfig, ServerFullConfig};
use crate::idle::IdleConfig;
use crate::stats::{PortStats, StatsManager};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use control_channel::handle_tunnel_connection;

/// 服务器依赖（用于依赖注入）
pub struct ServerDependencies {
    pub registry: Arc<ServerChannelRegistry>,
    /// 为 `None` 时从配置中的客户端列表构建
    pub mappings: Option<Arc<ProxyMappings>>,
    pub stats_manager: StatsManager,
}

impl ServerDependencies {
    /// 创建默认依赖
    pub fn new() -> Self {
        Self {
            registry: Arc::new(ServerChannelRegistry::new()),
            mappings: None,
            stats_manager: StatsManager::new(),
        }
    }
}

impl Default for ServerDependencies {
    fn default() -> Self {
        Self::new()
    }
}

/// 服务器状态管理（避免过度克隆）
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ServerChannelRegistry>,
    pub mappings: Arc<ProxyMappings>,
    pub stats_manager: StatsManager,
    pub listeners: ListenerManager,
    pub shutdown: CancellationToken,
}

impl ServerState {
    /// 从配置创建状态（使用默认依赖）
    pub fn new(config: ServerFullConfig) -> Self {
        Self::with_dependencies(config, ServerDependencies::new())
    }

    /// 从配置和依赖创建状态
    pub fn with_dependencies(config: ServerFullConfig, deps: ServerDependencies) -> Self {
        let mappings = deps
            .mappings
            .unwrap_or_else(|| Arc::new(ProxyMappings::new(config.clients)));
        Self {
            config: Arc::new(config.server),
            registry: deps.registry,
            mappings,
            stats_manager: deps.stats_manager,
            listeners: ListenerManager::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// 隧道端口连接的空闲检测参数
    pub fn idle_config(&self) -> IdleConfig {
        IdleConfig::from_secs(self.config.read_idle_secs, self.config.write_idle_secs)
    }

    /// 各对外端口的流量统计
    pub fn stats(&self) -> Vec<PortStats> {
        self.stats_manager.get_all_stats()
    }
}

/// 已绑定端口、尚未开始接受连接的服务器
pub struct Server {
    state: Arc<ServerState>,
    listener: TcpListener,
}

impl Server {
    /// 绑定隧道端口与所有对外端口
    pub async fn bind(config: ServerFullConfig) -> Result<Self> {
        Self::bind_with_dependencies(config, ServerDependencies::new()).await
    }

    /// 绑定端口（带自定义依赖，用于测试）
    pub async fn bind_with_dependencies(
        config: ServerFullConfig,
        deps: ServerDependencies,
    ) -> Result<Self> {
        let state = Arc::new(ServerState::with_dependencies(config, deps));
        let listener = TcpListener::bind((state.config.bind_addr.as_str(), state.config.bind_port))
            .await
            .with_context(|| {
                format!(
                    "Failed to bind tunnel port {}:{}",
                    state.config.bind_addr, state.config.bind_port
                )
            })?;

        info!(
            "Tunnel port listening on {}:{}",
            state.config.bind_addr, state.config.bind_port
        );

        spawn_config_watcher(state.clone());
        state.listeners.sync(&state).await;

        Ok(Self { state, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// 触发关闭的句柄
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// 停止接受连接并关闭所有会话
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }

    /// 接受隧道连接，直到关闭
    pub async fn run(self) -> Result<()> {
        let Server { state, listener } = self;

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted tunnel connection from {}", peer_addr);
                        tokio::spawn(handle_tunnel_connection(state.clone(), stream, peer_addr));
                    }
                    Err(e) => {
                        error!("Failed to accept tunnel connection: {}", e);
                    }
                },
            }
        }

        info!("Stopping server, closing all sessions");
        state.registry.clear();
        info!("Server stopped gracefully");
        Ok(())
    }
}

/// 运行服务器，Ctrl+C 时关闭
pub async fn run_server(config: ServerFullConfig) -> Result<()> {
    let server = Server::bind(config).await?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, stopping server...");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    info!("Waiting for client connections... (Press Ctrl+C to stop)");
    server.run().await
}

/// 配置变化时补绑新增的对外端口
fn spawn_config_watcher(state: Arc<ServerState>) {
    let mut events = state.mappings.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = state.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ConfigEvent::Changed) | Err(RecvError::Lagged(_)) => {
                    info!("Proxy mappings changed, syncing user listeners");
                    state.listeners.sync(&state).await;
                }
                Ok(ConfigEvent::ClientDiscovered { client_key }) => {
                    debug!("Client '{}' recorded as unregistered", client_key);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
