mod config;
mod connection;
mod control_channel;
pub mod registry;

pub use config::{get_reconnect_delay, ENV_PREFIX};
pub use registry::{ClientChannelRegistry, LinkConnector, DEFAULT_POOL_CAPACITY};

use crate::channel::{self, Channel, ChannelOptions};
use crate::codec::ProxyMessageCodec;
use crate::config::ClientConfig;
use crate::idle::IdleConfig;
use crate::net::{connect_tcp, DEFAULT_CONNECT_TIMEOUT};
use crate::protocol::ProxyMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use control_channel::{serve_channel, ClientChannelEngine};

/// 新建到服务器隧道端口的 TCP 连接作为隧道连接
struct TcpLinkConnector {
    endpoint: String,
    registry: Arc<ClientChannelRegistry>,
    idle: IdleConfig,
    shutdown: CancellationToken,
}

#[async_trait]
impl LinkConnector for TcpLinkConnector {
    async fn connect(&self) -> crate::error::Result<Channel<ProxyMessage>> {
        let stream = connect_tcp(&self.endpoint, DEFAULT_CONNECT_TIMEOUT).await?;
        let (link, pump) = channel::open::<_, _, ProxyMessage>(
            stream,
            ProxyMessageCodec::new(),
            ChannelOptions::default(),
        );
        debug!("Link {} connected to {}", link.id(), self.endpoint);

        tokio::spawn(serve_channel(
            ClientChannelEngine::link(self.registry.clone(), link.clone()),
            pump,
            self.idle,
            self.shutdown.clone(),
        ));
        Ok(link)
    }
}

/// 客户端代理
pub struct Client {
    config: Arc<ClientConfig>,
    registry: Arc<ClientChannelRegistry>,
    connector: Arc<TcpLinkConnector>,
    shutdown: CancellationToken,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let registry = Arc::new(ClientChannelRegistry::new(config.pool_capacity));
        let shutdown = CancellationToken::new();
        let connector = Arc::new(TcpLinkConnector {
            endpoint: config.server_endpoint(),
            registry: registry.clone(),
            idle: config::idle_config(&config),
            shutdown: shutdown.clone(),
        });
        Self {
            config: Arc::new(config),
            registry,
            connector,
            shutdown,
        }
    }

    pub fn registry(&self) -> Arc<ClientChannelRegistry> {
        self.registry.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 关闭控制连接与空闲池，`run` 随之返回
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// 运行客户端（带自动重连），直到关闭
    pub async fn run(&self) -> Result<()> {
        loop {
            info!(
                "Connecting to {} as '{}'...",
                self.config.server_endpoint(),
                self.config.client_key
            );

            match self.run_session().await {
                Ok(()) => info!("Control session ended"),
                Err(e) => error!("Control session error: {:#}", e),
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            let delay = config::reconnect_delay(&self.config);
            warn!("Connection lost, reconnecting in {} seconds...", delay.as_secs());
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.registry.close_idle_links();
        self.registry.clear_backends();
        info!("Client stopped");
        Ok(())
    }

    /// 运行单次控制会话
    async fn run_session(&self) -> Result<()> {
        let endpoint = self.config.server_endpoint();
        let stream = connect_tcp(&endpoint, DEFAULT_CONNECT_TIMEOUT)
            .await
            .with_context(|| format!("Failed to connect to server {}", endpoint))?;

        let (control, pump) = channel::open::<_, _, ProxyMessage>(
            stream,
            ProxyMessageCodec::new(),
            ChannelOptions::default(),
        );
        control.send(ProxyMessage::auth(self.config.client_key.as_str()));
        self.registry.set_control_channel(control.clone());
        info!(
            "Control channel {} connected to {}, sent AUTH",
            control.id(),
            endpoint
        );

        let connector: Arc<dyn LinkConnector> = self.connector.clone();
        serve_channel(
            ClientChannelEngine::control(
                self.registry.clone(),
                control,
                self.config.client_key.as_str(),
                connector,
            ),
            pump,
            config::idle_config(&self.config),
            self.shutdown.clone(),
        )
        .await;
        Ok(())
    }
}

/// 运行客户端，Ctrl+C 时退出
pub async fn run_client(config: ClientConfig) -> Result<()> {
    let client = Client::new(config);
    let shutdown = client.shutdown_token();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, stopping client...");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    client.run().await
}
