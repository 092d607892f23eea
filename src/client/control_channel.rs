use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, ReadHalf};
use tokio_util::codec::BytesCodec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::run_backend;
use super::registry::{ClientChannelRegistry, LinkConnector};
use crate::channel::{self, Channel, ChannelOptions, Pump, ReadEvent};
use crate::codec::ProxyMessageCodec;
use crate::error::{Result, TunnelError};
use crate::idle::{IdleCheck, IdleConfig, IdleEvent};
use crate::net::{connect_tcp, DEFAULT_CONNECT_TIMEOUT};
use crate::pairing::Pairing;
use crate::protocol::{MessageType, ProxyMessage};

/// 连接在客户端侧承担的角色
pub(crate) enum ChannelRole {
    /// 控制连接，处理服务器的 CONNECT 请求
    Control {
        client_key: String,
        connector: Arc<dyn LinkConnector>,
    },
    /// 隧道连接，承载一个配对的 TRANSFER 数据
    Link,
}

impl ChannelRole {
    fn name(&self) -> &'static str {
        match self {
            ChannelRole::Control { .. } => "Control",
            ChannelRole::Link => "Link",
        }
    }
}

/// 客户端侧控制连接 / 隧道连接的协议处理
pub(crate) struct ClientChannelEngine {
    role: ChannelRole,
    registry: Arc<ClientChannelRegistry>,
    channel: Channel<ProxyMessage>,
}

impl ClientChannelEngine {
    pub(crate) fn control(
        registry: Arc<ClientChannelRegistry>,
        channel: Channel<ProxyMessage>,
        client_key: impl Into<String>,
        connector: Arc<dyn LinkConnector>,
    ) -> Self {
        Self {
            role: ChannelRole::Control {
                client_key: client_key.into(),
                connector,
            },
            registry,
            channel,
        }
    }

    pub(crate) fn link(registry: Arc<ClientChannelRegistry>, channel: Channel<ProxyMessage>) -> Self {
        Self {
            role: ChannelRole::Link,
            registry,
            channel,
        }
    }

    /// 处理一条消息；返回错误时连接应被关闭
    ///
    /// 配对缺失只记录并丢弃该消息。
    pub(crate) fn on_message(&mut self, msg: ProxyMessage) -> Result<()> {
        match self.dispatch(msg) {
            Err(e) if e.is_pairing_miss() => {
                debug!("Link {} dropped message: {}", self.channel.id(), e);
                Ok(())
            }
            result => result,
        }
    }

    fn dispatch(&mut self, msg: ProxyMessage) -> Result<()> {
        match (msg.kind, &self.role) {
            (MessageType::Heartbeat, _) => Ok(()),
            (MessageType::Connect, ChannelRole::Control { client_key, connector }) => {
                self.on_connect_request(msg, client_key.clone(), connector.clone());
                Ok(())
            }
            (MessageType::Disconnect, ChannelRole::Link) => self.on_disconnect(msg),
            (MessageType::Disconnect, ChannelRole::Control { .. }) => {
                debug!("DISCONNECT {} on control channel ignored", msg.uri);
                Ok(())
            }
            (MessageType::Transfer, ChannelRole::Link) => self.on_transfer(msg),
            (MessageType::WriteControl, _) => {
                debug!("Channel {} ignoring WRITE_CONTROL", self.channel.id());
                Ok(())
            }
            (kind, role) => Err(TunnelError::unexpected(kind, role.name())),
        }
    }

    fn on_connect_request(
        &self,
        msg: ProxyMessage,
        client_key: String,
        connector: Arc<dyn LinkConnector>,
    ) {
        let user_id = msg.uri;
        let Ok(lan) = String::from_utf8(msg.data.to_vec()) else {
            warn!("CONNECT for user {} carries a non UTF-8 address", user_id);
            self.channel.send(ProxyMessage::disconnect(user_id));
            return;
        };

        tokio::spawn(open_backend(
            self.registry.clone(),
            connector,
            self.channel.clone(),
            client_key,
            user_id,
            lan,
        ));
    }

    fn on_disconnect(&self, msg: ProxyMessage) -> Result<()> {
        let link_id = self.channel.id();
        match self.registry.pairings().by_link(link_id) {
            Some(pairing) if pairing.user_id == msg.uri => {
                debug!("Link {} released by server for user {}", link_id, msg.uri);
                self.registry.pairings().unbind_link(link_id);
                self.registry.remove_backend(&pairing.user_id, pairing.peer.id());
                self.registry.return_link(self.channel.clone());
                pairing.peer.close_after_flush();
                Ok(())
            }
            Some(pairing) => Err(TunnelError::pairing_miss(format!(
                "DISCONNECT {} on link paired with {}",
                msg.uri, pairing.user_id
            ))),
            None => Err(TunnelError::pairing_miss(format!(
                "DISCONNECT {} on unpaired link",
                msg.uri
            ))),
        }
    }

    fn on_transfer(&self, msg: ProxyMessage) -> Result<()> {
        match self.registry.pairings().by_link(self.channel.id()) {
            Some(pairing) if pairing.user_id == msg.uri => {
                pairing.peer.send(msg.data);
                Ok(())
            }
            _ => Err(TunnelError::pairing_miss(format!(
                "TRANSFER for stale user {}",
                msg.uri
            ))),
        }
    }

    /// 隧道连接可写性变化时暂停/恢复后端连接的读泵
    pub(crate) fn on_writability(&mut self, writable: bool) {
        if let Some(pairing) = self.registry.pairings().by_link(self.channel.id()) {
            pairing.peer.set_auto_read(writable);
        }
    }

    pub(crate) fn on_closed(&mut self) {
        let id = self.channel.id();
        match self.role {
            ChannelRole::Control { .. } => {
                if self.registry.clear_control_channel(id) {
                    info!("Control channel {} closed", id);
                }
                self.registry.clear_backends();
            }
            ChannelRole::Link => {
                if let Some(pairing) = self.registry.pairings().unbind_link(id) {
                    debug!("Link {} closed, closing backend of user {}", id, pairing.user_id);
                    self.registry.remove_backend(&pairing.user_id, pairing.peer.id());
                    pairing.peer.close_after_flush();
                }
                self.registry.remove_link(id);
            }
        }
    }
}

/// 连接后端服务并借出隧道连接完成配对
///
/// 任一步失败都经控制连接回复 DISCONNECT，通知服务器配对失败。
async fn open_backend(
    registry: Arc<ClientChannelRegistry>,
    connector: Arc<dyn LinkConnector>,
    control: Channel<ProxyMessage>,
    client_key: String,
    user_id: String,
    lan: String,
) {
    let stream = match connect_tcp(&lan, DEFAULT_CONNECT_TIMEOUT).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("User {}: backend {} unreachable: {}", user_id, lan, e);
            control.send(ProxyMessage::disconnect(user_id));
            return;
        }
    };
    let (backend, pump) =
        channel::open::<_, _, Bytes>(stream, BytesCodec::new(), ChannelOptions::paused());

    let link = match registry.borrow_link(connector.as_ref()).await {
        Ok(link) => link,
        Err(e) => {
            warn!("User {}: failed to obtain a link: {}", user_id, e);
            backend.close();
            control.send(ProxyMessage::disconnect(user_id));
            return;
        }
    };

    registry
        .pairings()
        .bind(Pairing::new(link.clone(), backend.clone(), user_id.as_str()));
    registry.register_backend(&user_id, backend.clone());

    if !link.send(ProxyMessage::connect_ack(&user_id, &client_key)) {
        warn!("User {}: link {} closed before pairing", user_id, link.id());
        registry.pairings().unbind_link(link.id());
        registry.remove_backend(&user_id, backend.id());
        backend.close();
        control.send(ProxyMessage::disconnect(user_id));
        return;
    }

    debug!(
        "User {} paired backend {} ({}) with link {}",
        user_id,
        backend.id(),
        lan,
        link.id()
    );
    backend.set_auto_read(true);
    tokio::spawn(run_backend(registry, backend, pump));
}

/// 运行一条客户端侧连接直到关闭
///
/// 写空闲时发送心跳，读空闲时关闭连接。
pub(crate) async fn serve_channel<S>(
    mut engine: ClientChannelEngine,
    mut pump: Pump<ReadHalf<S>, ProxyMessageCodec>,
    idle_config: IdleConfig,
    shutdown: CancellationToken,
) where
    S: AsyncRead + Send + 'static,
{
    let channel = engine.channel.clone();
    let mut idle = IdleCheck::new(idle_config, channel.activity());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = pump.next() => match event {
                ReadEvent::Item(msg) => {
                    if let Err(e) = engine.on_message(msg) {
                        warn!("Closing {} channel {}: {}", engine.role.name(), channel.id(), e);
                        break;
                    }
                }
                ReadEvent::Writability(writable) => engine.on_writability(writable),
                ReadEvent::Closed(Some(e)) => {
                    warn!("{} channel {} failed: {}", engine.role.name(), channel.id(), e);
                    break;
                }
                ReadEvent::Closed(None) => break,
            },
            event = idle.tick() => match event {
                IdleEvent::ReaderIdle => {
                    info!("{} channel {} read idle, closing", engine.role.name(), channel.id());
                    break;
                }
                IdleEvent::WriterIdle => {
                    channel.send(ProxyMessage::heartbeat(0));
                }
            },
        }
    }

    channel.close();
    engine.on_closed();
}
