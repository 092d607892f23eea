use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::registry::ControlSession;
use super::ServerState;
use crate::channel::{self, Channel, ChannelOptions, ReadEvent};
use crate::codec::ProxyMessageCodec;
use crate::error::{Result, TunnelError};
use crate::idle::{IdleCheck, IdleEvent};
use crate::net::{prepare_stream, KeepaliveConfig};
use crate::pairing::Pairing;
use crate::protocol::{parse_connect_ack, MessageType, ProxyMessage};
use crate::stats::PortStatsTracker;

/// 隧道端口上一条连接的状态
///
/// 控制连接以 AUTH 进入 `Authenticated`；隧道连接不发送 AUTH，
/// 以第一个配对确认（CONNECT "userId@clientKey"）进入 `Link`。
enum SessionState {
    Unauthenticated,
    Authenticated {
        session: Arc<ControlSession>,
    },
    Link {
        session: Arc<ControlSession>,
        tracker: Option<PortStatsTracker>,
    },
    Closed,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "Unauthenticated",
            SessionState::Authenticated { .. } => "Authenticated",
            SessionState::Link { .. } => "Link",
            SessionState::Closed => "Closed",
        }
    }
}

/// 服务器侧控制会话 / 隧道连接的协议状态机
pub(crate) struct ControlChannelEngine {
    state: Arc<ServerState>,
    channel: Channel<ProxyMessage>,
    session_state: SessionState,
}

impl ControlChannelEngine {
    pub(crate) fn new(state: Arc<ServerState>, channel: Channel<ProxyMessage>) -> Self {
        Self {
            state,
            channel,
            session_state: SessionState::Unauthenticated,
        }
    }

    /// 处理一条消息；返回错误时连接应被关闭
    ///
    /// 配对缺失只记录并丢弃该消息。
    pub(crate) fn on_message(&mut self, msg: ProxyMessage) -> Result<()> {
        match self.dispatch(msg) {
            Err(e) if e.is_pairing_miss() => {
                debug!("Channel {} dropped message: {}", self.channel.id(), e);
                Ok(())
            }
            result => result,
        }
    }

    fn dispatch(&mut self, msg: ProxyMessage) -> Result<()> {
        match msg.kind {
            MessageType::Heartbeat => {
                self.channel.send(ProxyMessage::heartbeat(msg.serial_number));
                Ok(())
            }
            MessageType::Auth => self.on_auth(msg),
            MessageType::Connect => self.on_connect_ack(msg),
            MessageType::Disconnect => self.on_disconnect(msg),
            MessageType::Transfer => self.on_transfer(msg),
            MessageType::WriteControl => {
                debug!("Channel {} ignoring WRITE_CONTROL", self.channel.id());
                Ok(())
            }
        }
    }

    fn on_auth(&mut self, msg: ProxyMessage) -> Result<()> {
        if !matches!(self.session_state, SessionState::Unauthenticated) {
            return Err(TunnelError::unexpected(msg.kind, self.session_state.name()));
        }

        let client_key = msg.uri;
        if !self.state.mappings.is_known(&client_key) {
            self.state.mappings.add_discovered_client(&client_key);
            return Err(TunnelError::auth_failed(format!(
                "unknown client key '{}'",
                client_key
            )));
        }

        let session = self
            .state
            .registry
            .register_control_session(&client_key, self.channel.clone())?;
        info!(
            "Client '{}' authenticated on channel {}, ports {:?}",
            client_key,
            self.channel.id(),
            self.state.mappings.client_ports(&client_key)
        );
        self.session_state = SessionState::Authenticated { session };
        Ok(())
    }

    fn on_connect_ack(&mut self, msg: ProxyMessage) -> Result<()> {
        if matches!(
            self.session_state,
            SessionState::Authenticated { .. } | SessionState::Closed
        ) {
            return Err(TunnelError::unexpected(msg.kind, self.session_state.name()));
        }

        let (user_id, client_key) = parse_connect_ack(&msg.uri)
            .ok_or_else(|| TunnelError::malformed(format!("bad CONNECT ack '{}'", msg.uri)))?;

        let registry = &self.state.registry;
        let session = registry.lookup_control_session(client_key).ok_or_else(|| {
            TunnelError::auth_failed(format!("no control session for '{}'", client_key))
        })?;

        let Some(user) = registry.get_user_session(&session, user_id) else {
            debug!(
                "User {} of client '{}' is gone, rejecting pairing on link {}",
                user_id,
                client_key,
                self.channel.id()
            );
            self.channel.send(ProxyMessage::disconnect(user_id));
            self.session_state = SessionState::Link {
                session,
                tracker: None,
            };
            return Ok(());
        };

        registry
            .pairings()
            .bind(Pairing::new(self.channel.clone(), user.conn.clone(), user_id));
        user.conn.set_auto_read(self.channel.is_writable());
        debug!(
            "User {} paired with link {} (client '{}')",
            user_id,
            self.channel.id(),
            client_key
        );

        let tracker = Some(self.state.stats_manager.tracker(user.inet_port));
        self.session_state = SessionState::Link { session, tracker };
        Ok(())
    }

    fn on_disconnect(&mut self, msg: ProxyMessage) -> Result<()> {
        let registry = &self.state.registry;
        match &self.session_state {
            SessionState::Link { session, .. } => {
                let Some(pairing) = registry.pairings().by_link(self.channel.id()) else {
                    return Err(TunnelError::pairing_miss(format!(
                        "DISCONNECT {} on unpaired link",
                        msg.uri
                    )));
                };
                if pairing.user_id != msg.uri {
                    return Err(TunnelError::pairing_miss(format!(
                        "DISCONNECT {} on link paired with {}",
                        msg.uri, pairing.user_id
                    )));
                }
                registry.pairings().unbind_link(self.channel.id());
                registry.remove_user_session(session, &pairing.user_id);
                pairing.peer.close_after_flush();
            }
            SessionState::Authenticated { session } => {
                // 客户端未能完成配对，经控制连接通知
                match registry.remove_user_session(session, &msg.uri) {
                    Some(user) => {
                        debug!(
                            "Client '{}' failed to pair user {}",
                            session.client_key(),
                            msg.uri
                        );
                        registry.pairings().unbind_peer(user.conn.id());
                        user.conn.close_after_flush();
                    }
                    None => {
                        return Err(TunnelError::pairing_miss(format!(
                            "DISCONNECT for unknown user {}",
                            msg.uri
                        )))
                    }
                }
            }
            SessionState::Unauthenticated | SessionState::Closed => {
                debug!(
                    "Channel {} DISCONNECT {} before authentication",
                    self.channel.id(),
                    msg.uri
                );
            }
        }
        Ok(())
    }

    fn on_transfer(&mut self, msg: ProxyMessage) -> Result<()> {
        let SessionState::Link { tracker, .. } = &self.session_state else {
            debug!(
                "Channel {} TRANSFER in state {}, dropped",
                self.channel.id(),
                self.session_state.name()
            );
            return Ok(());
        };

        match self.state.registry.pairings().by_link(self.channel.id()) {
            Some(pairing) if pairing.user_id == msg.uri => {
                if let Some(tracker) = tracker {
                    tracker.add_bytes_sent(msg.data.len() as u64);
                }
                pairing.peer.send(msg.data);
                Ok(())
            }
            _ => Err(TunnelError::pairing_miss(format!(
                "TRANSFER for stale user {}",
                msg.uri
            ))),
        }
    }

    /// 隧道连接可写性变化时暂停/恢复配对用户连接的读泵
    pub(crate) fn on_writability(&mut self, writable: bool) {
        if let Some(pairing) = self.state.registry.pairings().by_link(self.channel.id()) {
            pairing.peer.set_auto_read(writable);
        }
    }

    pub(crate) fn on_closed(&mut self) {
        let registry = &self.state.registry;
        match std::mem::replace(&mut self.session_state, SessionState::Closed) {
            SessionState::Authenticated { session } => {
                info!(
                    "Client '{}' control session closed (channel {})",
                    session.client_key(),
                    self.channel.id()
                );
                registry.remove_control_session(session.client_key(), self.channel.id());
            }
            SessionState::Link { session, .. } => {
                if let Some(pairing) = registry.pairings().unbind_link(self.channel.id()) {
                    debug!(
                        "Link {} closed, closing user {}",
                        self.channel.id(),
                        pairing.user_id
                    );
                    registry.remove_user_session(&session, &pairing.user_id);
                    pairing.peer.close_after_flush();
                }
            }
            SessionState::Unauthenticated | SessionState::Closed => {}
        }
    }
}

/// 处理隧道端口上的一条连接，直到连接关闭
pub(crate) async fn handle_tunnel_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    prepare_stream(&stream, &KeepaliveConfig::default());
    let (channel, mut pump) =
        channel::open::<_, _, ProxyMessage>(stream, ProxyMessageCodec::new(), ChannelOptions::default());
    debug!("Tunnel connection {} from {}", channel.id(), peer_addr);

    let mut idle = IdleCheck::new(state.idle_config(), channel.activity());
    let mut engine = ControlChannelEngine::new(state.clone(), channel.clone());

    loop {
        tokio::select! {
            event = pump.next() => match event {
                ReadEvent::Item(msg) => {
                    if let Err(e) = engine.on_message(msg) {
                        warn!("Closing tunnel connection {} from {}: {}", channel.id(), peer_addr, e);
                        break;
                    }
                }
                ReadEvent::Writability(writable) => engine.on_writability(writable),
                ReadEvent::Closed(Some(e)) => {
                    warn!("Tunnel connection {} from {} failed: {}", channel.id(), peer_addr, e);
                    break;
                }
                ReadEvent::Closed(None) => break,
            },
            event = idle.tick() => match event {
                IdleEvent::ReaderIdle => {
                    info!("Tunnel connection {} from {} read idle, closing", channel.id(), peer_addr);
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
    debug!("Tunnel connection {} from {} finished", channel.id(), peer_addr);
}
