use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::BytesCodec;
use tracing::{debug, error, info, warn};

use super::registry::UserSession;
use super::ServerState;
use crate::channel::{self, ChannelOptions, ReadEvent};
use crate::net::{prepare_stream, KeepaliveConfig};
use crate::protocol::ProxyMessage;
use crate::stats::ConnectionGuard;

/// 对外端口监听管理：记录已绑定的端口，配置变化时补绑新端口
#[derive(Debug, Default)]
pub struct ListenerManager {
    bound: Mutex<HashSet<u16>>,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已绑定的端口，升序
    pub fn bound_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.bound.lock().iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// 为映射表中尚未绑定的端口启动监听
    pub async fn sync(&self, state: &Arc<ServerState>) {
        for port in state.mappings.user_ports() {
            if self.bound.lock().contains(&port) {
                continue;
            }
            match start_user_listener(state.clone(), port).await {
                Ok(()) => {
                    self.bound.lock().insert(port);
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    warn!("Port {} already in use, skipping: {}", port, e);
                }
                Err(e) => {
                    error!("Failed to bind port {}: {}", port, e);
                }
            }
        }
    }
}

/// 绑定一个对外端口并在后台接受连接
pub async fn start_user_listener(state: Arc<ServerState>, port: u16) -> io::Result<()> {
    let listener = TcpListener::bind((state.config.bind_addr.as_str(), port)).await?;
    info!("Listening for users on {}:{}", state.config.bind_addr, port);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        tokio::spawn(handle_user_connection(state.clone(), stream, peer_addr, port));
                    }
                    Err(e) => {
                        error!("Port {} accept error: {}", port, e);
                    }
                },
            }
        }
        debug!("User listener on port {} stopped", port);
    });
    Ok(())
}

/// 处理一个用户连接
///
/// 连接以读泵关闭的状态打开，直到客户端完成配对才开始读取，
/// 期间用户写入的数据留在 socket 缓冲区中。
pub(crate) async fn handle_user_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    inet_port: u16,
) {
    prepare_stream(&stream, &KeepaliveConfig::default());
    let registry = state.registry.clone();
    let user_id = registry.next_user_id();
    let (user, mut pump) =
        channel::open::<_, _, Bytes>(stream, BytesCodec::new(), ChannelOptions::paused());

    let session = state
        .mappings
        .client_key_for_port(inet_port)
        .and_then(|key| registry.lookup_control_session(&key));
    let lan = state.mappings.lan_info(inet_port);
    let (Some(session), Some(lan)) = (session, lan) else {
        info!(
            "No client online for port {}, closing user {} from {}",
            inet_port, user_id, peer_addr
        );
        user.close();
        return;
    };

    let guard = ConnectionGuard::new(state.stats_manager.tracker(inet_port));
    let tracker = guard.tracker().clone();

    let registered = registry.add_user_session(
        &session,
        UserSession {
            user_id: user_id.clone(),
            conn: user.clone(),
            inet_port,
        },
    );
    if !registered {
        info!(
            "Client '{}' went offline, closing user {}",
            session.client_key(),
            user_id
        );
        user.close();
        return;
    }

    info!(
        "User {} from {} on port {} -> client '{}' {}",
        user_id,
        peer_addr,
        inet_port,
        session.client_key(),
        lan
    );
    session
        .channel()
        .send(ProxyMessage::connect_request(&user_id, &lan));

    loop {
        match pump.next().await {
            ReadEvent::Item(data) => {
                let Some(pairing) = registry.pairings().by_peer(user.id()) else {
                    debug!("User {} has no link, closing", user_id);
                    break;
                };
                tracker.add_bytes_received(data.len() as u64);
                pairing
                    .link
                    .send(ProxyMessage::transfer(user_id.as_str(), data.freeze()));
            }
            ReadEvent::Writability(writable) => {
                if let Some(pairing) = registry.pairings().by_peer(user.id()) {
                    pairing.link.set_auto_read(writable);
                }
            }
            ReadEvent::Closed(err) => {
                if let Some(e) = err {
                    debug!("User {} connection error: {}", user_id, e);
                }
                break;
            }
        }
    }

    user.close_after_flush();
    registry.remove_user_session(&session, &user_id);
    if let Some(pairing) = registry.pairings().unbind_peer(user.id()) {
        // 链路可能因本连接不可写被暂停
        pairing.link.set_auto_read(true);
        pairing.link.send(ProxyMessage::disconnect(user_id.as_str()));
    }
    debug!("User {} on port {} closed", user_id, inet_port);
    drop(guard);
}
