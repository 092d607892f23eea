use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelId};
use crate::error::{Result, TunnelError};
use crate::pairing::PairingTable;
use crate::protocol::ProxyMessage;

/// 服务器侧的用户会话
#[derive(Debug, Clone)]
pub struct UserSession {
    pub user_id: String,
    /// 用户连接
    pub conn: Channel<Bytes>,
    /// 用户连入的对外端口
    pub inet_port: u16,
}

/// 客户端控制会话，AUTH 成功后创建
#[derive(Debug)]
pub struct ControlSession {
    client_key: String,
    channel: Channel<ProxyMessage>,
    /// userId -> 用户会话
    users: DashMap<String, UserSession>,
}

impl ControlSession {
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub fn channel(&self) -> &Channel<ProxyMessage> {
        &self.channel
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// 取出全部用户会话
    fn drain_users(&self) -> Vec<UserSession> {
        let user_ids: Vec<String> = self.users.iter().map(|e| e.key().clone()).collect();
        user_ids
            .into_iter()
            .filter_map(|id| self.users.remove(&id).map(|(_, user)| user))
            .collect()
    }
}

/// 服务器侧连接注册表
///
/// clientKey -> 控制会话，每个控制会话下挂 userId -> 用户连接。
/// 隧道连接与用户连接的配对放在 [`PairingTable`] 中。
#[derive(Debug, Default)]
pub struct ServerChannelRegistry {
    control_sessions: DashMap<String, Arc<ControlSession>>,
    pairings: PairingTable,
    next_user_id: AtomicU64,
}

impl ServerChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 生成进程内唯一的 userId
    pub fn next_user_id(&self) -> String {
        (self.next_user_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub fn pairings(&self) -> &PairingTable {
        &self.pairings
    }

    /// 登记控制会话
    ///
    /// 同一 clientKey 已有存活的控制会话时拒绝并关闭新连接，原会话不受影响。
    pub fn register_control_session(
        &self,
        client_key: &str,
        channel: Channel<ProxyMessage>,
    ) -> Result<Arc<ControlSession>> {
        let session = Arc::new(ControlSession {
            client_key: client_key.to_string(),
            channel: channel.clone(),
            users: DashMap::new(),
        });

        match self.control_sessions.entry(client_key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().channel.is_active() {
                    drop(occupied);
                    warn!(
                        "Client '{}' already has a live control session, closing channel {}",
                        client_key,
                        channel.id()
                    );
                    channel.close();
                    return Err(TunnelError::auth_failed(format!(
                        "client key '{}' is already online",
                        client_key
                    )));
                }
                // 旧会话已关闭但尚未清理
                let stale = occupied.insert(session.clone());
                drop(occupied);
                for user in stale.drain_users() {
                    user.conn.close_after_flush();
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session.clone());
            }
        }

        info!(
            "Client '{}' registered control session on channel {}",
            client_key,
            channel.id()
        );
        Ok(session)
    }

    pub fn lookup_control_session(&self, client_key: &str) -> Option<Arc<ControlSession>> {
        self.control_sessions
            .get(client_key)
            .map(|entry| entry.value().clone())
    }

    /// 移除控制会话，并先写完再关闭其下所有用户连接
    ///
    /// 只有当注册的仍是 `channel_id` 对应的会话时才会移除。
    pub fn remove_control_session(
        &self,
        client_key: &str,
        channel_id: ChannelId,
    ) -> Option<Arc<ControlSession>> {
        let (_, session) = self
            .control_sessions
            .remove_if(client_key, |_, session| session.channel.id() == channel_id)?;

        let users = session.drain_users();
        info!(
            "Client '{}' control session removed, closing {} user connection(s)",
            client_key,
            users.len()
        );
        for user in users {
            self.pairings.unbind_peer(user.conn.id());
            user.conn.close_after_flush();
        }
        Some(session)
    }

    /// 登记用户会话，控制会话已关闭时返回 false
    pub fn add_user_session(&self, session: &ControlSession, user: UserSession) -> bool {
        let user_id = user.user_id.clone();
        session.users.insert(user_id.clone(), user);

        // 与 remove_control_session 并发时，关闭总是先于清空
        if !session.channel.is_active() {
            session.users.remove(&user_id);
            return false;
        }
        debug!(
            "User {} registered under client '{}'",
            user_id, session.client_key
        );
        true
    }

    pub fn get_user_session(&self, session: &ControlSession, user_id: &str) -> Option<UserSession> {
        session.users.get(user_id).map(|entry| entry.value().clone())
    }

    pub fn remove_user_session(
        &self,
        session: &ControlSession,
        user_id: &str,
    ) -> Option<UserSession> {
        session.users.remove(user_id).map(|(_, user)| user)
    }

    /// 客户端是否在线
    pub fn has_control_session(&self, client_key: &str) -> bool {
        self.control_sessions
            .get(client_key)
            .map(|entry| entry.channel.is_active())
            .unwrap_or(false)
    }

    /// 在线客户端的 clientKey 列表
    pub fn online_clients(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .control_sessions
            .iter()
            .filter(|entry| entry.channel.is_active())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// 客户端当前的用户会话数
    pub fn user_session_count(&self, client_key: &str) -> usize {
        self.control_sessions
            .get(client_key)
            .map(|entry| entry.user_count())
            .unwrap_or(0)
    }

    /// 关闭并清空所有会话
    pub fn clear(&self) {
        let keys: Vec<String> = self
            .control_sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            if let Some((_, session)) = self.control_sessions.remove(&key) {
                session.channel.close();
                for user in session.drain_users() {
                    user.conn.close();
                }
            }
        }

        for pairing in self.pairings.drain() {
            pairing.link.close();
            pairing.peer.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{open, ChannelOptions};
    use crate::codec::ProxyMessageCodec;
    use crate::pairing::Pairing;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_util::codec::BytesCodec;

    fn control() -> (Channel<ProxyMessage>, DuplexStream) {
        let (a, b) = tokio::io::duplex(1024);
        let (channel, _pump) =
            open::<_, _, ProxyMessage>(a, ProxyMessageCodec::new(), ChannelOptions::default());
        (channel, b)
    }

    fn user(registry: &ServerChannelRegistry) -> (UserSession, DuplexStream) {
        let (a, b) = tokio::io::duplex(1024);
        let (conn, _pump) = open::<_, _, Bytes>(a, BytesCodec::new(), ChannelOptions::paused());
        let session = UserSession {
            user_id: registry.next_user_id(),
            conn,
            inet_port: 50022,
        };
        (session, b)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ServerChannelRegistry::new();
        let (channel, _peer) = control();

        let session = registry.register_control_session("k", channel.clone()).unwrap();
        assert_eq!(session.client_key(), "k");
        assert!(registry.has_control_session("k"));
        assert!(!registry.has_control_session("other"));
        assert_eq!(
            registry.lookup_control_session("k").unwrap().channel().id(),
            channel.id()
        );
        assert_eq!(registry.online_clients(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_register_closes_new_channel() {
        let registry = ServerChannelRegistry::new();
        let (first, _p1) = control();
        let (second, _p2) = control();

        registry.register_control_session("k", first.clone()).unwrap();
        let err = registry.register_control_session("k", second.clone()).unwrap_err();
        assert!(err.is_auth_failed());
        assert!(!second.is_active());
        assert!(first.is_active());
        assert_eq!(
            registry.lookup_control_session("k").unwrap().channel().id(),
            first.id()
        );
    }

    #[tokio::test]
    async fn test_register_replaces_closed_session() {
        let registry = ServerChannelRegistry::new();
        let (first, _p1) = control();
        let (second, _p2) = control();

        registry.register_control_session("k", first.clone()).unwrap();
        first.close();
        registry.register_control_session("k", second.clone()).unwrap();
        assert_eq!(
            registry.lookup_control_session("k").unwrap().channel().id(),
            second.id()
        );
    }

    #[tokio::test]
    async fn test_user_sessions() {
        let registry = ServerChannelRegistry::new();
        let (channel, _peer) = control();
        let session = registry.register_control_session("k", channel).unwrap();

        let (u, _peer_u) = user(&registry);
        let user_id = u.user_id.clone();
        assert!(registry.add_user_session(&session, u));
        assert_eq!(registry.user_session_count("k"), 1);
        assert!(registry.get_user_session(&session, &user_id).is_some());

        let removed = registry.remove_user_session(&session, &user_id).unwrap();
        assert_eq!(removed.user_id, user_id);
        assert!(registry.get_user_session(&session, &user_id).is_none());
        assert_eq!(registry.user_session_count("k"), 0);
    }

    #[tokio::test]
    async fn test_add_user_to_closed_session_fails() {
        let registry = ServerChannelRegistry::new();
        let (channel, _peer) = control();
        let session = registry.register_control_session("k", channel.clone()).unwrap();
        channel.close();

        let (u, _peer_u) = user(&registry);
        assert!(!registry.add_user_session(&session, u));
        assert_eq!(session.user_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_control_session_cascades() {
        let registry = ServerChannelRegistry::new();
        let (channel, _peer) = control();
        let session = registry.register_control_session("k", channel.clone()).unwrap();

        let mut conns = Vec::new();
        let mut peers = Vec::new();
        for _ in 0..3 {
            let (u, p) = user(&registry);
            conns.push(u.conn.clone());
            peers.push(p);
            let (link, _lp) = control();
            registry
                .pairings()
                .bind(Pairing::new(link, u.conn.clone(), u.user_id.clone()));
            assert!(registry.add_user_session(&session, u));
        }

        // 通道 id 不匹配时不移除
        assert!(registry.remove_control_session("k", channel.id() + 1000).is_none());
        assert!(registry.has_control_session("k"));

        registry.remove_control_session("k", channel.id()).unwrap();
        assert!(!registry.has_control_session("k"));
        assert_eq!(session.user_count(), 0);
        assert!(registry.pairings().is_empty());

        for conn in conns {
            tokio::time::timeout(Duration::from_secs(1), conn.closed())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_clear() {
        let registry = ServerChannelRegistry::new();
        let (channel, _peer) = control();
        let session = registry.register_control_session("k", channel.clone()).unwrap();
        let (u, _p) = user(&registry);
        let conn = u.conn.clone();
        registry.add_user_session(&session, u);

        registry.clear();
        assert!(!channel.is_active());
        assert!(!conn.is_active());
        assert!(registry.online_clients().is_empty());
    }

    #[test]
    fn test_user_ids_are_monotonic() {
        let registry = ServerChannelRegistry::new();
        let a: u64 = registry.next_user_id().parse().unwrap();
        let b: u64 = registry.next_user_id().parse().unwrap();
        assert!(b > a);
    }
}
