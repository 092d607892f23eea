use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::channel::{Channel, ChannelId};
use crate::error::Result;
use crate::pairing::PairingTable;
use crate::protocol::ProxyMessage;

/// 空闲隧道连接池默认容量
pub const DEFAULT_POOL_CAPACITY: usize = 100;

/// 新建隧道连接
///
/// 实现方负责建立到服务器隧道端口的连接，并启动该连接的处理任务。
#[async_trait]
pub trait LinkConnector: Send + Sync {
    async fn connect(&self) -> Result<Channel<ProxyMessage>>;
}

/// 客户端侧连接注册表
///
/// 单一的控制连接槽位、空闲隧道连接池（FIFO）、userId -> 后端连接，
/// 以及后端连接 id -> userId 的反查表。
#[derive(Debug)]
pub struct ClientChannelRegistry {
    capacity: usize,
    control: RwLock<Option<Channel<ProxyMessage>>>,
    idle_links: Mutex<VecDeque<Channel<ProxyMessage>>>,
    backends: DashMap<String, Channel<Bytes>>,
    backend_user_ids: DashMap<ChannelId, String>,
    pairings: PairingTable,
}

impl Default for ClientChannelRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl ClientChannelRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            control: RwLock::new(None),
            idle_links: Mutex::new(VecDeque::new()),
            backends: DashMap::new(),
            backend_user_ids: DashMap::new(),
            pairings: PairingTable::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pairings(&self) -> &PairingTable {
        &self.pairings
    }

    pub fn set_control_channel(&self, channel: Channel<ProxyMessage>) {
        *self.control.write() = Some(channel);
    }

    pub fn control_channel(&self) -> Option<Channel<ProxyMessage>> {
        self.control.read().clone()
    }

    /// 清空控制连接槽位（仅当槽位中仍是 `channel_id`）
    pub fn clear_control_channel(&self, channel_id: ChannelId) -> bool {
        let mut slot = self.control.write();
        if slot.as_ref().map(|c| c.id()) == Some(channel_id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// 借出一条隧道连接：优先取空闲池，池空时新建
    pub async fn borrow_link(&self, connector: &dyn LinkConnector) -> Result<Channel<ProxyMessage>> {
        loop {
            let next = self.idle_links.lock().pop_front();
            match next {
                Some(link) if link.is_active() => {
                    debug!("Borrowed pooled link {}", link.id());
                    return Ok(link);
                }
                Some(link) => {
                    debug!("Dropping dead pooled link {}", link.id());
                }
                None => break,
            }
        }

        let link = connector.connect().await?;
        debug!("Opened new link {}", link.id());
        Ok(link)
    }

    /// 归还隧道连接，返回是否放回了空闲池
    ///
    /// 池已满或连接已关闭时直接关闭该连接。
    pub fn return_link(&self, link: Channel<ProxyMessage>) -> bool {
        if let Some(pairing) = self.pairings.unbind_link(link.id()) {
            self.remove_backend(&pairing.user_id, pairing.peer.id());
        }
        if !link.is_active() {
            return false;
        }

        let mut idle = self.idle_links.lock();
        if idle.len() >= self.capacity {
            drop(idle);
            debug!("Link pool full ({}), closing link {}", self.capacity, link.id());
            link.close();
            return false;
        }
        if idle.iter().any(|pooled| pooled.id() == link.id()) {
            return true;
        }
        link.set_auto_read(true);
        idle.push_back(link);
        true
    }

    /// 从空闲池移除一条连接
    pub fn remove_link(&self, link_id: ChannelId) {
        self.idle_links.lock().retain(|link| link.id() != link_id);
    }

    pub fn idle_link_count(&self) -> usize {
        self.idle_links.lock().len()
    }

    /// 关闭并清空空闲池
    pub fn close_idle_links(&self) {
        let links: Vec<_> = self.idle_links.lock().drain(..).collect();
        for link in links {
            link.close();
        }
    }

    pub fn register_backend(&self, user_id: &str, backend: Channel<Bytes>) {
        self.backend_user_ids
            .insert(backend.id(), user_id.to_string());
        self.backends.insert(user_id.to_string(), backend);
    }

    pub fn backend(&self, user_id: &str) -> Option<Channel<Bytes>> {
        self.backends.get(user_id).map(|entry| entry.value().clone())
    }

    /// 按后端连接反查 userId
    pub fn backend_user_id(&self, backend_id: ChannelId) -> Option<String> {
        self.backend_user_ids
            .get(&backend_id)
            .map(|entry| entry.value().clone())
    }

    /// 移除后端连接（仅当 userId 仍指向 `backend_id`）
    pub fn remove_backend(&self, user_id: &str, backend_id: ChannelId) -> Option<Channel<Bytes>> {
        self.backend_user_ids.remove(&backend_id);
        self.backends
            .remove_if(user_id, |_, backend| backend.id() == backend_id)
            .map(|(_, backend)| backend)
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// 强制关闭所有后端连接（控制连接断开时）
    pub fn clear_backends(&self) {
        let user_ids: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for user_id in user_ids {
            if let Some((_, backend)) = self.backends.remove(&user_id) {
                self.backend_user_ids.remove(&backend.id());
                if let Some(pairing) = self.pairings.unbind_peer(backend.id()) {
                    pairing.link.close();
                }
                backend.close();
                closed += 1;
            }
        }
        if closed > 0 {
            info!("Closed {} backend connection(s)", closed);
        }
    }
}
