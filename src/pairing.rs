/// 隧道连接与对端连接（服务器侧的用户连接 / 客户端侧的后端连接）的配对表
///
/// 配对关系双向索引，两侧都只保存对方的 [`ChannelId`]，
/// 解绑时两侧同时移除，保证归还连接池之前不会残留旧的指向。
use bytes::Bytes;
use dashmap::DashMap;

use crate::channel::{Channel, ChannelId};
use crate::protocol::ProxyMessage;

/// 一次配对
#[derive(Debug, Clone)]
pub struct Pairing {
    /// 隧道连接
    pub link: Channel<ProxyMessage>,
    /// 用户连接（服务器侧）或后端连接（客户端侧）
    pub peer: Channel<Bytes>,
    pub user_id: String,
}

impl Pairing {
    pub fn new(link: Channel<ProxyMessage>, peer: Channel<Bytes>, user_id: impl Into<String>) -> Self {
        Self {
            link,
            peer,
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PairingTable {
    by_link: DashMap<ChannelId, Pairing>,
    by_peer: DashMap<ChannelId, ChannelId>,
}

impl PairingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建立配对，任一侧原有的配对先被解除
    pub fn bind(&self, pairing: Pairing) {
        self.unbind_link(pairing.link.id());
        self.unbind_peer(pairing.peer.id());
        self.by_peer.insert(pairing.peer.id(), pairing.link.id());
        self.by_link.insert(pairing.link.id(), pairing);
    }

    pub fn by_link(&self, link_id: ChannelId) -> Option<Pairing> {
        self.by_link.get(&link_id).map(|entry| entry.value().clone())
    }

    pub fn by_peer(&self, peer_id: ChannelId) -> Option<Pairing> {
        let link_id = *self.by_peer.get(&peer_id)?;
        self.by_link
            .get(&link_id)
            .filter(|entry| entry.peer.id() == peer_id)
            .map(|entry| entry.value().clone())
    }

    /// 按隧道连接解除配对，返回被解除的配对
    pub fn unbind_link(&self, link_id: ChannelId) -> Option<Pairing> {
        let (_, pairing) = self.by_link.remove(&link_id)?;
        self.by_peer
            .remove_if(&pairing.peer.id(), |_, linked| *linked == link_id);
        Some(pairing)
    }

    /// 按对端连接解除配对，返回被解除的配对
    pub fn unbind_peer(&self, peer_id: ChannelId) -> Option<Pairing> {
        let (_, link_id) = self.by_peer.remove(&peer_id)?;
        self.by_link
            .remove_if(&link_id, |_, pairing| pairing.peer.id() == peer_id)
            .map(|(_, pairing)| pairing)
    }

    pub fn len(&self) -> usize {
        self.by_link.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_link.is_empty()
    }

    /// 清空并返回所有配对
    pub fn drain(&self) -> Vec<Pairing> {
        let link_ids: Vec<ChannelId> = self.by_link.iter().map(|entry| *entry.key()).collect();
        link_ids
            .into_iter()
            .filter_map(|id| self.unbind_link(id))
            .collect()
    }
}
