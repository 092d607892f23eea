use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{ClientRecord, ConfigValidator, STATUS_DISABLED};

/// 自动登记的客户端使用的标签
pub const UNREGISTERED_TAG: &str = "unregistered";

/// 配置变化事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    /// 映射表整体替换
    Changed,
    /// 未知客户端尝试认证，已登记为占位记录
    ClientDiscovered { client_key: String },
}

#[derive(Debug, Default)]
struct Snapshot {
    clients: Vec<ClientRecord>,
    /// clientKey -> 对外端口列表
    client_ports: HashMap<String, Vec<u16>>,
    /// 对外端口 -> 内网地址
    lan_by_port: HashMap<u16, String>,
    /// 对外端口 -> clientKey
    key_by_port: HashMap<u16, String>,
}

impl Snapshot {
    fn build(clients: Vec<ClientRecord>) -> Self {
        let mut client_ports = HashMap::new();
        let mut lan_by_port = HashMap::new();
        let mut key_by_port = HashMap::new();

        for client in &clients {
            let mut ports = Vec::new();
            if client.is_enabled() {
                for mapping in client.proxy_mappings.iter().filter(|m| m.is_enabled()) {
                    ports.push(mapping.inet_port);
                    lan_by_port.insert(mapping.inet_port, mapping.lan.clone());
                    key_by_port.insert(mapping.inet_port, client.client_key.clone());
                }
            }
            client_ports.insert(client.client_key.clone(), ports);
        }

        Self {
            clients,
            client_ports,
            lan_by_port,
            key_by_port,
        }
    }
}

/// 端口映射表
///
/// 读多写少：读者拿到的是 `Arc` 快照，更新时整体替换。
#[derive(Debug)]
pub struct ProxyMappings {
    snapshot: RwLock<Arc<Snapshot>>,
    events: broadcast::Sender<ConfigEvent>,
}

impl ProxyMappings {
    /// 从客户端列表构建（调用前应已通过验证）
    pub fn new(clients: Vec<ClientRecord>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::build(clients))),
            events,
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// 订阅配置变化
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    /// 对外端口对应的内网地址
    pub fn lan_info(&self, port: u16) -> Option<String> {
        self.current().lan_by_port.get(&port).cloned()
    }

    /// 对外端口所属的 clientKey
    pub fn client_key_for_port(&self, port: u16) -> Option<String> {
        self.current().key_by_port.get(&port).cloned()
    }

    /// 客户端占用的对外端口
    pub fn client_ports(&self, client_key: &str) -> Vec<u16> {
        self.current()
            .client_ports
            .get(client_key)
            .cloned()
            .unwrap_or_default()
    }

    /// 客户端密钥是否已登记（包括禁用和占位记录）
    pub fn is_known(&self, client_key: &str) -> bool {
        self.current().client_ports.contains_key(client_key)
    }

    /// 所有启用的对外端口，升序
    pub fn user_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.current().lan_by_port.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn clients(&self) -> Vec<ClientRecord> {
        self.current().clients.clone()
    }

    /// 登记一个未知客户端：禁用、无映射、标签为 unregistered
    ///
    /// 已登记的密钥不会重复添加，返回是否新增。
    pub fn add_discovered_client(&self, client_key: &str) -> bool {
        {
            let mut guard = self.snapshot.write();
            if guard.client_ports.contains_key(client_key) {
                return false;
            }

            let record = ClientRecord {
                name: client_key.to_string(),
                client_key: client_key.to_string(),
                status: STATUS_DISABLED,
                tag: Some(UNREGISTERED_TAG.to_string()),
                proxy_mappings: Vec::new(),
            };
            match serde_json::to_string(&record) {
                Ok(json) => info!("Discovered unregistered client: {}", json),
                Err(_) => info!("Discovered unregistered client '{}'", client_key),
            }

            let mut clients = guard.clients.clone();
            clients.push(record);
            *guard = Arc::new(Snapshot::build(clients));
        }

        let _ = self.events.send(ConfigEvent::ClientDiscovered {
            client_key: client_key.to_string(),
        });
        true
    }

    /// 整体替换客户端列表，验证失败时保留旧配置
    pub fn update(&self, clients: Vec<ClientRecord>) -> Result<()> {
        if let Err(e) = ConfigValidator::validate_clients(&clients, None) {
            warn!("Rejected mapping update: {}", e);
            return Err(e);
        }

        *self.snapshot.write() = Arc::new(Snapshot::build(clients));
        let _ = self.events.send(ConfigEvent::Changed);
        Ok(())
    }
}

impl Default for ProxyMappings {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
