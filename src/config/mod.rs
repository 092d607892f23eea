// 配置管理模块 - 使用模块化设计

mod builder;
mod mapping;
mod validator;

// 重新导出 builder、映射表和 validator
pub use builder::{ClientConfigBuilder, ServerConfigBuilder};
pub use mapping::{ConfigEvent, ProxyMappings, UNREGISTERED_TAG};
pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// 启用状态
pub const STATUS_ENABLED: u8 = 1;
/// 禁用状态
pub const STATUS_DISABLED: u8 = 0;

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_status() -> u8 {
    STATUS_ENABLED
}

fn default_server_read_idle_secs() -> u64 {
    60
}

fn default_server_write_idle_secs() -> u64 {
    40
}

fn default_pool_capacity() -> usize {
    100
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_client_read_idle_secs() -> u64 {
    60
}

fn default_reconnect_delay_secs() -> u64 {
    3
}

/// 对外端口到内网服务的映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyMapping {
    /// 服务器对外暴露的端口
    pub inet_port: u16,
    /// 内网后端地址 "host:port"
    pub lan: String,
    /// 备注名称
    #[serde(default)]
    pub name: Option<String>,
    /// 1 启用，其余跳过
    #[serde(default = "default_status")]
    pub status: u8,
}

impl ProxyMapping {
    pub fn new(inet_port: u16, lan: impl Into<String>) -> Self {
        Self {
            inet_port,
            lan: lan.into(),
            name: None,
            status: STATUS_ENABLED,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status == STATUS_ENABLED
    }
}

/// 客户端记录（服务器侧配置）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// 客户端名称
    pub name: String,
    /// 客户端密钥，AUTH 时使用
    pub client_key: String,
    /// 1 启用，0 禁用
    #[serde(default = "default_status")]
    pub status: u8,
    /// 标签
    #[serde(default)]
    pub tag: Option<String>,
    /// 端口映射列表
    #[serde(default)]
    pub proxy_mappings: Vec<ProxyMapping>,
}

impl ClientRecord {
    pub fn new(name: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_key: client_key.into(),
            status: STATUS_ENABLED,
            tag: None,
            proxy_mappings: Vec::new(),
        }
    }

    /// 追加一条启用的映射
    pub fn with_mapping(mut self, inet_port: u16, lan: impl Into<String>) -> Self {
        self.proxy_mappings.push(ProxyMapping::new(inet_port, lan));
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.status == STATUS_ENABLED
    }
}

/// 服务器端配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 隧道协议端口监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 隧道协议端口
    pub bind_port: u16,
    /// 读空闲超时（秒），0 表示不检测
    #[serde(default = "default_server_read_idle_secs")]
    pub read_idle_secs: u64,
    /// 写空闲心跳间隔（秒），0 表示不发送
    #[serde(default = "default_server_write_idle_secs")]
    pub write_idle_secs: u64,
}

impl ServerConfig {
    pub fn new(bind_port: u16) -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port,
            read_idle_secs: default_server_read_idle_secs(),
            write_idle_secs: default_server_write_idle_secs(),
        }
    }

    /// 创建 Builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_server_config(self)
    }
}

/// 服务器完整配置（含客户端列表）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFullConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub clients: Vec<ClientRecord>,
}

impl ServerFullConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_server_full_config(self)
    }
}

/// 客户端配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 服务器地址
    pub server_addr: String,
    /// 服务器隧道协议端口
    pub server_port: u16,
    /// 客户端密钥
    pub client_key: String,
    /// 空闲隧道连接池容量
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// 心跳间隔（秒）
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// 读空闲超时（秒）
    #[serde(default = "default_client_read_idle_secs")]
    pub read_idle_secs: u64,
    /// 重连间隔（秒）
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl ClientConfig {
    /// 创建 Builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_client_config(self)
    }

    /// 服务器隧道端口地址 "host:port"
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }
}

/// 应用配置
#[derive(Debug, Clone)]
pub enum AppConfig {
    Server(ServerFullConfig),
    Client(ClientConfig),
}

impl AppConfig {
    /// 从文件加载配置（按 `[server]` / `[client]` 表自动检测类型）
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let table: toml::Table = toml::from_str(content).context("Failed to parse configuration")?;
        if table.contains_key("server") {
            Ok(AppConfig::Server(Self::parse_server_config(content)?))
        } else if table.contains_key("client") {
            Ok(AppConfig::Client(Self::parse_client_config(content)?))
        } else {
            anyhow::bail!("Configuration must contain a [server] or [client] table")
        }
    }

    /// 从文件加载服务器配置
    pub fn load_server_config(path: &str) -> anyhow::Result<ServerFullConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::parse_server_config(&content)
    }

    /// 从文件加载客户端配置
    pub fn load_client_config(path: &str) -> anyhow::Result<ClientConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::parse_client_config(&content)
    }

    pub fn parse_server_config(content: &str) -> anyhow::Result<ServerFullConfig> {
        let config: ServerFullConfig =
            toml::from_str(content).context("Failed to parse server configuration")?;
        config
            .validate()
            .context("Server configuration validation failed")?;
        Ok(config)
    }

    pub fn parse_client_config(content: &str) -> anyhow::Result<ClientConfig> {
        #[derive(Deserialize)]
        struct ClientConfigWrapper {
            client: ClientConfig,
        }

        let wrapper: ClientConfigWrapper =
            toml::from_str(content).context("Failed to parse client configuration")?;
        wrapper
            .client
            .validate()
            .context("Client configuration validation failed")?;
        Ok(wrapper.client)
    }
}
