use anyhow::{Context, Result};

use super::{validator::ConfigValidator, ClientConfig, ClientRecord, ServerConfig, ServerFullConfig};

/// ServerFullConfig Builder
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    bind_addr: Option<String>,
    bind_port: Option<u16>,
    read_idle_secs: Option<u64>,
    write_idle_secs: Option<u64>,
    clients: Vec<ClientRecord>,
}

impl ServerConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置绑定地址
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = Some(addr.into());
        self
    }

    /// 设置隧道协议端口
    pub fn bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }

    /// 设置读空闲超时
    pub fn read_idle_secs(mut self, secs: u64) -> Self {
        self.read_idle_secs = Some(secs);
        self
    }

    /// 设置写空闲心跳间隔
    pub fn write_idle_secs(mut self, secs: u64) -> Self {
        self.write_idle_secs = Some(secs);
        self
    }

    /// 添加客户端
    pub fn add_client(mut self, client: ClientRecord) -> Self {
        self.clients.push(client);
        self
    }

    /// 设置客户端列表
    pub fn clients(mut self, clients: Vec<ClientRecord>) -> Self {
        self.clients = clients;
        self
    }

    /// 构建配置
    pub fn build(self) -> Result<ServerFullConfig> {
        let mut server = ServerConfig::new(self.bind_port.context("bind_port is required")?);
        if let Some(addr) = self.bind_addr {
            server.bind_addr = addr;
        }
        if let Some(secs) = self.read_idle_secs {
            server.read_idle_secs = secs;
        }
        if let Some(secs) = self.write_idle_secs {
            server.write_idle_secs = secs;
        }

        let config = ServerFullConfig {
            server,
            clients: self.clients,
        };

        // 验证配置
        ConfigValidator::validate_server_full_config(&config)?;

        Ok(config)
    }
}

/// ClientConfig Builder
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    server_addr: Option<String>,
    server_port: Option<u16>,
    client_key: Option<String>,
    pool_capacity: Option<usize>,
    heartbeat_interval_secs: Option<u64>,
    read_idle_secs: Option<u64>,
    reconnect_delay_secs: Option<u64>,
}

impl ClientConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 以已有配置为基础（命令行参数覆盖文件配置时使用）
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            server_addr: Some(config.server_addr),
            server_port: Some(config.server_port),
            client_key: Some(config.client_key),
            pool_capacity: Some(config.pool_capacity),
            heartbeat_interval_secs: Some(config.heartbeat_interval_secs),
            read_idle_secs: Some(config.read_idle_secs),
            reconnect_delay_secs: Some(config.reconnect_delay_secs),
        }
    }

    /// 设置服务器地址
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.server_addr = Some(addr.into());
        self
    }

    /// 设置服务器端口
    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = Some(port);
        self
    }

    /// 设置客户端密钥
    pub fn client_key(mut self, key: impl Into<String>) -> Self {
        self.client_key = Some(key.into());
        self
    }

    /// 设置连接池容量
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    /// 设置心跳间隔
    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = Some(secs);
        self
    }

    /// 设置读空闲超时
    pub fn read_idle_secs(mut self, secs: u64) -> Self {
        self.read_idle_secs = Some(secs);
        self
    }

    /// 设置重连间隔
    pub fn reconnect_delay_secs(mut self, secs: u64) -> Self {
        self.reconnect_delay_secs = Some(secs);
        self
    }

    /// 构建配置
    pub fn build(self) -> Result<ClientConfig> {
        let config = ClientConfig {
            server_addr: self.server_addr.context("server_addr is required")?,
            server_port: self.server_port.context("server_port is required")?,
            client_key: self.client_key.context("client_key is required")?,
            pool_capacity: self.pool_capacity.unwrap_or_else(super::default_pool_capacity),
            heartbeat_interval_secs: self
                .heartbeat_interval_secs
                .unwrap_or_else(super::default_heartbeat_interval_secs),
            read_idle_secs: self
                .read_idle_secs
                .unwrap_or_else(super::default_client_read_idle_secs),
            reconnect_delay_secs: self
                .reconnect_delay_secs
                .unwrap_or_else(super::default_reconnect_delay_secs),
        };

        ConfigValidator::validate_client_config(&config)?;

        Ok(config)
    }
}
