use anyhow::{bail, Result};
use std::collections::HashSet;
use tracing::warn;

use crate::protocol::MAX_URI_LENGTH;

use super::{ClientConfig, ClientRecord, ServerConfig, ServerFullConfig};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证客户端密钥
    pub fn validate_client_key(key: &str, context: &str) -> Result<()> {
        if key.trim().is_empty() {
            bail!("{}: client_key cannot be empty", context);
        }
        // 配对确认 uri 为 "userId@clientKey"，userId 最长 20 位
        let max_len = MAX_URI_LENGTH - 21;
        if key.len() > max_len {
            bail!("{}: client_key longer than {} bytes", context, max_len);
        }
        Ok(())
    }

    /// 验证内网地址 "host:port"
    pub fn validate_lan(lan: &str, context: &str) -> Result<()> {
        let Some((host, port)) = lan.rsplit_once(':') else {
            bail!("{}: lan '{}' must be in host:port form", context, lan);
        };
        if host.trim().is_empty() {
            bail!("{}: lan '{}' has an empty host", context, lan);
        }
        match port.parse::<u16>() {
            Ok(0) | Err(_) => bail!("{}: lan '{}' has an invalid port", context, lan),
            Ok(_) => Ok(()),
        }
    }

    /// 验证服务器配置
    pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
        Self::validate_address(&config.bind_addr, "Server bind_addr")?;
        Self::validate_port(config.bind_port, "Server bind_port")?;

        if config.read_idle_secs > 0
            && config.write_idle_secs > 0
            && config.write_idle_secs >= config.read_idle_secs
        {
            warn!(
                "write_idle_secs ({}) is not below read_idle_secs ({}), \
                 peers may time out before a heartbeat is sent",
                config.write_idle_secs, config.read_idle_secs
            );
        }
        Ok(())
    }

    /// 验证客户端列表：密钥唯一，启用的对外端口唯一
    pub fn validate_clients(clients: &[ClientRecord], bind_port: Option<u16>) -> Result<()> {
        let mut seen_keys = HashSet::new();
        let mut seen_ports = HashSet::new();

        for client in clients {
            let context = format!("Client '{}'", client.name);
            Self::validate_client_key(&client.client_key, &context)?;

            if !seen_keys.insert(client.client_key.as_str()) {
                bail!(
                    "Duplicate client_key '{}': each client must use a different key",
                    client.client_key
                );
            }

            for mapping in client.proxy_mappings.iter().filter(|m| m.is_enabled()) {
                Self::validate_port(mapping.inet_port, &context)?;
                Self::validate_lan(&mapping.lan, &context)?;

                if Some(mapping.inet_port) == bind_port {
                    bail!(
                        "{}: inet_port {} conflicts with the tunnel bind_port",
                        context,
                        mapping.inet_port
                    );
                }

                if !seen_ports.insert(mapping.inet_port) {
                    bail!(
                        "Duplicate inet_port {}: each mapping must use a different port",
                        mapping.inet_port
                    );
                }
            }
        }

        Ok(())
    }

    /// 验证服务器完整配置
    pub fn validate_server_full_config(config: &ServerFullConfig) -> Result<()> {
        Self::validate_server_config(&config.server)?;
        Self::validate_clients(&config.clients, Some(config.server.bind_port))?;

        if config.clients.is_empty() {
            warn!("No clients configured; every agent will be recorded as unregistered");
        }
        Ok(())
    }

    /// 验证客户端配置
    pub fn validate_client_config(config: &ClientConfig) -> Result<()> {
        Self::validate_address(&config.server_addr, "Client server_addr")?;
        Self::validate_port(config.server_port, "Client server_port")?;
        Self::validate_client_key(&config.client_key, "Client")?;

        if config.pool_capacity == 0 {
            bail!("pool_capacity must be greater than 0");
        }
        if config.heartbeat_interval_secs == 0 {
            bail!("heartbeat_interval_secs must be greater than 0");
        }
        if config.read_idle_secs > 0 && config.read_idle_secs <= config.heartbeat_interval_secs {
            warn!(
                "read_idle_secs ({}) should be larger than heartbeat_interval_secs ({})",
                config.read_idle_secs, config.heartbeat_interval_secs
            );
        }
        Ok(())
    }
}
