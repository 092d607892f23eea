use std::time::Duration;

use crate::config::ClientConfig;
use crate::idle::IdleConfig;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "LANPROXY_";

/// 重连延迟（秒），环境变量 LANPROXY_RECONNECT_DELAY_SECS 优先于配置文件
pub fn get_reconnect_delay(config: &ClientConfig) -> u64 {
    std::env::var(format!("{}RECONNECT_DELAY_SECS", ENV_PREFIX))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(config.reconnect_delay_secs)
}

/// 控制连接与隧道连接共用的空闲检测参数：写空闲即发送心跳
pub fn idle_config(config: &ClientConfig) -> IdleConfig {
    IdleConfig::from_secs(config.read_idle_secs, config.heartbeat_interval_secs)
}

pub fn reconnect_delay(config: &ClientConfig) -> Duration {
    Duration::from_secs(get_reconnect_delay(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_config_from_client_config() {
        let mut config = ClientConfig::builder()
            .server_addr("127.0.0.1")
            .server_port(4900)
            .client_key("k")
            .build()
            .unwrap();
        config.heartbeat_interval_secs = 30;
        config.read_idle_secs = 0;

        let idle = idle_config(&config);
        assert_eq!(idle.write_idle, Some(Duration::from_secs(30)));
        assert_eq!(idle.read_idle, None);
    }
}
