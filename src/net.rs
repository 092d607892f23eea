use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::warn;

use crate::error::{Result, TunnelError};

/// 默认建连超时
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP keepalive 参数
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    /// 首次探测时间
    pub time: Option<Duration>,
    /// 探测间隔
    pub interval: Option<Duration>,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            time: Some(Duration::from_secs(30)),
            interval: Some(Duration::from_secs(10)),
        }
    }
}

/// 建立出站 TCP 连接，带超时并设置 nodelay / keepalive
pub async fn connect_tcp(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::timeout(connect_timeout))?
        .map_err(|e| TunnelError::connection_failed(addr, e))?;
    prepare_stream(&stream, &KeepaliveConfig::default());
    Ok(stream)
}

/// 设置 nodelay 与 keepalive，失败只记录日志
pub fn prepare_stream(stream: &TcpStream, keepalive: &KeepaliveConfig) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on {}: {}", peer_label(stream), e);
    }

    if keepalive.time.is_none() && keepalive.interval.is_none() {
        return;
    }

    let mut ka = TcpKeepalive::new();
    if let Some(time) = keepalive.time {
        ka = ka.with_time(time);
    }
    if let Some(interval) = keepalive.interval {
        ka = ka.with_interval(interval);
    }

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&ka) {
        warn!("Failed to set TCP keepalive on {}: {}", peer_label(stream), e);
    }
}

fn peer_label(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into())
}
