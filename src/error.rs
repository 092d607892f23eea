/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，协议层、注册表和引擎都返回它，
/// 二进制入口再用 anyhow 包装上下文
use std::io;
use thiserror::Error;

/// lanproxy 的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 帧长度超过上限
    #[error("Frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// 未知的消息类型字节
    #[error("Unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    /// 帧结构错误（长度不足、uri 越界、非 UTF-8 等）
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// uri 超过 255 字节
    #[error("URI too long: {0} bytes (max 255)")]
    UriTooLong(usize),

    /// 当前会话状态下不应收到的消息
    #[error("Unexpected {kind} message in state {state}")]
    UnexpectedMessage { kind: String, state: String },

    /// 认证被拒绝
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 消息引用的 userId / clientKey 在注册表中不存在
    #[error("Pairing miss: {0}")]
    PairingMiss(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 连接已关闭
    #[error("Channel closed")]
    ChannelClosed,

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建认证失败错误
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建帧结构错误
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    /// 创建状态不匹配错误
    pub fn unexpected(kind: impl ToString, state: impl Into<String>) -> Self {
        Self::UnexpectedMessage {
            kind: kind.to_string(),
            state: state.into(),
        }
    }

    /// 创建配对缺失错误
    pub fn pairing_miss(msg: impl Into<String>) -> Self {
        Self::PairingMiss(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 是否为协议层错误（收到后直接关闭连接，不回复）
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. }
                | Self::UnknownMessageType(_)
                | Self::MalformedFrame(_)
                | Self::UriTooLong(_)
                | Self::UnexpectedMessage { .. }
        )
    }

    /// 是否为配对缺失（记录后丢弃消息，连接保持）
    pub fn is_pairing_miss(&self) -> bool {
        matches!(self, Self::PairingMiss(_))
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为认证失败
    pub fn is_auth_failed(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_))
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_creation() {
        let err = TunnelError::auth_failed("duplicate client key");
        assert!(err.is_auth_failed());
        assert_eq!(
            err.to_string(),
            "Authentication failed: duplicate client key"
        );
    }

    #[test]
    fn test_protocol_errors() {
        let too_large = TunnelError::FrameTooLarge {
            length: 3 * 1024 * 1024,
            max: 2 * 1024 * 1024,
        };
        assert!(too_large.is_protocol_error());
        assert!(too_large.to_string().contains("exceeds maximum"));

        let unknown = TunnelError::UnknownMessageType(0x42);
        assert!(unknown.is_protocol_error());
        assert_eq!(unknown.to_string(), "Unknown message type: 0x42");

        assert!(TunnelError::UriTooLong(300).is_protocol_error());
        assert!(TunnelError::unexpected("AUTH", "Authenticated").is_protocol_error());
        assert!(TunnelError::malformed("short").is_protocol_error());
        assert!(!TunnelError::pairing_miss("user 7").is_protocol_error());
        assert!(TunnelError::pairing_miss("user 7").is_pairing_miss());
    }

    #[test]
    fn test_connection_failed() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = TunnelError::connection_failed("127.0.0.1:8080", io_err);
        assert!(err.to_string().contains("Failed to connect"));
        assert!(err.to_string().contains("127.0.0.1:8080"));
    }

    #[test]
    fn test_error_is_checks() {
        let auth_err = TunnelError::auth_failed("test");
        let config_err = TunnelError::config_error("test");
        let timeout_err = TunnelError::timeout(Duration::from_secs(1));

        assert!(auth_err.is_auth_failed());
        assert!(!auth_err.is_config_error());
        assert!(!auth_err.is_timeout());

        assert!(config_err.is_config_error());
        assert!(!config_err.is_auth_failed());

        assert!(timeout_err.is_timeout());
        assert!(!timeout_err.is_auth_failed());
    }
}
