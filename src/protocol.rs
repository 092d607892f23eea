/// 隧道协议消息定义
///
/// 帧格式（大端）：
///
/// ```text
/// [u32 length][u8 type][u64 serial_number][u8 uri_len][uri][data]
/// ```
///
/// `length` 计算其后全部字节，即 `10 + uri_len + data.len()`。
use bytes::Bytes;
use std::fmt;

use crate::error::TunnelError;

/// 帧长度字段自身占用的字节数
pub const LENGTH_FIELD_SIZE: usize = 4;
/// type(1) + serial_number(8) + uri_len(1)
pub const HEADER_SIZE: usize = 10;
/// 默认最大帧长度（整帧字节数，含长度字段）
pub const MAX_FRAME_LENGTH: usize = 2 * 1024 * 1024;
/// uri 最大字节数（由一字节长度字段决定）
pub const MAX_URI_LENGTH: usize = u8::MAX as usize;

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// 客户端认证，uri 为 client key
    Auth = 0x01,
    /// 建立连接：服务器→客户端 data 为 "host:port"；客户端→服务器 uri 为 "userId@clientKey"
    Connect = 0x03,
    /// 断开连接，uri 为 userId
    Disconnect = 0x04,
    /// 数据转发，uri 为 userId
    Transfer = 0x05,
    /// 保留类型，从不发送
    WriteControl = 0x06,
    /// 心跳
    Heartbeat = 0x07,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Auth),
            0x03 => Ok(Self::Connect),
            0x04 => Ok(Self::Disconnect),
            0x05 => Ok(Self::Transfer),
            0x06 => Ok(Self::WriteControl),
            0x07 => Ok(Self::Heartbeat),
            other => Err(TunnelError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auth => "AUTH",
            Self::Connect => "CONNECT",
            Self::Disconnect => "DISCONNECT",
            Self::Transfer => "TRANSFER",
            Self::WriteControl => "WRITE_CONTROL",
            Self::Heartbeat => "HEARTBEAT",
        };
        f.write_str(name)
    }
}

/// 隧道上传输的唯一消息单元
///
/// `uri` 和 `data` 缺省时为空而不是 `None`，解码结果与编码前完全一致。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyMessage {
    pub kind: MessageType,
    /// 仅作参考，心跳回复时原样带回，其余情况为 0
    pub serial_number: u64,
    pub uri: String,
    pub data: Bytes,
}

impl ProxyMessage {
    pub fn new(kind: MessageType, uri: impl Into<String>, data: Bytes) -> Self {
        Self {
            kind,
            serial_number: 0,
            uri: uri.into(),
            data,
        }
    }

    /// 心跳消息
    pub fn heartbeat(serial_number: u64) -> Self {
        Self {
            serial_number,
            ..Self::new(MessageType::Heartbeat, String::new(), Bytes::new())
        }
    }

    /// 认证消息
    pub fn auth(client_key: impl Into<String>) -> Self {
        Self::new(MessageType::Auth, client_key, Bytes::new())
    }

    /// 服务器请求客户端连接后端：uri 为 userId，data 为后端地址
    pub fn connect_request(user_id: &str, lan: &str) -> Self {
        Self::new(
            MessageType::Connect,
            user_id,
            Bytes::copy_from_slice(lan.as_bytes()),
        )
    }

    /// 客户端在隧道连接上回复的配对确认："userId@clientKey"
    pub fn connect_ack(user_id: &str, client_key: &str) -> Self {
        Self::new(
            MessageType::Connect,
            format!("{}@{}", user_id, client_key),
            Bytes::new(),
        )
    }

    pub fn disconnect(user_id: impl Into<String>) -> Self {
        Self::new(MessageType::Disconnect, user_id, Bytes::new())
    }

    pub fn transfer(user_id: impl Into<String>, data: Bytes) -> Self {
        Self::new(MessageType::Transfer, user_id, data)
    }

    /// length 字段的取值
    pub fn frame_length(&self) -> usize {
        HEADER_SIZE + self.uri.len() + self.data.len()
    }

    /// 编码后在线路上占用的总字节数
    pub fn encoded_len(&self) -> usize {
        LENGTH_FIELD_SIZE + self.frame_length()
    }
}

/// 解析配对确认 uri "userId@clientKey"
pub fn parse_connect_ack(uri: &str) -> Option<(&str, &str)> {
    let (user_id, client_key) = uri.split_once('@')?;
    if user_id.is_empty() || client_key.is_empty() {
        return None;
    }
    Some((user_id, client_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_codes() {
        assert_eq!(MessageType::Auth.as_u8(), 0x01);
        assert_eq!(MessageType::Heartbeat.as_u8(), 0x07);
        assert_eq!(MessageType::try_from(0x05).unwrap(), MessageType::Transfer);
        assert!(matches!(
            MessageType::try_from(0x02),
            Err(TunnelError::UnknownMessageType(0x02))
        ));
        assert!(MessageType::try_from(0x00).is_err());
    }

    #[test]
    fn test_frame_length() {
        let msg = ProxyMessage::transfer("12", Bytes::from_static(b"hello"));
        assert_eq!(msg.frame_length(), 10 + 2 + 5);
        assert_eq!(msg.encoded_len(), 4 + 17);

        let hb = ProxyMessage::heartbeat(9);
        assert_eq!(hb.frame_length(), HEADER_SIZE);
        assert_eq!(hb.serial_number, 9);
        assert!(hb.uri.is_empty());
        assert!(hb.data.is_empty());
    }

    #[test]
    fn test_connect_messages() {
        let req = ProxyMessage::connect_request("3", "127.0.0.1:80");
        assert_eq!(req.kind, MessageType::Connect);
        assert_eq!(req.uri, "3");
        assert_eq!(&req.data[..], b"127.0.0.1:80");

        let ack = ProxyMessage::connect_ack("3", "abc");
        assert_eq!(ack.uri, "3@abc");
        assert!(ack.data.is_empty());
    }

    #[test]
    fn test_parse_connect_ack() {
        assert_eq!(parse_connect_ack("7@key"), Some(("7", "key")));
        assert_eq!(parse_connect_ack("7@key@x"), Some(("7", "key@x")));
        assert_eq!(parse_connect_ack("7"), None);
        assert_eq!(parse_connect_ack("@key"), None);
        assert_eq!(parse_connect_ack("7@"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(MessageType::Disconnect.to_string(), "DISCONNECT");
        assert_eq!(MessageType::WriteControl.to_string(), "WRITE_CONTROL");
    }
}
