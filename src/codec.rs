/// 隧道消息编解码器
///
/// 基于 `tokio_util::codec`，解码可跨任意次读取恢复：
/// 缓冲区不足一个完整帧时返回 `Ok(None)` 等待更多数据。
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TunnelError;
use crate::protocol::{
    MessageType, ProxyMessage, HEADER_SIZE, LENGTH_FIELD_SIZE, MAX_FRAME_LENGTH, MAX_URI_LENGTH,
};

#[derive(Debug, Clone, Copy)]
pub struct ProxyMessageCodec {
    max_frame_length: usize,
}

impl ProxyMessageCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    /// 指定最大帧长度（含 4 字节长度字段在内的整帧字节数）
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for ProxyMessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ProxyMessageCodec {
    type Item = ProxyMessage;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_FIELD_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_FIELD_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        // 长度字段一到就校验，不等待整帧；上限按整帧计，长度字段也算在内
        let total = LENGTH_FIELD_SIZE.saturating_add(length);
        if total > self.max_frame_length {
            return Err(TunnelError::FrameTooLarge {
                length: total,
                max: self.max_frame_length,
            });
        }
        if length < HEADER_SIZE {
            return Err(TunnelError::malformed(format!(
                "frame length {} shorter than header",
                length
            )));
        }

        if src.len() < LENGTH_FIELD_SIZE + length {
            src.reserve(LENGTH_FIELD_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let mut frame = src.split_to(length);

        let kind = MessageType::try_from(frame.get_u8())?;
        let serial_number = frame.get_u64();
        let uri_len = frame.get_u8() as usize;
        if uri_len > frame.len() {
            return Err(TunnelError::malformed(format!(
                "uri length {} overruns frame ({} bytes left)",
                uri_len,
                frame.len()
            )));
        }

        let uri_bytes = frame.split_to(uri_len);
        let uri = String::from_utf8(uri_bytes.to_vec())
            .map_err(|_| TunnelError::malformed("uri is not valid UTF-8"))?;

        Ok(Some(ProxyMessage {
            kind,
            serial_number,
            uri,
            data: frame.freeze(),
        }))
    }
}

impl Encoder<ProxyMessage> for ProxyMessageCodec {
    type Error = TunnelError;

    fn encode(&mut self, item: ProxyMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let uri_len = item.uri.len();
        if uri_len > MAX_URI_LENGTH {
            return Err(TunnelError::UriTooLong(uri_len));
        }

        let length = item.frame_length();
        let total = item.encoded_len();
        if total > self.max_frame_length {
            return Err(TunnelError::FrameTooLarge {
                length: total,
                max: self.max_frame_length,
            });
        }

        dst.reserve(total);
        dst.put_u32(length as u32);
        dst.put_u8(item.kind.as_u8());
        dst.put_u64(item.serial_number);
        dst.put_u8(uri_len as u8);
        dst.put_slice(item.uri.as_bytes());
        dst.put_slice(&item.data);
        Ok(())
    }
}
