use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, ReadHalf};
use tokio_util::codec::BytesCodec;
use tracing::debug;

use super::registry::ClientChannelRegistry;
use crate::channel::{Channel, Pump, ReadEvent};
use crate::protocol::ProxyMessage;

/// 后端连接的转发任务
///
/// 后端数据包装为 TRANSFER 写到配对的隧道连接；后端不可写时暂停隧道连接的读泵。
/// 后端关闭时通知隧道连接 DISCONNECT，并把隧道连接归还空闲池。
pub(crate) async fn run_backend<S>(
    registry: Arc<ClientChannelRegistry>,
    backend: Channel<Bytes>,
    mut pump: Pump<ReadHalf<S>, BytesCodec>,
) where
    S: AsyncRead + Send + 'static,
{
    loop {
        match pump.next().await {
            ReadEvent::Item(data) => {
                let Some(pairing) = registry.pairings().by_peer(backend.id()) else {
                    debug!("Backend {} has no link, closing", backend.id());
                    break;
                };
                pairing
                    .link
                    .send(ProxyMessage::transfer(pairing.user_id, data.freeze()));
            }
            ReadEvent::Writability(writable) => {
                if let Some(pairing) = registry.pairings().by_peer(backend.id()) {
                    pairing.link.set_auto_read(writable);
                }
            }
            ReadEvent::Closed(err) => {
                if let Some(e) = err {
                    debug!("Backend {} error: {}", backend.id(), e);
                }
                break;
            }
        }
    }

    backend.close_after_flush();
    let user_id = registry.backend_user_id(backend.id());
    if let Some(user_id) = &user_id {
        registry.remove_backend(user_id, backend.id());
    }
    if let Some(pairing) = registry.pairings().unbind_peer(backend.id()) {
        debug!(
            "Backend {} for user {} closed, releasing link {}",
            backend.id(),
            pairing.user_id,
            pairing.link.id()
        );
        pairing.link.send(ProxyMessage::disconnect(pairing.user_id));
        registry.return_link(pairing.link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{open, ChannelOptions};
    use crate::codec::ProxyMessageCodec;
    use crate::pairing::Pairing;
    use crate::protocol::MessageType;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;
    use tokio_util::codec::FramedRead;

    #[tokio::test]
    async fn test_backend_data_and_close_reach_link() {
        let registry = Arc::new(ClientChannelRegistry::default());

        let (link_side, server_side) = tokio::io::duplex(4096);
        let (link, _link_pump) =
            open::<_, _, ProxyMessage>(link_side, ProxyMessageCodec::new(), ChannelOptions::default());
        let mut server_frames = FramedRead::new(server_side, ProxyMessageCodec::new());

        let (backend_side, mut service) = tokio::io::duplex(4096);
        let (backend, pump) = open::<_, _, Bytes>(backend_side, BytesCodec::new(), ChannelOptions::default());

        registry
            .pairings()
            .bind(Pairing::new(link.clone(), backend.clone(), "42"));
        registry.register_backend("42", backend.clone());
        let task = tokio::spawn(run_backend(registry.clone(), backend.clone(), pump));

        service.write_all(b"hello").await.unwrap();
        let msg = timeout(Duration::from_secs(1), server_frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind, MessageType::Transfer);
        assert_eq!(msg.uri, "42");
        assert_eq!(&msg.data[..], b"hello");

        drop(service);
        let msg = timeout(Duration::from_secs(1), server_frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind, MessageType::Disconnect);
        assert_eq!(msg.uri, "42");

        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(registry.backend("42").is_none());
        assert!(registry.pairings().is_empty());
        assert_eq!(registry.idle_link_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_backend_pauses_link_reads() {
        const CHUNK: usize = 8 * 1024;
        const COUNT: usize = 32;

        let registry = Arc::new(ClientChannelRegistry::default());
        let (link_side, _server_side) = tokio::io::duplex(4096);
        let (link, _link_pump) =
            open::<_, _, ProxyMessage>(link_side, ProxyMessageCodec::new(), ChannelOptions::default());

        let (backend_side, mut service) = tokio::io::duplex(4096);
        let (backend, pump) = open::<_, _, Bytes>(backend_side, BytesCodec::new(), ChannelOptions::default());
        registry
            .pairings()
            .bind(Pairing::new(link.clone(), backend.clone(), "8"));
        registry.register_backend("8", backend.clone());
        tokio::spawn(run_backend(registry.clone(), backend.clone(), pump));

        // 后端服务不读，后端连接排队超过高水位
        for _ in 0..COUNT {
            backend.send(Bytes::from(vec![1u8; CHUNK]));
        }
        assert!(!backend.is_writable());
        assert!(eventually(|| !link.is_auto_read()).await, "Link reads should pause");

        let mut drained = vec![0u8; CHUNK * COUNT];
        timeout(Duration::from_secs(2), service.read_exact(&mut drained))
            .await
            .unwrap()
            .unwrap();
        assert!(drained.iter().all(|&b| b == 1));
        assert!(eventually(|| link.is_auto_read()).await, "Link reads should resume");
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }
}
