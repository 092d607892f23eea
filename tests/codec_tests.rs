/// Framing tests: partial reads, random chunking and hostile input
use bytes::{Bytes, BytesMut};
use lanproxy::channel::{self, ChannelOptions, ReadEvent};
use lanproxy::protocol::{MessageType, ProxyMessage, MAX_FRAME_LENGTH};
use lanproxy::{ProxyMessageCodec, TunnelError};
use rand::{Rng, RngCore};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{Decoder, Encoder};

fn encode(msg: &ProxyMessage) -> BytesMut {
    let mut buf = BytesMut::new();
    ProxyMessageCodec::new()
        .encode(msg.clone(), &mut buf)
        .expect("encode");
    buf
}

fn random_message(rng: &mut impl Rng) -> ProxyMessage {
    let kinds = [
        MessageType::Auth,
        MessageType::Connect,
        MessageType::Disconnect,
        MessageType::Transfer,
        MessageType::Heartbeat,
    ];
    let kind = kinds[rng.random_range(0..kinds.len())];
    let uri_len = rng.random_range(0..=255);
    let uri: String = (0..uri_len)
        .map(|_| rng.random_range(b'a'..=b'z') as char)
        .collect();
    let mut data = vec![0u8; rng.random_range(0..4096)];
    rng.fill_bytes(&mut data);

    let mut msg = ProxyMessage::new(kind, uri, Bytes::from(data));
    msg.serial_number = rng.random();
    msg
}

#[test]
fn test_split_at_every_boundary() {
    let msg = ProxyMessage::connect_ack("12345", "agent-key");
    let mut with_data = ProxyMessage::transfer("7", Bytes::from_static(b"payload bytes"));
    with_data.serial_number = 99;

    for original in [msg, with_data] {
        let encoded = encode(&original);
        for split in 0..=encoded.len() {
            let mut codec = ProxyMessageCodec::new();
            let mut buf = BytesMut::from(&encoded[..split]);

            let first = codec.decode(&mut buf).unwrap();
            if split < encoded.len() {
                assert!(first.is_none(), "split {} decoded too early", split);
                buf.extend_from_slice(&encoded[split..]);
                let decoded = codec.decode(&mut buf).unwrap().expect("complete frame");
                assert_eq!(decoded, original);
            } else {
                assert_eq!(first.unwrap(), original);
            }
            assert!(buf.is_empty());
        }
    }
}

#[test]
fn test_random_chunking_preserves_stream() {
    let mut rng = rand::rng();
    let messages: Vec<ProxyMessage> = (0..64).map(|_| random_message(&mut rng)).collect();

    let mut wire = BytesMut::new();
    let mut codec = ProxyMessageCodec::new();
    for msg in &messages {
        codec.encode(msg.clone(), &mut wire).unwrap();
    }

    let mut decoded = Vec::new();
    let mut buf = BytesMut::new();
    let mut offset = 0;
    while offset < wire.len() {
        let step = rng.random_range(1..=512).min(wire.len() - offset);
        buf.extend_from_slice(&wire[offset..offset + step]);
        offset += step;
        while let Some(msg) = codec.decode(&mut buf).unwrap() {
            decoded.push(msg);
        }
    }

    assert_eq!(decoded, messages);
    assert!(buf.is_empty());
}

#[test]
fn test_empty_uri_and_data_decode_as_empty() {
    let original = ProxyMessage::heartbeat(3);
    let mut buf = encode(&original);
    let decoded = ProxyMessageCodec::new().decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded.uri, "");
    assert!(decoded.data.is_empty());
    assert_eq!(decoded.serial_number, 3);
}

#[test]
fn test_oversized_frame_rejected_before_payload() {
    let mut buf = BytesMut::new();
    // length 字段之外还有 4 字节前缀，整帧比上限多一个字节
    buf.extend_from_slice(&((MAX_FRAME_LENGTH - 3) as u32).to_be_bytes());
    buf.extend_from_slice(&[MessageType::Transfer.as_u8()]);

    match ProxyMessageCodec::new().decode(&mut buf) {
        Err(TunnelError::FrameTooLarge { length, max }) => {
            assert_eq!(length, MAX_FRAME_LENGTH + 1);
            assert_eq!(max, MAX_FRAME_LENGTH);
        }
        other => panic!("expected FrameTooLarge, got {:?}", other),
    }
}

#[test]
fn test_random_garbage_never_panics() {
    let mut rng = rand::rng();
    for _ in 0..500 {
        let mut garbage = vec![0u8; rng.random_range(0..64)];
        rng.fill_bytes(&mut garbage);
        let mut buf = BytesMut::from(&garbage[..]);
        let mut codec = ProxyMessageCodec::new();
        // Either a protocol error, a message, or a request for more data
        while let Ok(Some(_)) = codec.decode(&mut buf) {}
    }
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let (ours, mut theirs) = tokio::io::duplex(1024);
    let (_channel, mut pump) =
        channel::open::<_, _, ProxyMessage>(ours, ProxyMessageCodec::new(), ChannelOptions::default());

    let mut frame = Vec::new();
    frame.extend_from_slice(&(3u32 * 1024 * 1024).to_be_bytes());
    frame.extend_from_slice(&[MessageType::Transfer.as_u8(); 16]);
    theirs.write_all(&frame).await.unwrap();

    match tokio::time::timeout(Duration::from_secs(1), pump.next())
        .await
        .unwrap()
    {
        ReadEvent::Closed(Some(TunnelError::FrameTooLarge { .. })) => {}
        other => panic!("unexpected event: {:?}", other),
    }
}
