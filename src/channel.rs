/// 连接句柄
///
/// 每条 TCP 连接被拆成两部分：
///
/// - [`Channel`]：可克隆的写端句柄，放进注册表供其他连接的任务使用。
///   写入走无界队列，由独立的写任务按顺序落到 socket；排队字节数超过
///   高水位时连接变为不可写，回落到低水位以下恢复可写。
/// - [`Pump`]：读端，只归处理该连接的任务所有。读泵可以被暂停
///   （`set_auto_read(false)`），暂停期间不从 socket 读取任何数据，
///   交由 TCP 自身的流控向对端施压。
///
/// 可写性变化通过 [`ReadEvent::Writability`] 通知连接自身的处理任务，
/// 由它去暂停/恢复配对连接的读泵，形成双向背压链。
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TunnelError;
use crate::protocol::ProxyMessage;

/// 进程内唯一的连接标识
pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 默认高水位（字节）
pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;
/// 默认低水位（字节）
pub const DEFAULT_LOW_WATERMARK: usize = 32 * 1024;

/// 出站条目计入水位的字节数
pub trait Weighted {
    fn weight(&self) -> usize;
}

impl Weighted for Bytes {
    fn weight(&self) -> usize {
        self.len()
    }
}

impl Weighted for ProxyMessage {
    fn weight(&self) -> usize {
        self.encoded_len()
    }
}

/// 连接选项
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// 初始是否开启读泵
    pub auto_read: bool,
    pub high_watermark: usize,
    pub low_watermark: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            auto_read: true,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
        }
    }
}

impl ChannelOptions {
    /// 读泵初始关闭的连接（等待配对完成后再开启）
    pub fn paused() -> Self {
        Self {
            auto_read: false,
            ..Self::default()
        }
    }
}

/// 最近一次读/写的时间，供空闲检测使用
#[derive(Debug)]
pub struct Activity {
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
        }
    }

    pub fn last_read(&self) -> Instant {
        *self.last_read.lock()
    }

    pub fn last_write(&self) -> Instant {
        *self.last_write.lock()
    }

    fn touch_read(&self) {
        *self.last_read.lock() = Instant::now();
    }

    fn touch_write(&self) {
        *self.last_write.lock() = Instant::now();
    }
}

struct Shared {
    id: ChannelId,
    pending: AtomicUsize,
    high_watermark: usize,
    low_watermark: usize,
    writable: watch::Sender<bool>,
    auto_read: watch::Sender<bool>,
    closed: CancellationToken,
    activity: Arc<Activity>,
}

impl Shared {
    fn reserve(&self, weight: usize) {
        let pending = self.pending.fetch_add(weight, Ordering::AcqRel) + weight;
        if pending > self.high_watermark {
            self.set_writable(false);
            // 写任务可能已在 fetch_add 之后把队列清空
            if self.pending.load(Ordering::Acquire) <= self.low_watermark {
                self.set_writable(true);
            }
        }
    }

    fn release(&self, weight: usize) {
        let previous = self.pending.fetch_sub(weight, Ordering::AcqRel);
        if previous.saturating_sub(weight) <= self.low_watermark {
            self.set_writable(true);
        }
    }

    fn set_writable(&self, value: bool) {
        self.writable.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }
}

enum Outbound<T> {
    Item(T),
    Close,
}

/// 连接的写端句柄
pub struct Channel<T> {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Outbound<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("active", &self.is_active())
            .field("pending", &self.pending_bytes())
            .finish()
    }
}

impl<T> Channel<T> {
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// 连接是否仍然打开
    pub fn is_active(&self) -> bool {
        !self.shared.closed.is_cancelled()
    }

    /// 排队字节数是否低于高水位
    pub fn is_writable(&self) -> bool {
        *self.shared.writable.borrow()
    }

    /// 已排队但尚未写入 socket 的字节数
    pub fn pending_bytes(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// 开启/暂停读泵
    pub fn set_auto_read(&self, enabled: bool) {
        self.shared.auto_read.send_if_modified(|current| {
            if *current == enabled {
                false
            } else {
                *current = enabled;
                true
            }
        });
    }

    pub fn is_auto_read(&self) -> bool {
        *self.shared.auto_read.borrow()
    }

    /// 先写完已排队的数据再关闭
    pub fn close_after_flush(&self) {
        if self.tx.send(Outbound::Close).is_err() {
            self.shared.closed.cancel();
        }
    }

    /// 立即关闭，丢弃未写出的数据
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    /// 等待连接关闭
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub fn activity(&self) -> Arc<Activity> {
        self.shared.activity.clone()
    }
}

impl<T: Weighted> Channel<T> {
    /// 排队写入，连接已关闭时返回 false
    pub fn send(&self, item: T) -> bool {
        if !self.is_active() {
            return false;
        }
        self.shared.reserve(item.weight());
        self.tx.send(Outbound::Item(item)).is_ok()
    }
}

/// 读端事件
#[derive(Debug)]
pub enum ReadEvent<T> {
    /// 读到一个完整条目
    Item(T),
    /// 本连接的可写性发生变化
    Writability(bool),
    /// 连接关闭；对端正常关闭或本端关闭时为 `None`
    Closed(Option<TunnelError>),
}

/// 连接的读端
pub struct Pump<R, C> {
    frames: FramedRead<R, C>,
    shared: Arc<Shared>,
    writable: watch::Receiver<bool>,
    gate: watch::Receiver<bool>,
}

impl<R, C> Pump<R, C>
where
    R: AsyncRead + Unpin,
    C: Decoder + Unpin,
    C::Error: Into<TunnelError>,
{
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// 等待下一个事件
    ///
    /// 读泵暂停时只等待关闭与可写性变化。可在 `tokio::select!` 中使用。
    pub async fn next(&mut self) -> ReadEvent<C::Item> {
        loop {
            let open = *self.gate.borrow_and_update();
            tokio::select! {
                biased;
                _ = self.shared.closed.cancelled() => return ReadEvent::Closed(None),
                changed = self.writable.changed() => {
                    if changed.is_err() {
                        return ReadEvent::Closed(None);
                    }
                    let writable = *self.writable.borrow_and_update();
                    return ReadEvent::Writability(writable);
                }
                changed = self.gate.changed() => {
                    if changed.is_err() {
                        return ReadEvent::Closed(None);
                    }
                }
                frame = self.frames.next(), if open => {
                    return match frame {
                        Some(Ok(item)) => {
                            self.shared.activity.touch_read();
                            ReadEvent::Item(item)
                        }
                        Some(Err(e)) => ReadEvent::Closed(Some(e.into())),
                        None => ReadEvent::Closed(None),
                    };
                }
            }
        }
    }
}

/// 拆分连接并启动写任务
pub fn open<S, C, T>(
    stream: S,
    codec: C,
    options: ChannelOptions,
) -> (Channel<T>, Pump<ReadHalf<S>, C>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    C: Decoder + Encoder<T> + Clone + Unpin + Send + 'static,
    <C as Encoder<T>>::Error: fmt::Display,
    T: Weighted + Send + 'static,
{
    let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
    let (writable_tx, writable_rx) = watch::channel(true);
    let (auto_read_tx, gate_rx) = watch::channel(options.auto_read);

    let shared = Arc::new(Shared {
        id,
        pending: AtomicUsize::new(0),
        high_watermark: options.high_watermark,
        low_watermark: options.low_watermark.min(options.high_watermark),
        writable: writable_tx,
        auto_read: auto_read_tx,
        closed: CancellationToken::new(),
        activity: Arc::new(Activity::new()),
    });

    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();

    let sink = FramedWrite::new(write_half, codec.clone());
    tokio::spawn(write_loop(sink, rx, shared.clone()));

    let pump = Pump {
        frames: FramedRead::new(read_half, codec),
        shared: shared.clone(),
        writable: writable_rx,
        gate: gate_rx,
    };

    (Channel { shared, tx }, pump)
}

async fn write_loop<S, C, T>(
    mut sink: FramedWrite<WriteHalf<S>, C>,
    mut rx: mpsc::UnboundedReceiver<Outbound<T>>,
    shared: Arc<Shared>,
) where
    S: AsyncWrite,
    C: Encoder<T> + Unpin,
    C::Error: fmt::Display,
    T: Weighted,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            next = rx.recv() => next,
        };

        match next {
            Some(Outbound::Item(item)) => {
                let weight = item.weight();
                let result = tokio::select! {
                    _ = shared.closed.cancelled() => break,
                    result = sink.send(item) => result,
                };
                shared.release(weight);
                shared.activity.touch_write();
                if let Err(e) = result {
                    debug!("Channel {} write failed: {}", shared.id, e);
                    break;
                }
            }
            Some(Outbound::Close) | None => {
                tokio::select! {
                    _ = shared.closed.cancelled() => {}
                    result = sink.close() => {
                        if let Err(e) = result {
                            debug!("Channel {} shutdown failed: {}", shared.id, e);
                        }
                    }
                }
                break;
            }
        }
    }

    trace!("Channel {} writer finished", shared.id);
    shared.closed.cancel();
}
