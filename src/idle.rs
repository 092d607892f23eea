/// 空闲检测
///
/// 读空闲超时：对端长时间没有任何数据，关闭连接。
/// 写空闲超时：本端长时间没有写出数据，发送一次心跳。
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

use crate::channel::Activity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    ReaderIdle,
    WriterIdle,
}

/// 空闲阈值，`None` 表示不检测
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleConfig {
    pub read_idle: Option<Duration>,
    pub write_idle: Option<Duration>,
}

impl IdleConfig {
    pub fn new(read_idle: Option<Duration>, write_idle: Option<Duration>) -> Self {
        Self {
            read_idle,
            write_idle,
        }
    }

    /// 从秒数构造，0 表示不检测
    pub fn from_secs(read_idle_secs: u64, write_idle_secs: u64) -> Self {
        let to_duration = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        Self::new(to_duration(read_idle_secs), to_duration(write_idle_secs))
    }
}

pub struct IdleCheck {
    config: IdleConfig,
    activity: Arc<Activity>,
    reader_fired: Option<Instant>,
    writer_fired: Option<Instant>,
}

impl IdleCheck {
    pub fn new(config: IdleConfig, activity: Arc<Activity>) -> Self {
        Self {
            config,
            activity,
            reader_fired: None,
            writer_fired: None,
        }
    }

    /// 等待下一次空闲事件，可在 `tokio::select!` 中反复调用
    pub async fn tick(&mut self) -> IdleEvent {
        loop {
            let now = Instant::now();
            let mut deadline: Option<Instant> = None;

            if let Some(read_idle) = self.config.read_idle {
                let since = latest(self.activity.last_read(), self.reader_fired);
                let due = since + read_idle;
                if due <= now {
                    self.reader_fired = Some(now);
                    return IdleEvent::ReaderIdle;
                }
                deadline = Some(due);
            }

            if let Some(write_idle) = self.config.write_idle {
                let since = latest(self.activity.last_write(), self.writer_fired);
                let due = since + write_idle;
                if due <= now {
                    self.writer_fired = Some(now);
                    return IdleEvent::WriterIdle;
                }
                deadline = Some(deadline.map_or(due, |d| d.min(due)));
            }

            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        }
    }
}

fn latest(activity: Instant, fired: Option<Instant>) -> Instant {
    match fired {
        Some(fired) if fired > activity => fired,
        _ => activity,
    }
}
