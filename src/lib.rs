/// lanproxy 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod channel;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod idle;
pub mod net;
pub mod pairing;
pub mod protocol;
pub mod server;
pub mod stats;

// 重新导出常用类型
pub use channel::{Channel, ChannelId, ChannelOptions, ReadEvent};
pub use client::{run_client, Client, ClientChannelRegistry, LinkConnector};
pub use codec::ProxyMessageCodec;
pub use config::{AppConfig, ClientConfig, ProxyMappings, ServerConfig, ServerFullConfig};
pub use error::{Result, TunnelError};
pub use protocol::{MessageType, ProxyMessage};
pub use server::{run_server, Server, ServerChannelRegistry, ServerState};
pub use stats::{PortStats, StatsManager};
