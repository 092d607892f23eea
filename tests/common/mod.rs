//! Common utilities for integration tests
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use lanproxy::config::{ClientConfig, ClientRecord, ServerConfig, ServerFullConfig};
use lanproxy::protocol::ProxyMessage;
use lanproxy::{Client, ProxyMessageCodec, Server, ServerState};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Create a simple echo server for testing
pub async fn start_echo_server(port: u16) -> JoinHandle<()> {
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind echo server");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 8192];
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => break, // Connection closed
                                Ok(n) => {
                                    if socket.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    })
}

/// Test data transmission through proxy
pub async fn test_proxy_connection(
    proxy_port: u16,
    test_data: &[u8],
    timeout_duration: Duration,
) -> Result<Vec<u8>, String> {
    timeout(timeout_duration, async {
        let mut stream = TcpStream::connect(format!("127.0.0.1:{}", proxy_port))
            .await
            .map_err(|e| format!("Failed to connect to proxy: {}", e))?;

        stream
            .write_all(test_data)
            .await
            .map_err(|e| format!("Failed to write data: {}", e))?;

        let mut response = Vec::new();
        let mut buf = vec![0u8; 8192];

        while response.len() < test_data.len() {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(e) => return Err(format!("Failed to read response: {}", e)),
            }
        }

        Ok(response)
    })
    .await
    .map_err(|_| "Timeout waiting for response".to_string())?
}

/// Wait for server to be ready
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Poll until `check` holds or the timeout expires
pub async fn wait_until<F>(mut check: F, limit: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Server config on 127.0.0.1 with the given clients
pub fn server_config(bind_port: u16, clients: Vec<ClientRecord>) -> ServerFullConfig {
    ServerConfig::builder()
        .bind_addr("127.0.0.1")
        .bind_port(bind_port)
        .clients(clients)
        .build()
        .expect("Invalid server config")
}

pub fn client_config(server_port: u16, client_key: &str) -> ClientConfig {
    ClientConfig::builder()
        .server_addr("127.0.0.1")
        .server_port(server_port)
        .client_key(client_key)
        .reconnect_delay_secs(1)
        .build()
        .expect("Invalid client config")
}

pub struct TestServer {
    pub state: Arc<ServerState>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bind and run a server in the background
pub async fn start_server(config: ServerFullConfig) -> TestServer {
    let server = Server::bind(config).await.expect("Failed to bind server");
    let state = server.state();
    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(async move {
        server.run().await.ok();
    });
    TestServer {
        state,
        shutdown,
        handle,
    }
}

pub struct TestClient {
    pub client: Arc<Client>,
    pub handle: JoinHandle<()>,
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.client.shutdown();
    }
}

/// Run a client agent in the background
pub fn start_client(config: ClientConfig) -> TestClient {
    let client = Arc::new(Client::new(config));
    let runner = client.clone();
    let handle = tokio::spawn(async move {
        runner.run().await.ok();
    });
    TestClient { client, handle }
}

pub type Frames = Framed<TcpStream, ProxyMessageCodec>;

/// Open a raw protocol connection to the tunnel port
pub async fn connect_frames(server_port: u16) -> Frames {
    let stream = TcpStream::connect(format!("127.0.0.1:{}", server_port))
        .await
        .expect("Failed to connect to tunnel port");
    Framed::new(stream, ProxyMessageCodec::new())
}

/// Connect a hand-driven agent control session
pub async fn fake_agent(server_port: u16, client_key: &str) -> Frames {
    let mut control = connect_frames(server_port).await;
    control
        .send(ProxyMessage::auth(client_key))
        .await
        .expect("Failed to send AUTH");
    control
}

/// Open a link and acknowledge the pairing for `user_id`
pub async fn fake_link(server_port: u16, user_id: &str, client_key: &str) -> Frames {
    let mut link = connect_frames(server_port).await;
    link.send(ProxyMessage::connect_ack(user_id, client_key))
        .await
        .expect("Failed to send CONNECT ack");
    link
}

/// Next message, skipping heartbeats
pub async fn next_message(frames: &mut Frames, limit: Duration) -> Option<ProxyMessage> {
    loop {
        match timeout(limit, frames.next()).await {
            Ok(Some(Ok(msg))) if msg.kind == lanproxy::MessageType::Heartbeat => continue,
            Ok(Some(Ok(msg))) => return Some(msg),
            _ => return None,
        }
    }
}

/// True once the peer has closed the stream
pub async fn is_closed(stream: &mut TcpStream, limit: Duration) -> bool {
    let mut buf = [0u8; 1024];
    loop {
        match timeout(limit, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
            Err(_) => return false,
        }
    }
}
