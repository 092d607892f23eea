use anyhow::{Context, Result};
use clap::Parser;
use lanproxy::cli::{Cli, Commands};
use lanproxy::config::{AppConfig, ClientConfig, ClientConfigBuilder};
use lanproxy::{client, server};
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG overrides --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("lanproxy v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Check { config } => check_config(&config),
        Commands::Server { config } => {
            info!("Loading server configuration from: {}", config);
            let server_config = AppConfig::load_server_config(&config)?;
            server::run_server(server_config).await
        }
        Commands::Client {
            config,
            client_key,
            server,
            port,
        } => {
            let client_config =
                resolve_client_config(config.as_deref(), client_key, server, port)?;
            client::run_client(client_config).await
        }
    }
}

/// 合并配置文件与命令行参数，命令行优先
fn resolve_client_config(
    path: Option<&str>,
    client_key: Option<String>,
    server: Option<String>,
    port: Option<u16>,
) -> Result<ClientConfig> {
    let mut builder = match path {
        Some(path) => {
            info!("Loading client configuration from: {}", path);
            ClientConfigBuilder::from_config(AppConfig::load_client_config(path)?)
        }
        None => ClientConfigBuilder::new(),
    };

    if let Some(key) = client_key {
        builder = builder.client_key(key);
    }
    if let Some(server) = server {
        builder = builder.server_addr(server);
    }
    if let Some(port) = port {
        builder = builder.server_port(port);
    }

    builder
        .build()
        .context("Client needs a configuration file or --client-key, --server and --port")
}

/// 检查配置文件
fn check_config(config_path: &str) -> Result<()> {
    if !Path::new(config_path).exists() {
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    println!("Checking configuration file: {}\n", config_path);

    match AppConfig::from_file(config_path)? {
        AppConfig::Server(config) => {
            println!("✓ Configuration type: Server");
            println!("✓ Bind address: {}", config.server.bind_addr);
            println!("✓ Tunnel port: {}", config.server.bind_port);
            println!(
                "✓ Idle timeouts: read {}s, write {}s",
                config.server.read_idle_secs, config.server.write_idle_secs
            );
            println!("✓ Clients: {}", config.clients.len());
            for client in &config.clients {
                let state = if client.is_enabled() { "enabled" } else { "disabled" };
                println!("  - {} ({}) [{}]", client.name, client.client_key, state);
                for mapping in &client.proxy_mappings {
                    let mark = if mapping.is_enabled() { "✓" } else { "✗" };
                    println!("    {} :{} -> {}", mark, mapping.inet_port, mapping.lan);
                }
            }
            println!("\n✓ Server configuration is valid!");
        }
        AppConfig::Client(config) => {
            println!("✓ Configuration type: Client");
            println!("✓ Server: {}", config.server_endpoint());
            println!("✓ Client key: {} characters", config.client_key.len());
            println!("✓ Link pool capacity: {}", config.pool_capacity);
            println!(
                "✓ Heartbeat every {}s, read idle {}s",
                config.heartbeat_interval_secs, config.read_idle_secs
            );
            println!(
                "✓ Reconnect delay: {}s",
                client::get_reconnect_delay(&config)
            );
            println!("\n✓ Client configuration is valid!");
        }
    }

    Ok(())
}
