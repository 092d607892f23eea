use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "lanproxy")]
#[command(author, version, about = "Reverse TCP tunnel for services behind NAT", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，RUST_LOG 优先
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行服务器模式
    Server {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },
    /// 运行客户端模式
    Client {
        /// 配置文件路径（也可只用命令行参数）
        #[arg(short, long)]
        config: Option<String>,

        /// 客户端密钥
        #[arg(short = 'k', long)]
        client_key: Option<String>,

        /// 服务器地址
        #[arg(short, long)]
        server: Option<String>,

        /// 服务器隧道端口
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_flags() {
        let cli = Cli::try_parse_from([
            "lanproxy", "client", "-k", "abc", "-s", "example.com", "-p", "4900",
        ])
        .unwrap();
        match cli.command {
            Commands::Client {
                config,
                client_key,
                server,
                port,
            } => {
                assert!(config.is_none());
                assert_eq!(client_key.as_deref(), Some("abc"));
                assert_eq!(server.as_deref(), Some("example.com"));
                assert_eq!(port, Some(4900));
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_server_default_config() {
        let cli = Cli::try_parse_from(["lanproxy", "--log-level", "debug", "server"]).unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Server { config } => assert_eq!(config, "server.toml"),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
