use clap::Parser;

use crate::config::{ProxyMode, DEFAULT_LISTEN};
use crate::logging::LogLevel;

/// 所有参数都可以通过 `UNMTLSPROXY_` 前缀的环境变量设置
#[derive(Parser, Debug)]
#[command(name = "unmtls-proxy")]
#[command(
    author,
    version,
    about = "Terminates plain connections and re-originates them to a backend over mutual TLS",
    long_about = None
)]
pub struct Cli {
    /// 后端地址 (`host:port`、`https://host[:port]`)
    #[arg(long, env = "UNMTLSPROXY_BACKEND")]
    pub backend: String,

    /// 用于校验后端证书的 CA（PEM）；缺省时不校验后端证书
    #[arg(long = "server-ca", env = "UNMTLSPROXY_SERVER_CA", value_name = "PATH")]
    pub server_ca: Option<String>,

    /// 监听地址 (`hostname:port`)
    #[arg(long, env = "UNMTLSPROXY_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// 客户端证书（PEM）
    #[arg(long, env = "UNMTLSPROXY_CERT", value_name = "PATH")]
    pub cert: String,

    /// 客户端私钥（PEM，不支持加密私钥）
    #[arg(long = "cert-key", env = "UNMTLSPROXY_CERT_KEY", value_name = "PATH")]
    pub cert_key: String,

    /// 代理模式
    #[arg(long, value_enum, env = "UNMTLSPROXY_MODE", default_value_t = ProxyMode::Tcp)]
    pub mode: ProxyMode,

    /// 日志级别
    #[arg(long = "log-level", value_enum, env = "UNMTLSPROXY_LOG_LEVEL", default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// [UNSAFE] 将 TLS 会话密钥写入该文件（NSS key log 格式），仅用于调试
    #[arg(
        long = "unsafe-key-log-path",
        env = "UNMTLSPROXY_UNSAFE_KEY_LOG_PATH",
        value_name = "PATH"
    )]
    pub unsafe_key_log_path: Option<String>,

    /// 每个请求都使用新的后端 TLS 连接（仅 HTTP 模式）
    #[arg(long = "disable-socket-reusing", env = "UNMTLSPROXY_DISABLE_SOCKET_REUSING")]
    pub disable_socket_reusing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_args() {
        let cli = Cli::try_parse_from([
            "unmtls-proxy",
            "--backend",
            "backend.internal:443",
            "--cert",
            "client.pem",
            "--cert-key",
            "client.key",
        ])
        .unwrap();

        assert_eq!(cli.backend, "backend.internal:443");
        assert_eq!(cli.listen, ":443");
        assert_eq!(cli.mode, ProxyMode::Tcp);
        assert_eq!(cli.log_level, LogLevel::Info);
        assert!(!cli.disable_socket_reusing);
        assert!(cli.server_ca.is_none());
    }

    #[test]
    fn test_all_args() {
        let cli = Cli::try_parse_from([
            "unmtls-proxy",
            "--backend",
            "https://backend.internal:8443",
            "--server-ca",
            "ca.pem",
            "--listen",
            "127.0.0.1:8080",
            "--cert",
            "client.pem",
            "--cert-key",
            "client.key",
            "--mode",
            "http",
            "--log-level",
            "debug",
            "--unsafe-key-log-path",
            "keys.log",
            "--disable-socket-reusing",
        ])
        .unwrap();

        assert_eq!(cli.mode, ProxyMode::Http);
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert_eq!(cli.server_ca.as_deref(), Some("ca.pem"));
        assert_eq!(cli.unsafe_key_log_path.as_deref(), Some("keys.log"));
        assert!(cli.disable_socket_reusing);
    }

    #[test]
    fn test_invalid_mode_is_rejected() {
        let result = Cli::try_parse_from([
            "unmtls-proxy",
            "--backend",
            "backend.internal:443",
            "--cert",
            "client.pem",
            "--cert-key",
            "client.key",
            "--mode",
            "udp",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
