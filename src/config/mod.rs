// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

pub use builder::ProxyConfigBuilder;
pub use validator::ConfigValidator;

use crate::addr::{Addr, BackendAddr};
use crate::cli::Cli;
use crate::error::Result;
use crate::logging::LogLevel;
use crate::tls::TlsClientSettings;
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

/// 默认监听地址
pub const DEFAULT_LISTEN: &str = ":443";

/// 代理模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProxyMode {
    /// 原始 TCP 隧道，每个入站连接对应一个后端 TLS 连接
    #[default]
    Tcp,
    /// HTTP/1.1 反向代理
    Http,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Tcp => write!(f, "tcp"),
            ProxyMode::Http => write!(f, "http"),
        }
    }
}

impl std::str::FromStr for ProxyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "http" => Ok(Self::Http),
            _ => anyhow::bail!("Unknown proxy mode: {}", s),
        }
    }
}

/// 后端连接复用策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketReuse {
    /// 连接池复用
    #[default]
    Pooled,
    /// 每个请求一个新的 TLS 连接，完整握手
    SingleUse,
}

impl SocketReuse {
    /// 由 `disable-socket-reusing` 开关得到策略
    pub fn from_disable_flag(disable: bool) -> Self {
        if disable {
            SocketReuse::SingleUse
        } else {
            SocketReuse::Pooled
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, SocketReuse::Pooled)
    }

    /// 连接池中保留的空闲连接数
    pub fn max_idle_connections(&self) -> usize {
        match self {
            SocketReuse::Pooled => 100,
            SocketReuse::SingleUse => 1,
        }
    }

    /// 空闲连接的存活时间
    pub fn idle_timeout(&self) -> Duration {
        match self {
            SocketReuse::Pooled => Duration::from_secs(90),
            SocketReuse::SingleUse => Duration::from_micros(1),
        }
    }
}

/// 完整的运行配置，由 CLI / 环境变量解析并校验而来
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// 监听地址
    pub listen: Addr,
    /// 后端地址
    pub backend: BackendAddr,
    /// 代理模式
    pub mode: ProxyMode,
    /// 后端连接复用策略
    pub socket_reuse: SocketReuse,
    /// 客户端证书路径
    pub client_cert_path: PathBuf,
    /// 客户端私钥路径
    pub client_key_path: PathBuf,
    /// 后端 CA 证书路径；缺省时不校验后端证书
    pub server_ca_path: Option<PathBuf>,
    /// [UNSAFE] TLS 密钥日志路径
    pub unsafe_key_log_path: Option<PathBuf>,
    /// 日志级别
    pub log_level: LogLevel,
}

impl ProxyConfig {
    /// 从命令行参数构建配置
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut builder = ProxyConfigBuilder::new()
            .listen(&cli.listen)
            .backend(&cli.backend)
            .mode(cli.mode)
            .disable_socket_reusing(cli.disable_socket_reusing)
            .client_cert(&cli.cert)
            .client_key(&cli.cert_key)
            .log_level(cli.log_level);

        if let Some(ca) = &cli.server_ca {
            builder = builder.server_ca(ca);
        }
        if let Some(path) = &cli.unsafe_key_log_path {
            builder = builder.unsafe_key_log_path(path);
        }

        builder.build()
    }

    /// 是否为后端 TLS 连接启用会话缓存
    ///
    /// TCP 模式下每个入站连接都完整握手，不缓存会话
    pub fn session_cache(&self) -> bool {
        self.mode == ProxyMode::Http && self.socket_reuse.is_enabled()
    }

    /// 构建后端 TLS 客户端配置所需的参数
    pub fn tls_settings(&self) -> TlsClientSettings {
        TlsClientSettings {
            client_cert_path: self.client_cert_path.clone(),
            client_key_path: self.client_key_path.clone(),
            server_ca_path: self.server_ca_path.clone(),
            session_cache: self.session_cache(),
            key_log_path: self.unsafe_key_log_path.clone(),
        }
    }
}
