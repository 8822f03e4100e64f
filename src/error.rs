/// 自定义错误类型
///
/// 配置阶段的错误会让进程以非零状态退出；
/// 后端连接阶段的错误只影响单个会话或请求，并以文本形式回报给调用方
use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// unmtls-proxy 的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 监听地址格式错误
    #[error("invalid listen format '{0}'. Use `hostname:port`")]
    InvalidListenFormat(String),

    /// 后端地址格式错误
    #[error("invalid backend format '{0}'. Use `hostname:port` or `https://hostname[:port]`")]
    InvalidBackendFormat(String),

    /// 主机名无法解析
    #[error("invalid hostname '{host}' in '{addr}': {reason}")]
    InvalidHost {
        addr: String,
        host: String,
        reason: String,
    },

    /// 端口过小
    #[error("invalid port '{port}' in '{addr}': port number too low")]
    PortTooLow { addr: String, port: String },

    /// 端口过大
    #[error("invalid port '{port}' in '{addr}': port number too high")]
    PortTooHigh { addr: String, port: String },

    /// 端口不是数字
    #[error("invalid port '{port}' in '{addr}': not a number")]
    InvalidPort { addr: String, port: String },

    /// 既没有 scheme 也没有端口
    #[error("backend '{0}' has neither a scheme nor a port")]
    MissingPort(String),

    /// 不支持的 scheme
    #[error("unsupported scheme '{scheme}' in backend '{addr}'")]
    UnsupportedScheme { addr: String, scheme: String },

    /// scheme 与端口冲突
    #[error("scheme '{scheme}' disagrees with port {port} in backend '{addr}'")]
    SchemeMismatch {
        addr: String,
        scheme: String,
        port: u16,
    },

    /// 明文后端
    #[error("plaintext backend '{0}' is not supported: only TLS backends can be proxied")]
    PlaintextBackend(String),

    /// TCP 模式下禁止关闭 socket 复用
    #[error("option `disable-socket-reusing` is forbidden in TCP mode: each TCP connection already maps to its own TLS connection")]
    ForbiddenDisableSocketReusing,

    /// 证书、私钥或 CA 材料错误
    #[error("invalid TLS material: {0:#}")]
    Certificate(anyhow::Error),

    /// 无法打开密钥日志文件
    #[error("failed to open key log file {path:?}: {source}")]
    KeyLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 无法绑定监听地址
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 后端 TCP 连接失败
    #[error("dial tcp {addr}: connect")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 出口 HTTP 代理 CONNECT 失败
    #[error("proxyconnect tcp {proxy}: {reason}")]
    EgressProxy { proxy: String, reason: String },

    /// 后端 TLS 握手失败
    #[error("tls: handshake with {addr} failed")]
    Handshake {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建证书错误
    pub fn certificate(err: impl Into<anyhow::Error>) -> Self {
        Self::Certificate(err.into())
    }

    /// 创建绑定失败错误
    pub fn bind(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }

    /// 创建后端拨号失败错误
    pub fn dial(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Dial {
            addr: addr.into(),
            source,
        }
    }

    /// 创建 TLS 握手失败错误
    pub fn handshake(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Handshake {
            addr: addr.into(),
            source,
        }
    }

    /// 创建出口代理错误
    pub fn egress_proxy(proxy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EgressProxy {
            proxy: proxy.into(),
            reason: reason.into(),
        }
    }

    /// 检查是否为配置错误（进程启动阶段即失败）
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidListenFormat(_)
                | Self::InvalidBackendFormat(_)
                | Self::InvalidHost { .. }
                | Self::PortTooLow { .. }
                | Self::PortTooHigh { .. }
                | Self::InvalidPort { .. }
                | Self::MissingPort(_)
                | Self::UnsupportedScheme { .. }
                | Self::SchemeMismatch { .. }
                | Self::PlaintextBackend(_)
                | Self::ForbiddenDisableSocketReusing
                | Self::Certificate(_)
                | Self::KeyLog { .. }
                | Self::Bind { .. }
        )
    }

    /// 检查是否为后端连接错误（只影响单个会话）
    pub fn is_backend_error(&self) -> bool {
        matches!(
            self,
            Self::Dial { .. } | Self::EgressProxy { .. } | Self::Handshake { .. }
        )
    }
}

/// 将错误及其 source 链渲染为一行文本，用于回报给调用方
pub fn report_backend_failure(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let message = cause.to_string();
        // 某些错误会把 source 内联进自己的 Display
        if !message.is_empty() && !text.ends_with(&message) {
            text.push_str(": ");
            text.push_str(&message);
        }
        source = cause.source();
    }
    text
}
