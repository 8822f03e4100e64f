use std::path::PathBuf;

use crate::addr::{Addr, BackendAddr};
use crate::error::{ProxyError, Result};
use crate::logging::LogLevel;

use super::{validator::ConfigValidator, ProxyConfig, ProxyMode, DEFAULT_LISTEN};

/// ProxyConfig Builder
#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    listen: Option<String>,
    backend: Option<String>,
    mode: ProxyMode,
    disable_socket_reusing: bool,
    client_cert: Option<String>,
    client_key: Option<String>,
    server_ca: Option<String>,
    unsafe_key_log_path: Option<String>,
    log_level: LogLevel,
}

impl ProxyConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置监听地址
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.listen = Some(addr.into());
        self
    }

    /// 设置后端地址
    pub fn backend(mut self, addr: impl Into<String>) -> Self {
        self.backend = Some(addr.into());
        self
    }

    /// 设置代理模式
    pub fn mode(mut self, mode: ProxyMode) -> Self {
        self.mode = mode;
        self
    }

    /// 设置是否关闭后端连接复用
    pub fn disable_socket_reusing(mut self, disable: bool) -> Self {
        self.disable_socket_reusing = disable;
        self
    }

    /// 设置客户端证书路径
    pub fn client_cert(mut self, path: impl Into<String>) -> Self {
        self.client_cert = Some(path.into());
        self
    }

    /// 设置客户端私钥路径
    pub fn client_key(mut self, path: impl Into<String>) -> Self {
        self.client_key = Some(path.into());
        self
    }

    /// 设置后端 CA 证书路径
    pub fn server_ca(mut self, path: impl Into<String>) -> Self {
        self.server_ca = Some(path.into());
        self
    }

    /// 设置 TLS 密钥日志路径
    pub fn unsafe_key_log_path(mut self, path: impl Into<String>) -> Self {
        self.unsafe_key_log_path = Some(path.into());
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// 构建并校验配置
    pub fn build(self) -> Result<ProxyConfig> {
        let listen = Addr::parse_listen(self.listen.as_deref().unwrap_or(DEFAULT_LISTEN))?;

        let backend = self
            .backend
            .as_deref()
            .ok_or_else(|| ProxyError::InvalidBackendFormat(String::new()))
            .and_then(BackendAddr::parse)?;
        ConfigValidator::validate_backend(self.mode, &backend)?;

        let socket_reuse =
            ConfigValidator::validate_socket_reuse(self.mode, self.disable_socket_reusing)?;

        let client_cert_path = expand_path(self.client_cert.as_deref().unwrap_or_default());
        ConfigValidator::validate_path(&client_cert_path, "client certificate")?;
        let client_key_path = expand_path(self.client_key.as_deref().unwrap_or_default());
        ConfigValidator::validate_path(&client_key_path, "client private key")?;

        let server_ca_path = self.server_ca.as_deref().map(expand_path);
        if let Some(path) = &server_ca_path {
            ConfigValidator::validate_path(path, "server CA")?;
        }

        Ok(ProxyConfig {
            listen,
            backend,
            mode: self.mode,
            socket_reuse,
            client_cert_path,
            client_key_path,
            server_ca_path,
            unsafe_key_log_path: self.unsafe_key_log_path.as_deref().map(expand_path),
            log_level: self.log_level,
        })
    }
}

/// 展开路径中的 `~`
fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
