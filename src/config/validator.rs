use crate::addr::BackendAddr;
use crate::error::{ProxyError, Result};
use std::path::Path;

use super::{ProxyMode, SocketReuse};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 根据模式确定复用策略
    ///
    /// TCP 模式下一个入站连接本就对应一个后端连接，不允许关闭复用
    pub fn validate_socket_reuse(mode: ProxyMode, disable: bool) -> Result<SocketReuse> {
        match (mode, disable) {
            (ProxyMode::Tcp, true) => Err(ProxyError::ForbiddenDisableSocketReusing),
            (ProxyMode::Tcp, false) => Ok(SocketReuse::Pooled),
            (ProxyMode::Http, disable) => Ok(SocketReuse::from_disable_flag(disable)),
        }
    }

    /// HTTP 模式只接受 TLS 后端
    pub fn validate_backend(mode: ProxyMode, backend: &BackendAddr) -> Result<()> {
        match mode {
            ProxyMode::Http => backend.require_tls(),
            ProxyMode::Tcp => Ok(()),
        }
    }

    /// 验证路径不为空
    pub fn validate_path(path: &Path, context: &str) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(ProxyError::certificate(anyhow::anyhow!(
                "{}: path cannot be empty",
                context
            )));
        }
        Ok(())
    }
}
