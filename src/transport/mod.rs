/// 后端传输层
///
/// 负责建立到后端的 TCP 连接（可经由出口 HTTP 代理）并完成 mTLS 握手，
/// TCP 隧道和 HTTP 反向代理共用同一套拨号逻辑
mod dialer;
mod egress;

pub use dialer::BackendDialer;
pub use egress::EgressProxy;

use std::time::Duration;

/// 建立 TCP 连接的超时
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP keepalive 间隔
pub const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// TLS 握手超时
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
