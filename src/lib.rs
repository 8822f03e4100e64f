/// unmtls-proxy 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod addr;
pub mod cli;
pub mod config;
pub mod error;
pub mod http_proxy;
pub mod lifecycle;
pub mod logging;
pub mod tls;
pub mod transport;
pub mod tunnel;

// 重新导出常用类型
pub use addr::{Addr, BackendAddr, Scheme};
pub use config::{ProxyConfig, ProxyConfigBuilder, ProxyMode, SocketReuse};
pub use error::{ProxyError, Result};
pub use lifecycle::Engine;
