/// 启动与关闭
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span};

use crate::config::{ProxyConfig, ProxyMode};
use crate::error::{ProxyError, Result};
use crate::http_proxy::{HttpProxyServer, ReverseProxy};
use crate::tls::build_client_config;
use crate::transport::{BackendDialer, EgressProxy};
use crate::tunnel::TunnelServer;

/// 按模式选择的代理引擎
pub enum Engine {
    Tcp(TunnelServer),
    Http(HttpProxyServer),
}

impl Engine {
    /// 构建引擎并绑定监听地址
    pub async fn start(config: &ProxyConfig, tls_config: Arc<rustls::ClientConfig>) -> Result<Self> {
        let dialer = BackendDialer::new(config.backend.addr().clone(), tls_config)?;

        match config.mode {
            ProxyMode::Tcp => {
                let span = info_span!("tunnel", listen = %config.listen, backend = %config.backend);
                let server = TunnelServer::bind(&config.listen, dialer, span).await?;
                Ok(Engine::Tcp(server))
            }
            ProxyMode::Http => {
                let span = info_span!("http_proxy", listen = %config.listen, backend = %config.backend);
                let dialer = dialer.with_egress_proxy(EgressProxy::from_env());
                let proxy = ReverseProxy::new(&config.backend, dialer, config.socket_reuse)?;
                let server = HttpProxyServer::bind(&config.listen, proxy, span).await?;
                Ok(Engine::Http(server))
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Engine::Tcp(server) => server.local_addr(),
            Engine::Http(server) => server.local_addr(),
        }
    }

    /// 运行直到 `shutdown` 被取消
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        match self {
            Engine::Tcp(server) => server.serve(shutdown).await,
            Engine::Http(server) => server.serve(shutdown).await,
        }
    }
}

/// 运行代理直到收到中断信号
pub async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let tls_config = build_client_config(&config.tls_settings())?;
    let engine = Engine::start(&config, tls_config).await?;

    info!(
        mode = %config.mode,
        listen = %engine.local_addr()?,
        backend = %config.backend,
        reuse = config.socket_reuse.is_enabled(),
        "MTLSProxy is ready"
    );

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(engine.serve(shutdown.clone()));

    tokio::select! {
        result = wait_for_interrupt() => {
            result?;
            info!("Received interrupt, shutting down");
            shutdown.cancel();
        }
        joined = &mut server => {
            return joined
                .map_err(|e| ProxyError::Other(e.into()))?
                .map_err(Into::into);
        }
    }

    server
        .await
        .map_err(|e| ProxyError::Other(e.into()))??;
    Ok(())
}

/// 等待 Ctrl-C / SIGINT
pub async fn wait_for_interrupt() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
