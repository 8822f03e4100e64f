use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::{EgressProxy, CONNECT_TIMEOUT, TCP_KEEPALIVE, TLS_HANDSHAKE_TIMEOUT};
use crate::addr::Addr;
use crate::error::{ProxyError, Result};

/// 后端拨号器：TCP 连接 + mTLS 握手
#[derive(Clone)]
pub struct BackendDialer {
    backend: Addr,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    egress: Option<EgressProxy>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl BackendDialer {
    pub fn new(backend: Addr, tls_config: Arc<rustls::ClientConfig>) -> Result<Self> {
        let server_name = ServerName::try_from(backend.hostname().to_string()).map_err(|e| {
            ProxyError::InvalidHost {
                addr: backend.to_string(),
                host: backend.hostname().to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            backend,
            connector: TlsConnector::from(tls_config),
            server_name,
            egress: None,
            connect_timeout: CONNECT_TIMEOUT,
            handshake_timeout: TLS_HANDSHAKE_TIMEOUT,
        })
    }

    /// 经由出口 HTTP 代理拨号；代理的 NO_PROXY 规则排除了后端时忽略
    pub fn with_egress_proxy(mut self, proxy: Option<EgressProxy>) -> Self {
        self.egress = proxy.filter(|p| p.applies_to(self.backend.hostname()));
        if let Some(proxy) = &self.egress {
            debug!(proxy = %proxy.addr(), backend = %self.backend, "Using egress HTTP proxy");
        }
        self
    }

    /// 覆盖默认超时
    pub fn with_timeouts(mut self, connect: Duration, handshake: Duration) -> Self {
        self.connect_timeout = connect;
        self.handshake_timeout = handshake;
        self
    }

    pub fn backend(&self) -> &Addr {
        &self.backend
    }

    pub fn egress_proxy(&self) -> Option<&EgressProxy> {
        self.egress.as_ref()
    }

    /// 建立到后端的 TCP 连接
    pub async fn connect_tcp(&self) -> Result<TcpStream> {
        let stream = match &self.egress {
            Some(proxy) => self.connect_via_proxy(proxy).await?,
            None => {
                let addr = self.backend.to_socket_string();
                Self::dial(&addr, self.connect_timeout).await?
            }
        };

        apply_keepalive(&stream);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        Ok(stream)
    }

    /// 建立到后端的 TLS 连接
    pub async fn connect(&self) -> Result<TlsStream<TcpStream>> {
        let stream = self.connect_tcp().await?;
        let addr = self.backend.to_string();

        let handshake = self.connector.connect(self.server_name.clone(), stream);
        let tls_stream = match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(e)) => return Err(ProxyError::handshake(addr, e)),
            Err(_) => {
                return Err(ProxyError::handshake(
                    addr,
                    io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timeout"),
                ))
            }
        };

        let (_, session) = tls_stream.get_ref();
        debug!(
            backend = %self.backend,
            version = ?session.protocol_version(),
            resumed = matches!(session.handshake_kind(), Some(rustls::HandshakeKind::Resumed)),
            "TLS connection established"
        );
        Ok(tls_stream)
    }

    async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::dial(addr, e)),
            Err(_) => Err(ProxyError::dial(
                addr,
                io::Error::new(io::ErrorKind::TimedOut, "i/o timeout"),
            )),
        }
    }

    async fn connect_via_proxy(&self, proxy: &EgressProxy) -> Result<TcpStream> {
        let proxy_addr = proxy.addr().to_socket_string();
        let mut stream = Self::dial(&proxy_addr, self.connect_timeout).await?;

        let connect = async_http_proxy::http_connect_tokio(
            &mut stream,
            self.backend.hostname(),
            self.backend.port(),
        );
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::egress_proxy(proxy_addr, e.to_string())),
            Err(_) => Err(ProxyError::egress_proxy(proxy_addr, "CONNECT timeout")),
        }
    }
}

fn apply_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(TCP_KEEPALIVE)
        .with_interval(TCP_KEEPALIVE);

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}
