use futures::future::BoxFuture;
use http::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::error::ProxyError;
use crate::transport::BackendDialer;

/// hyper 连接池使用的连接器，总是拨号到配置的后端
#[derive(Clone)]
pub struct BackendConnector {
    dialer: Arc<BackendDialer>,
}

impl BackendConnector {
    pub fn new(dialer: BackendDialer) -> Self {
        Self {
            dialer: Arc::new(dialer),
        }
    }
}

impl tower::Service<Uri> for BackendConnector {
    type Response = BackendConnection;
    type Error = ProxyError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri /* 目标由 dialer 决定 */) -> Self::Future {
        let dialer = self.dialer.clone();
        Box::pin(async move {
            let stream = dialer.connect().await?;
            debug!(backend = %dialer.backend(), "New backend connection");
            Ok(BackendConnection {
                inner: TokioIo::new(stream),
            })
        })
    }
}

/// 到后端的 TLS 连接
pub struct BackendConnection {
    inner: TokioIo<TlsStream<TcpStream>>,
}

impl Connection for BackendConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for BackendConnection {
    #[inline]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.get_mut().inner), cx, buf)
    }
}

impl hyper::rt::Write for BackendConnection {
    #[inline]
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.get_mut().inner), cx, buf)
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.get_mut().inner), cx)
    }

    #[inline]
    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.get_mut().inner), cx)
    }
}
