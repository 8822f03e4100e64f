/// HTTP 反向代理
///
/// 入站为明文 HTTP/1.1，出站通过连接池复用到后端的 mTLS 连接；
/// 无法到达后端时返回 503 和错误原文
mod connector;

pub use connector::{BackendConnection, BackendConnector};

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument, Span};
use uuid::Uuid;

use crate::addr::{Addr, BackendAddr};
use crate::config::SocketReuse;
use crate::error::{report_backend_failure, ProxyError, Result};
use crate::transport::BackendDialer;

/// 响应体类型
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// 逐跳头部，不向下一跳转发
const HOP_BY_HOP_HEADERS: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// 请求改写与转发
pub struct ReverseProxy {
    client: Client<BackendConnector, Incoming>,
    authority: Authority,
    host_header: HeaderValue,
    socket_reuse: SocketReuse,
}

impl ReverseProxy {
    /// 创建反向代理；明文后端在此被拒绝
    pub fn new(
        backend: &BackendAddr,
        dialer: BackendDialer,
        socket_reuse: SocketReuse,
    ) -> Result<Self> {
        backend.require_tls()?;

        let authority = Authority::try_from(backend.addr().to_string())
            .map_err(|_| ProxyError::InvalidBackendFormat(backend.to_string()))?;
        let host_header = HeaderValue::try_from(backend.host_header())
            .map_err(|_| ProxyError::InvalidBackendFormat(backend.to_string()))?;

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(socket_reuse.max_idle_connections())
            .pool_idle_timeout(socket_reuse.idle_timeout())
            .pool_timer(TokioTimer::new())
            .build(BackendConnector::new(dialer));

        Ok(Self {
            client,
            authority,
            host_header,
            socket_reuse,
        })
    }

    /// 转发一个请求；失败时返回 503，错误原文作为响应体
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        debug!(method = %req.method(), uri = %req.uri(), "Received a request");

        let req = match self.rewrite(req) {
            Ok(req) => req,
            Err(e) => {
                error!("Cannot rewrite request: {}", e);
                return service_unavailable(&e);
            }
        };

        match self.client.request(req).await {
            Ok(response) => relay_response(response),
            Err(e) => {
                error!("Cannot round-trip a request: {}", report_backend_failure(&e));
                service_unavailable(&e)
            }
        }
    }

    /// 改写为发往后端的请求：https scheme、后端 authority 与 Host，原路径和查询不变
    fn rewrite(&self, req: Request<Incoming>) -> Result<Request<Incoming>> {
        let (mut parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::builder()
            .scheme(Scheme::HTTPS)
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::Other(e.into()))?;
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.insert(header::HOST, self.host_header.clone());
        if !self.socket_reuse.is_enabled() {
            parts
                .headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        Ok(Request::from_parts(parts, body))
    }
}

/// 去掉逐跳头部以及 Connection 中列出的头部
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

/// 原样回传后端响应；响应体中途出错时连接被中断
fn relay_response(response: Response<Incoming>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    let body = body
        .map_err(|e| {
            error!("Failed to copy backend response body: {}", e);
            e
        })
        .boxed();
    Response::from_parts(parts, body)
}

fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

/// 503 响应，响应体为错误链文本
fn service_unavailable(err: &(dyn std::error::Error + 'static)) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{}\n", report_backend_failure(err))));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// HTTP 反向代理服务
pub struct HttpProxyServer {
    listener: TcpListener,
    proxy: Arc<ReverseProxy>,
    span: Span,
}

impl HttpProxyServer {
    /// 绑定监听地址
    pub async fn bind(listen: &Addr, proxy: ReverseProxy, span: Span) -> Result<Self> {
        let addr = listen.to_socket_string();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::bind(addr.clone(), e))?;

        span.in_scope(|| info!("HTTP proxy listening on {}", addr));
        Ok(Self {
            listener,
            proxy: Arc::new(proxy),
            span,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 接受连接直到 `shutdown` 被取消
    ///
    /// 已建立的入站连接不受取消影响，随进程退出结束
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let span = self.span.clone();
        self.accept_loop(shutdown).instrument(span).await
    }

    async fn accept_loop(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let span = info_span!(
                                parent: &self.span,
                                "connection",
                                id = %Uuid::new_v4(),
                                peer = %peer_addr
                            );
                            tokio::spawn(
                                serve_connection(stream, self.proxy.clone()).instrument(span),
                            );
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("HTTP proxy shutting down");
                    break Ok(());
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, proxy: Arc<ReverseProxy>) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = proxy.clone();
        async move { Ok::<_, Infallible>(proxy.handle(req).await) }
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        debug!("Connection closed with error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert("x-request-id", HeaderValue::from_static("42"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key(header::ACCEPT));
        assert!(headers.contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_service_unavailable_body() {
        let err = ProxyError::dial(
            "0.0.0.0:443",
            io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
        );
        let response = service_unavailable(&err);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            body,
            Bytes::from("dial tcp 0.0.0.0:443: connect: connection refused\n")
        );
    }
}
