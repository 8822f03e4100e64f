/// TCP 隧道
///
/// 每个入站 TCP 连接对应一个新的后端 TLS 连接，两个方向各一个拷贝任务；
/// 任一方向读到 EOF 或出错都会取消会话，另一方向随之结束
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::addr::Addr;
use crate::error::{report_backend_failure, ProxyError, Result};
use crate::transport::BackendDialer;

/// 单次拷贝的缓冲区大小
pub const COPY_BUFFER_SIZE: usize = 1024;

/// TCP 隧道服务
pub struct TunnelServer {
    listener: TcpListener,
    dialer: BackendDialer,
    span: Span,
}

impl TunnelServer {
    /// 绑定监听地址
    pub async fn bind(listen: &Addr, dialer: BackendDialer, span: Span) -> Result<Self> {
        let addr = listen.to_socket_string();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::bind(addr.clone(), e))?;

        span.in_scope(|| info!("TCP tunnel listening on {}", addr));
        Ok(Self {
            listener,
            dialer,
            span,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 接受连接直到 `shutdown` 被取消；取消会级联到所有进行中的会话
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let span = self.span.clone();
        self.accept_loop(shutdown).instrument(span).await
    }

    async fn accept_loop(self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((inbound, peer_addr)) => {
                            let session = TunnelSession {
                                id: Uuid::new_v4(),
                                inbound,
                                peer_addr,
                                scope: shutdown.child_token(),
                            };
                            let span = info_span!(
                                parent: &self.span,
                                "session",
                                id = %session.id,
                                peer = %peer_addr
                            );
                            let dialer = self.dialer.clone();
                            tokio::spawn(session.run(dialer).instrument(span));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("TCP tunnel shutting down");
                    break Ok(());
                }
            }
        }
    }
}

/// 一个入站连接及其取消作用域
pub struct TunnelSession {
    id: Uuid,
    inbound: TcpStream,
    peer_addr: SocketAddr,
    scope: CancellationToken,
}

impl TunnelSession {
    /// 连接后端并在两端之间转发字节
    pub async fn run(self, dialer: BackendDialer) {
        let TunnelSession {
            mut inbound,
            peer_addr,
            scope,
            ..
        } = self;
        debug!("Accepted connection from {}", peer_addr);

        let outbound = tokio::select! {
            result = dialer.connect() => result,
            _ = scope.cancelled() => return,
        };

        let outbound = match outbound {
            Ok(stream) => stream,
            Err(e) => {
                error!("Error connecting the backend: {}", e);
                // 把错误原文回写给调用方，然后关闭
                let report = report_backend_failure(&e);
                if let Err(e) = inbound.write_all(report.as_bytes()).await {
                    debug!("Failed to report backend error to {}: {}", peer_addr, e);
                }
                if let Err(e) = inbound.shutdown().await {
                    debug!("Failed to close connection from {}: {}", peer_addr, e);
                }
                return;
            }
        };

        if let Err(e) = inbound.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        pipe(inbound, outbound, scope).await;
    }
}

/// 在两端之间双向转发，直到 `scope` 被取消
///
/// 每个方向在独立的任务中运行；任务退出时取消 `scope`
pub async fn pipe<A, B>(inbound: A, outbound: B, scope: CancellationToken)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (inbound_reader, inbound_writer) = tokio::io::split(inbound);
    let (outbound_reader, outbound_writer) = tokio::io::split(outbound);

    let upload = tokio::spawn(
        copy_half(inbound_reader, outbound_writer, scope.clone()).instrument(Span::current()),
    );
    let download = tokio::spawn(
        copy_half(outbound_reader, inbound_writer, scope.clone()).instrument(Span::current()),
    );

    scope.cancelled().await;

    let (sent, received) = tokio::join!(upload, download);
    debug!(
        sent = sent.unwrap_or(0),
        received = received.unwrap_or(0),
        "Session closed"
    );
}

/// 单向拷贝，返回拷贝的字节数
///
/// 读到 EOF、读写出错或 `scope` 被取消时返回，并取消 `scope`
pub async fn copy_half<R, W>(mut reader: R, mut writer: W, scope: CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _guard = scope.clone().drop_guard();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Read error: {}", e);
                    break;
                }
            },
            _ = scope.cancelled() => break,
        };

        let write = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        tokio::select! {
            result = write => {
                if let Err(e) = result {
                    debug!("Write error: {}", e);
                    break;
                }
            }
            _ = scope.cancelled() => break,
        }
        total += n as u64;
    }

    total
}
