//! Common utilities for integration tests
#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener as TokioTcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use unmtls_proxy::tls::{build_client_config, load_certificates, load_private_key};
use unmtls_proxy::{Engine, ProxyConfig, ProxyConfigBuilder, ProxyError, ProxyMode};

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Self-signed certificate and key written to temporary files, removed on drop
pub struct TestCert {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TestCert {
    pub fn cert(&self) -> String {
        self.cert_path.to_string_lossy().into_owned()
    }

    pub fn key(&self) -> String {
        self.key_path.to_string_lossy().into_owned()
    }
}

impl Drop for TestCert {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.cert_path);
        let _ = std::fs::remove_file(&self.key_path);
    }
}

/// Generate temporary certificate files for testing
pub fn generate_test_cert() -> TestCert {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

    let cert_path = temp_dir.join(format!("unmtls-test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("unmtls-test-key-{}.pem", unique_id));

    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .expect("Failed to generate test certificate");
    std::fs::write(&cert_path, cert.cert.pem()).expect("Failed to write certificate");
    std::fs::write(&key_path, cert.signing_key.serialize_pem()).expect("Failed to write key");

    TestCert {
        cert_path,
        key_path,
    }
}

/// Accepts any client certificate but refuses clients without one
#[derive(Debug)]
struct RequireAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for RequireAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// What the mTLS test backend does with each connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// Mirror every byte
    Echo,
    /// Answer each line with `<index % 10>\n`, index counted per connection
    Lines,
    /// Answer each HTTP request with its per-connection index as the body
    HttpCounter,
    /// Answer each HTTP request with its request line and headers as the body
    HttpInspect,
    /// Answer each HTTP request with `418`, a custom header and hop-by-hop headers
    HttpTeapot,
}

/// mTLS backend that counts completed handshakes
pub struct TestBackend {
    pub addr: SocketAddr,
    handshakes: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TestBackend {
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn backend_arg(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a TLS backend that requires a client certificate
pub async fn start_backend(mode: BackendMode, cert: &TestCert) -> TestBackend {
    start_backend_with_versions(mode, cert, rustls::DEFAULT_VERSIONS).await
}

/// Start a TLS backend restricted to the given protocol versions
pub async fn start_backend_with_versions(
    mode: BackendMode,
    cert: &TestCert,
    versions: &[&'static rustls::SupportedProtocolVersion],
) -> TestBackend {
    let provider = CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
    let config = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)
        .unwrap()
        .with_client_cert_verifier(Arc::new(RequireAnyClientCert { provider }))
        .with_single_cert(
            load_certificates(&cert.cert_path).unwrap(),
            load_private_key(&cert.key_path).unwrap(),
        )
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test backend");
    let addr = listener.local_addr().unwrap();
    let handshakes = Arc::new(AtomicUsize::new(0));
    let counter = handshakes.clone();

    let task = tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let Ok(stream) = acceptor.accept(socket).await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                match mode {
                    BackendMode::Echo => echo(stream).await,
                    BackendMode::Lines => count_lines(stream).await,
                    BackendMode::HttpCounter
                    | BackendMode::HttpInspect
                    | BackendMode::HttpTeapot => serve_http(stream, mode).await,
                }
            });
        }
    });

    TestBackend {
        addr,
        handshakes,
        task,
    }
}

async fn echo<S>(mut stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() || stream.flush().await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn count_lines<S>(stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut index = 0usize;
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let reply = format!("{}\n", index % 10);
                index += 1;
                let stream = reader.get_mut();
                if stream.write_all(reply.as_bytes()).await.is_err()
                    || stream.flush().await.is_err()
                {
                    break;
                }
            }
        }
    }
}

async fn serve_http<S>(stream: S, mode: BackendMode)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut index = 0usize;
    let mut line = String::new();
    let mut request: Vec<String> = Vec::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if !trimmed.is_empty() {
            request.push(trimmed.to_string());
            continue;
        }
        if request.is_empty() {
            continue;
        }

        let close = request
            .iter()
            .any(|h| h.eq_ignore_ascii_case("connection: close"));
        let (status, extra_headers, body) = match mode {
            BackendMode::HttpInspect => ("200 OK", "", request.join("\n").to_ascii_lowercase()),
            BackendMode::HttpTeapot => (
                "418 I'm a teapot",
                "X-Backend-Id: backend-7\r\n\
                 Keep-Alive: timeout=5\r\n\
                 Proxy-Connection: keep-alive\r\n\
                 Connection: X-Internal-Hop\r\n\
                 X-Internal-Hop: secret\r\n",
                "short and stout".to_string(),
            ),
            _ => ("200 OK", "", index.to_string()),
        };
        index += 1;
        request.clear();

        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: text/plain\r\n{}Content-Length: {}\r\n\r\n{}",
            status,
            extra_headers,
            body.len(),
            body
        );
        let stream = reader.get_mut();
        if stream.write_all(response.as_bytes()).await.is_err() || stream.flush().await.is_err()
        {
            break;
        }
        if close {
            let _ = stream.shutdown().await;
            break;
        }
    }
}

/// Base configuration pointing at a backend with the given client certificate
pub fn proxy_config(mode: ProxyMode, backend: &str, client: &TestCert) -> ProxyConfigBuilder {
    ProxyConfigBuilder::new()
        .listen(format!("127.0.0.1:{}", get_available_port()))
        .backend(backend)
        .mode(mode)
        .client_cert(client.cert())
        .client_key(client.key())
}

/// A proxy engine running in the background
pub struct RunningProxy {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<Result<(), ProxyError>>,
}

impl RunningProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Build the TLS config and engine, then serve in the background
pub async fn start_proxy(config: ProxyConfig) -> RunningProxy {
    let tls_config =
        build_client_config(&config.tls_settings()).expect("Failed to build TLS config");
    let engine = Engine::start(&config, tls_config)
        .await
        .expect("Failed to start proxy");
    let addr = engine.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(engine.serve(shutdown.clone()));

    RunningProxy {
        addr,
        shutdown,
        handle,
    }
}

/// Plain HTTP client talking to the proxy
pub fn http_client() -> Client<hyper_util::client::legacy::connect::HttpConnector, Empty<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

/// GET a URL and return status and body
pub async fn http_get(
    client: &Client<hyper_util::client::legacy::connect::HttpConnector, Empty<Bytes>>,
    url: &str,
) -> (http::StatusCode, String) {
    let (status, _, body) = http_get_with_headers(client, url).await;
    (status, body)
}

/// GET a URL and return status, headers and body
pub async fn http_get_with_headers(
    client: &Client<hyper_util::client::legacy::connect::HttpConnector, Empty<Bytes>>,
    url: &str,
) -> (http::StatusCode, http::HeaderMap, String) {
    let response = tokio::time::timeout(Duration::from_secs(15), client.get(url.parse().unwrap()))
        .await
        .expect("Timeout waiting for response")
        .expect("Request failed");
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}
