use anyhow::Context;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{
    ClientSessionMemoryCache, ClientSessionStore, Resumption, Tls12ClientSessionValue,
    Tls12Resumption, Tls13ClientSessionValue,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, KeyLog, NamedGroup, RootCertStore, SignatureScheme};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::error::{ProxyError, Result};

/// TLS 会话缓存容量
pub const SESSION_CACHE_CAPACITY: usize = 10;

/// 构建后端 TLS 客户端配置的参数
#[derive(Debug, Clone, Default)]
pub struct TlsClientSettings {
    /// 客户端证书链（PEM）
    pub client_cert_path: PathBuf,
    /// 客户端私钥（PEM）
    pub client_key_path: PathBuf,
    /// 后端 CA；`None` 表示不校验后端证书
    pub server_ca_path: Option<PathBuf>,
    /// 是否启用会话缓存（仅 TLS 1.2 session id 恢复）
    pub session_cache: bool,
    /// [UNSAFE] TLS 密钥日志路径
    pub key_log_path: Option<PathBuf>,
}

/// 加载 PEM 证书链
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open cert file: {:?}", path))
        .map_err(ProxyError::certificate)?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {:?}", path))
        .map_err(ProxyError::certificate)?;

    if certs.is_empty() {
        return Err(ProxyError::certificate(anyhow::anyhow!(
            "No certificate found in {:?}",
            path
        )));
    }
    Ok(certs)
}

/// 加载 PEM 私钥（PKCS#1 / PKCS#8 / SEC1）
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open key file: {:?}", path))
        .map_err(ProxyError::certificate)?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("Failed to parse private key in {:?}", path))
        .and_then(|key| key.with_context(|| format!("No private key found in {:?}", path)))
        .map_err(ProxyError::certificate)
}

/// 加载 CA 证书池
pub fn load_ca_pool(path: &Path) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certificates(path)? {
        root_store
            .add(cert)
            .with_context(|| format!("Failed to add CA certificate from {:?}", path))
            .map_err(ProxyError::certificate)?;
    }
    Ok(root_store)
}

/// 构建后端 TLS 客户端配置
///
/// - 始终出示客户端证书
/// - 配置了 CA 时严格校验后端证书，否则跳过校验
/// - 按需启用会话缓存；缓存与 session ticket 互斥，只保留 TLS 1.2 session id 恢复
/// - rustls 不支持 TLS 1.2 重协商，后端发起的重协商会导致连接失败
pub fn build_client_config(settings: &TlsClientSettings) -> Result<Arc<rustls::ClientConfig>> {
    let certs = load_certificates(&settings.client_cert_path)?;
    let key = load_private_key(&settings.client_key_path)?;
    let provider = crypto_provider();

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")
        .map_err(ProxyError::certificate)?;

    let builder = match &settings.server_ca_path {
        Some(ca_path) => builder.with_root_certificates(load_ca_pool(ca_path)?),
        None => {
            warn!("No server CA configured, backend certificates will not be verified");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new(
                    provider,
                )))
        }
    };

    let mut config = builder
        .with_client_auth_cert(certs, key)
        .context("Failed to use client certificate and private key")
        .map_err(ProxyError::certificate)?;

    config.resumption = if settings.session_cache {
        Resumption::store(Arc::new(SessionIdCache::new(SESSION_CACHE_CAPACITY)))
            .tls12_resumption(Tls12Resumption::SessionIdOnly)
    } else {
        Resumption::disabled()
    };

    if let Some(path) = &settings.key_log_path {
        warn!(
            path = %path.display(),
            "[UNSAFE] TLS key logging enabled, session secrets will be written to disk"
        );
        config.key_log = Arc::new(KeyLogFile::open(path)?);
    }

    Ok(Arc::new(config))
}

fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// 只保存 TLS 1.2 会话的缓存，丢弃 TLS 1.3 ticket
#[derive(Debug)]
pub struct SessionIdCache {
    inner: ClientSessionMemoryCache,
}

impl SessionIdCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ClientSessionMemoryCache::new(capacity),
        }
    }
}

impl ClientSessionStore for SessionIdCache {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        self.inner.set_kx_hint(server_name, group);
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        self.inner.kx_hint(server_name)
    }

    fn set_tls12_session(
        &self,
        server_name: ServerName<'static>,
        value: Tls12ClientSessionValue,
    ) {
        self.inner.set_tls12_session(server_name, value);
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        self.inner.tls12_session(server_name)
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'static>) {
        self.inner.remove_tls12_session(server_name);
    }

    fn insert_tls13_ticket(
        &self,
        _server_name: ServerName<'static>,
        _value: Tls13ClientSessionValue,
    ) {
    }

    fn take_tls13_ticket(
        &self,
        _server_name: &ServerName<'static>,
    ) -> Option<Tls13ClientSessionValue> {
        None
    }
}

/// [UNSAFE] 以 NSS key log 格式追加写入 TLS 会话密钥
pub struct KeyLogFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl KeyLogFile {
    /// 以追加模式打开（不存在则创建）
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| ProxyError::KeyLog {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    fn format_line(label: &str, client_random: &[u8], secret: &[u8]) -> String {
        format!("{} {} {}\n", label, to_hex(client_random), to_hex(secret))
    }
}

impl fmt::Debug for KeyLogFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLogFile")
            .field("path", &self.path)
            .finish()
    }
}

impl KeyLog for KeyLogFile {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let line = Self::format_line(label, client_random, secret);
        let Ok(mut file) = self.file.lock() else {
            warn!(path = ?self.path, "Key log file lock poisoned");
            return;
        };
        if let Err(e) = file
            .write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
        {
            warn!(path = ?self.path, "Failed to write key log: {}", e);
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

/// 不校验后端证书链，但仍校验握手签名
#[derive(Debug)]
struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl NoCertificateVerification {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
        cert: &CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
