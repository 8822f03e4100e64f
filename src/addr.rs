//! 监听地址与后端地址的解析
//!
//! 监听地址必须是 `hostname:port`；主机名可以为空（监听所有地址），
//! IPv6 地址需要用方括号包裹。后端地址额外支持 `http://` / `https://` 前缀，
//! 省略端口时按 scheme 取默认端口，省略 scheme 时按 80/443 推断。
use crate::error::{ProxyError, Result};
use std::fmt;
use std::num::IntErrorKind;
use std::str::FromStr;

/// 明文 HTTP 默认端口
pub const HTTP_PORT: u16 = 80;
/// HTTPS 默认端口
pub const HTTPS_PORT: u16 = 443;

/// 主机名 + 端口
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    hostname: String,
    port: u16,
}

impl Addr {
    /// 创建地址，端口必须在 1..=65535 之间
    pub fn new(hostname: impl Into<String>, port: u16) -> Result<Self> {
        let hostname = hostname.into();
        if port == 0 {
            return Err(ProxyError::PortTooLow {
                addr: format!("{}:{}", hostname, port),
                port: port.to_string(),
            });
        }
        Ok(Self { hostname, port })
    }

    /// 解析监听地址，例如 `:443`、`0.0.0.0:8443`、`[::1]:8443`
    pub fn parse_listen(raw: &str) -> Result<Self> {
        let invalid = || ProxyError::InvalidListenFormat(raw.to_string());

        let (host, port) = split_host_port(raw).ok_or_else(invalid)?;
        let port = match port {
            Some(port) if !port.is_empty() => parse_port(raw, port)?,
            _ => return Err(invalid()),
        };
        if !host.is_empty() {
            validate_host(raw, host)?;
        }

        Ok(Self {
            hostname: host.to_string(),
            port,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 用于 bind / connect 的地址字符串；空主机名表示所有 IPv4 地址
    pub fn to_socket_string(&self) -> String {
        if self.hostname.is_empty() {
            format!("0.0.0.0:{}", self.port)
        } else {
            self.to_string()
        }
    }

    fn host_for_display(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_for_display(), self.port)
    }
}

/// 后端 scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => HTTP_PORT,
            Scheme::Https => HTTPS_PORT,
        }
    }

    /// 由知名端口推断 scheme
    pub fn from_port(port: u16) -> Option<Self> {
        match port {
            HTTP_PORT => Some(Scheme::Http),
            HTTPS_PORT => Some(Scheme::Https),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            _ => Err(()),
        }
    }
}

/// 后端地址：目标主机、端口以及（可能缺省的）scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddr {
    addr: Addr,
    scheme: Option<Scheme>,
}

impl BackendAddr {
    /// 解析后端地址
    ///
    /// - `https://host` 取 443，`http://host` 取 80
    /// - `host:443` / `host:80` 推断为 https / http
    /// - 其他端口不带 scheme 时 scheme 为 `None`
    /// - 显式 scheme 与 80/443 端口冲突时报错
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let invalid = || ProxyError::InvalidBackendFormat(raw.to_string());

        if let Some((scheme_text, rest)) = raw.split_once("://") {
            let scheme: Scheme =
                scheme_text
                    .parse()
                    .map_err(|_| ProxyError::UnsupportedScheme {
                        addr: raw.to_string(),
                        scheme: scheme_text.to_string(),
                    })?;

            let rest = rest.strip_suffix('/').unwrap_or(rest);
            if rest.contains(['/', '?', '#', '@']) {
                return Err(invalid());
            }

            let (host, port) = split_host_port(rest).ok_or_else(invalid)?;
            if host.is_empty() {
                return Err(invalid());
            }
            validate_host(raw, host)?;

            let port = match port {
                Some(port) if !port.is_empty() => parse_port(raw, port)?,
                _ => scheme.default_port(),
            };
            if let Some(implied) = Scheme::from_port(port) {
                if implied != scheme {
                    return Err(ProxyError::SchemeMismatch {
                        addr: raw.to_string(),
                        scheme: scheme.to_string(),
                        port,
                    });
                }
            }

            return Ok(Self {
                addr: Addr {
                    hostname: host.to_string(),
                    port,
                },
                scheme: Some(scheme),
            });
        }

        let (host, port) = split_host_port(raw).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(port) if !port.is_empty() => parse_port(raw, port)?,
            _ => return Err(ProxyError::MissingPort(raw.to_string())),
        };
        validate_host(raw, host)?;

        Ok(Self {
            addr: Addr {
                hostname: host.to_string(),
                port,
            },
            scheme: Scheme::from_port(port),
        })
    }

    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    pub fn hostname(&self) -> &str {
        self.addr.hostname()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// 显式或推断出的 scheme；非 80/443 端口且未指定时为 `None`
    pub fn scheme(&self) -> Option<Scheme> {
        self.scheme
    }

    /// 拒绝明文后端，本代理只发起 TLS 连接
    pub fn require_tls(&self) -> Result<()> {
        if self.scheme == Some(Scheme::Http) {
            return Err(ProxyError::PlaintextBackend(self.to_string()));
        }
        Ok(())
    }

    /// 转发请求时使用的 Host 头；默认端口 443 省略
    pub fn host_header(&self) -> String {
        if self.addr.port == HTTPS_PORT {
            self.addr.host_for_display()
        } else {
            self.addr.to_string()
        }
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Some(scheme) => write!(f, "{}://{}", scheme, self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

/// 拆分主机和端口；无法判定的格式（如未加括号的 IPv6）返回 `None`
fn split_host_port(raw: &str) -> Option<(&str, Option<&str>)> {
    if let Some(rest) = raw.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        if tail.is_empty() {
            return Some((host, None));
        }
        return tail.strip_prefix(':').map(|port| (host, Some(port)));
    }

    match raw.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => None,
        Some((host, port)) => Some((host, Some(port))),
        None => Some((raw, None)),
    }
}

fn parse_port(addr: &str, text: &str) -> Result<u16> {
    let too_low = || ProxyError::PortTooLow {
        addr: addr.to_string(),
        port: text.to_string(),
    };
    let too_high = || ProxyError::PortTooHigh {
        addr: addr.to_string(),
        port: text.to_string(),
    };

    match text.parse::<i64>() {
        Ok(port) if port < 1 => Err(too_low()),
        Ok(port) if port > u16::MAX as i64 => Err(too_high()),
        Ok(port) => Ok(port as u16),
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => Err(too_high()),
            IntErrorKind::NegOverflow => Err(too_low()),
            _ => Err(ProxyError::InvalidPort {
                addr: addr.to_string(),
                port: text.to_string(),
            }),
        },
    }
}

fn validate_host(addr: &str, host: &str) -> Result<()> {
    let candidate = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };

    url::Host::parse(&candidate)
        .map(|_| ())
        .map_err(|e| ProxyError::InvalidHost {
            addr: addr.to_string(),
            host: host.to_string(),
            reason: e.to_string(),
        })
}
