use std::net::IpAddr;
use tracing::warn;
use url::Url;

use crate::addr::Addr;

/// 出口 HTTP 代理（HTTP CONNECT）
///
/// 从 `HTTPS_PROXY`（及小写形式）读取，`NO_PROXY` 排除目标主机；
/// localhost 与回环地址永远直连。只支持 `http://` 代理，`https://` 代理会被忽略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressProxy {
    addr: Addr,
    no_proxy: Vec<String>,
}

impl EgressProxy {
    /// 读取进程环境变量
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 通过给定的查找函数读取代理设置
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let first = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| lookup(key))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
        };

        let raw = first(&["HTTPS_PROXY", "https_proxy"])?;
        let addr = parse_proxy_url(&raw)?;
        let no_proxy = first(&["NO_PROXY", "no_proxy"])
            .map(|value| {
                value
                    .split(',')
                    .map(|entry| entry.trim().to_ascii_lowercase())
                    .filter(|entry| !entry.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Some(Self { addr, no_proxy })
    }

    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    /// 目标主机是否需要经过代理
    pub fn applies_to(&self, host: &str) -> bool {
        let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
        if host == "localhost" {
            return false;
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            if ip.is_loopback() {
                return false;
            }
        }

        !self.no_proxy.iter().any(|entry| {
            if entry == "*" {
                return true;
            }
            match entry.strip_prefix('.') {
                Some(suffix) => host.ends_with(&format!(".{}", suffix)),
                None => host == *entry || host.ends_with(&format!(".{}", entry)),
            }
        })
    }
}

fn parse_proxy_url(raw: &str) -> Option<Addr> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };

    let url = match Url::parse(&with_scheme) {
        Ok(url) => url,
        Err(e) => {
            warn!("Ignoring invalid egress proxy '{}': {}", raw, e);
            return None;
        }
    };
    if url.scheme() != "http" {
        warn!(
            "Ignoring egress proxy '{}': only http:// proxies are supported",
            raw
        );
        return None;
    }

    let host = match url.host() {
        Some(url::Host::Domain(domain)) => domain.to_string(),
        Some(url::Host::Ipv4(ip)) => ip.to_string(),
        Some(url::Host::Ipv6(ip)) => ip.to_string(),
        None => {
            warn!("Ignoring egress proxy '{}': missing host", raw);
            return None;
        }
    };
    let port = url.port_or_known_default().unwrap_or(80);
    Addr::new(host, port).ok()
}
