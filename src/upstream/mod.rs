pub mod doh;
pub mod group;
pub mod health;
pub mod plain;
pub mod policy;
pub mod pool;
pub mod tls;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::proto::op::Message;

use crate::common::ForwardError;

pub use group::UpstreamGroup;
pub use health::HealthCheck;
pub use policy::SelectionPolicy;

/// 查询所用的传输层网络
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Udp,
    Tcp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Udp => write!(f, "udp"),
            Network::Tcp => write!(f, "tcp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// UDP，必要时 TCP
    Plain,
    Tcp,
    Tls,
    Doh,
}

/// Parsed upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAddr {
    Plain(SocketAddr),
    Tcp(SocketAddr),
    Tls(SocketAddr),
    Doh(String),
}

impl UpstreamAddr {
    /// Accepts `1.1.1.1`, `1.1.1.1:53`, `[::1]:53`, `udp://`, `dns://`, `tcp://`, `tls://`
    /// and `https://` URLs.
    pub fn parse(raw: &str) -> Result<Self, ForwardError> {
        let raw = raw.trim();
        if raw.starts_with("https://") {
            return Ok(UpstreamAddr::Doh(raw.to_string()));
        }
        if let Some(rest) = raw.strip_prefix("tls://") {
            return Ok(UpstreamAddr::Tls(parse_socket_addr(rest, 853)?));
        }
        if let Some(rest) = raw.strip_prefix("tcp://") {
            return Ok(UpstreamAddr::Tcp(parse_socket_addr(rest, 53)?));
        }
        let rest = raw
            .strip_prefix("udp://")
            .or_else(|| raw.strip_prefix("dns://"))
            .unwrap_or(raw);
        if rest.contains("://") {
            return Err(ForwardError::Config(format!(
                "unsupported upstream scheme: {}",
                raw
            )));
        }
        Ok(UpstreamAddr::Plain(parse_socket_addr(rest, 53)?))
    }

    pub fn transport(&self) -> Transport {
        match self {
            UpstreamAddr::Plain(_) => Transport::Plain,
            UpstreamAddr::Tcp(_) => Transport::Tcp,
            UpstreamAddr::Tls(_) => Transport::Tls,
            UpstreamAddr::Doh(_) => Transport::Doh,
        }
    }
}

impl fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamAddr::Plain(addr) => write!(f, "{}", addr),
            UpstreamAddr::Tcp(addr) => write!(f, "tcp://{}", addr),
            UpstreamAddr::Tls(addr) => write!(f, "tls://{}", addr),
            UpstreamAddr::Doh(url) => write!(f, "{}", url),
        }
    }
}

fn parse_socket_addr(s: &str, default_port: u16) -> Result<SocketAddr, ForwardError> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let host = s.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| ForwardError::Config(format!("not an IP address: {}", s)))
}

/// 传输层参数，所有上游共享
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub tls_servername: Option<String>,
    /// 空闲连接过期时间
    pub expire: Duration,
    /// 单次收发超时
    pub timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            tls_servername: None,
            expire: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Sends one DNS message to one upstream and returns its reply.
#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn exchange(&self, request: &Message, network: Network) -> Result<Message, ForwardError>;
}

/// Build the wire client for an address.
pub fn connect(addr: &UpstreamAddr, opts: &TransportOptions) -> Result<Arc<dyn DnsClient>, ForwardError> {
    let client: Arc<dyn DnsClient> = match addr {
        UpstreamAddr::Plain(sock) => Arc::new(plain::PlainClient::new(*sock, opts, false)),
        UpstreamAddr::Tcp(sock) => Arc::new(plain::PlainClient::new(*sock, opts, true)),
        UpstreamAddr::Tls(sock) => Arc::new(tls::TlsClient::new(*sock, opts)?),
        UpstreamAddr::Doh(url) => Arc::new(doh::DohClient::new(url, opts)?),
    };
    Ok(client)
}

/// 单个上游：地址、传输客户端与存活状态
pub struct Upstream {
    address: String,
    transport: Transport,
    client: Arc<dyn DnsClient>,
    fails: AtomicU32,
    /// 是否已有探测循环在运行
    probing: AtomicBool,
    health: HealthCheck,
}

impl Upstream {
    pub fn new(
        address: impl Into<String>,
        transport: Transport,
        client: Arc<dyn DnsClient>,
        health: HealthCheck,
    ) -> Self {
        Self {
            address: address.into(),
            transport,
            client,
            fails: AtomicU32::new(0),
            probing: AtomicBool::new(false),
            health,
        }
    }

    pub fn from_addr(
        addr: &UpstreamAddr,
        opts: &TransportOptions,
        health: HealthCheck,
    ) -> Result<Self, ForwardError> {
        let client = connect(addr, opts)?;
        Ok(Self::new(addr.to_string(), addr.transport(), client, health))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Relaxed)
    }

    /// `max_fails == 0` 时永不标记为 down
    pub fn is_down(&self, max_fails: u32) -> bool {
        max_fails != 0 && self.fails() >= max_fails
    }

    pub fn record_failure(&self) -> u32 {
        self.fails.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset(&self) {
        self.fails.store(0, Ordering::Relaxed);
    }

    pub async fn exchange(&self, request: &Message, network: Network) -> Result<Message, ForwardError> {
        self.client.exchange(request, network).await
    }

    pub(crate) fn health(&self) -> &HealthCheck {
        &self.health
    }

    pub(crate) fn probing(&self) -> &AtomicBool {
        &self.probing
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("address", &self.address)
            .field("transport", &self.transport)
            .field("fails", &self.fails())
            .finish()
    }
}
