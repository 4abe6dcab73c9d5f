use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::proto::op::Message;
use hickory_resolver::proto::serialize::binary::BinEncodable;
use rustls::crypto::ring as ring_provider;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::plain::{is_closed, stream_exchange};
use super::pool::ConnPool;
use super::{DnsClient, Network, TransportOptions};
use crate::common::ForwardError;

/// 构建 TLS ClientConfig（ring provider + webpki 根证书）
pub fn build_tls_config() -> Result<ClientConfig, ForwardError> {
    let provider = Arc::new(ring_provider::default_provider());
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ForwardError::Config(format!("TLS config error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(config)
}

/// DNS-over-TLS 客户端
pub struct TlsClient {
    addr: SocketAddr,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    timeout: Duration,
    pool: Arc<ConnPool<TlsStream<TcpStream>>>,
}

impl TlsClient {
    pub fn new(addr: SocketAddr, opts: &TransportOptions) -> Result<Self, ForwardError> {
        // 未配置 tls-servername 时用 IP 作为服务器名
        let server_name = match &opts.tls_servername {
            Some(name) => ServerName::try_from(name.clone())
                .map_err(|e| ForwardError::Config(format!("invalid tls-servername '{}': {}", name, e)))?,
            None => ServerName::IpAddress(addr.ip().into()),
        };
        let connector = TlsConnector::from(Arc::new(build_tls_config()?));
        let pool = Arc::new(ConnPool::new(opts.expire));
        Ok(Self {
            addr,
            server_name,
            connector,
            timeout: opts.timeout,
            pool,
        })
    }

    async fn dial(&self) -> Result<TlsStream<TcpStream>, ForwardError> {
        let tcp = TcpStream::connect(self.addr).await?;
        let stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| ForwardError::transport(format!("tls://{}", self.addr), format!("handshake: {}", e)))?;
        Ok(stream)
    }

    async fn roundtrip(&self, bytes: &[u8]) -> Result<Message, ForwardError> {
        let (mut stream, cached) = match self.pool.get().await {
            Some(stream) => (stream, true),
            None => (self.dial().await?, false),
        };
        let reply = match stream_exchange(&mut stream, bytes).await {
            Ok(reply) => reply,
            Err(e) if cached && is_closed(&e) => return Err(ForwardError::CachedConnectionClosed),
            Err(e) => return Err(ForwardError::transport(format!("tls://{}", self.addr), e)),
        };
        self.pool.put(stream).await;
        Message::from_vec(&reply)
            .map_err(|e| ForwardError::Protocol(format!("bad reply from tls://{}: {}", self.addr, e)))
    }
}

#[async_trait]
impl DnsClient for TlsClient {
    async fn exchange(&self, request: &Message, _network: Network) -> Result<Message, ForwardError> {
        let bytes = request
            .to_bytes()
            .map_err(|e| ForwardError::Protocol(e.to_string()))?;
        match tokio::time::timeout(self.timeout, self.roundtrip(&bytes)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(ForwardError::Io(e))) => Err(ForwardError::transport(format!("tls://{}", self.addr), e)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ForwardError::Timeout(format!("tls://{}", self.addr))),
        }
    }
}
