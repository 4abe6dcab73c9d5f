//! 明文 DNS 传输（UDP / TCP）
//!
//! TCP 消息带 2 字节大端长度前缀，空闲连接放回池中复用。

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::proto::op::Message;
use hickory_resolver::proto::serialize::binary::BinEncodable;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::pool::ConnPool;
use super::{DnsClient, Network, TransportOptions};
use crate::common::ForwardError;

/// UDP 响应的最大长度（EDNS）
pub const MAX_UDP_PAYLOAD: usize = 65535;

pub struct PlainClient {
    addr: SocketAddr,
    timeout: Duration,
    /// tcp:// 上游始终使用 TCP
    tcp_only: bool,
    pool: Arc<ConnPool<TcpStream>>,
}

impl PlainClient {
    pub fn new(addr: SocketAddr, opts: &TransportOptions, tcp_only: bool) -> Self {
        let pool = Arc::new(ConnPool::new(opts.expire));
        Self {
            addr,
            timeout: opts.timeout,
            tcp_only,
            pool,
        }
    }

    async fn exchange_udp(&self, request: &Message, bytes: &[u8]) -> Result<Message, ForwardError> {
        let bind: SocketAddr = if self.addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.addr).await?;
        socket.send(bytes).await?;

        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
        loop {
            let n = socket.recv(&mut buf).await?;
            let reply = Message::from_vec(&buf[..n])
                .map_err(|e| ForwardError::Protocol(format!("bad reply from {}: {}", self.addr, e)));
            match reply {
                // 丢弃 id 不匹配的迟到报文
                Ok(reply) if reply.id() != request.id() => {
                    debug!(upstream = %self.addr, id = reply.id(), "dropping stale udp reply");
                }
                other => return other,
            }
        }
    }

    async fn exchange_tcp(&self, bytes: &[u8]) -> Result<Message, ForwardError> {
        let (mut stream, cached) = match self.pool.get().await {
            Some(stream) => (stream, true),
            None => (TcpStream::connect(self.addr).await?, false),
        };

        let reply = match stream_exchange(&mut stream, bytes).await {
            Ok(reply) => reply,
            Err(e) if cached && is_closed(&e) => return Err(ForwardError::CachedConnectionClosed),
            Err(e) => return Err(e.into()),
        };
        self.pool.put(stream).await;
        Message::from_vec(&reply)
            .map_err(|e| ForwardError::Protocol(format!("bad reply from {}: {}", self.addr, e)))
    }
}

#[async_trait]
impl DnsClient for PlainClient {
    async fn exchange(&self, request: &Message, network: Network) -> Result<Message, ForwardError> {
        let bytes = request
            .to_bytes()
            .map_err(|e| ForwardError::Protocol(e.to_string()))?;
        let network = if self.tcp_only { Network::Tcp } else { network };

        let result = match network {
            Network::Udp => tokio::time::timeout(self.timeout, self.exchange_udp(request, &bytes)).await,
            Network::Tcp => tokio::time::timeout(self.timeout, self.exchange_tcp(&bytes)).await,
        };
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(ForwardError::Io(e))) => Err(ForwardError::transport(self.addr.to_string(), e)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ForwardError::Timeout(format!("{} over {}", self.addr, network))),
        }
    }
}

/// Write one length-prefixed message and read one length-prefixed reply.
pub async fn stream_exchange<S>(stream: &mut S, bytes: &[u8]) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "dns message too large"))?;
    let mut frame = Vec::with_capacity(bytes.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(bytes);
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).await?;
    Ok(reply)
}

/// 对端已关闭复用连接的典型错误
pub fn is_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use hickory_resolver::proto::op::{MessageType, Query};
    use hickory_resolver::proto::rr::{Name, RecordType};
    use tokio::net::TcpListener;

    use super::*;

    fn query(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id)
            .add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        msg
    }

    fn reply_to(bytes: &[u8]) -> Vec<u8> {
        let mut msg = Message::from_vec(bytes).unwrap();
        msg.set_message_type(MessageType::Response);
        msg.to_vec().unwrap()
    }

    fn opts() -> TransportOptions {
        TransportOptions {
            timeout: Duration::from_millis(500),
            ..TransportOptions::default()
        }
    }

    #[test]
    fn client_can_be_built_outside_runtime() {
        let addr: SocketAddr = "127.0.0.1:53".parse().unwrap();
        let client = PlainClient::new(addr, &opts(), true);
        assert!(!client.pool.cleanup_started());
    }

    #[tokio::test]
    async fn udp_exchange_skips_stale_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&query(9999).to_vec().unwrap(), peer).await.unwrap();
            server.send_to(&reply_to(&buf[..n]), peer).await.unwrap();
        });

        let client = PlainClient::new(addr, &opts(), false);
        let reply = client.exchange(&query(42), Network::Udp).await.unwrap();
        assert_eq!(reply.id(), 42);
        assert_eq!(reply.message_type(), MessageType::Response);
    }

    #[tokio::test]
    async fn tcp_exchange_reuses_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for _ in 0..2 {
                let mut len = [0u8; 2];
                stream.read_exact(&mut len).await.unwrap();
                let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
                stream.read_exact(&mut body).await.unwrap();
                let reply = reply_to(&body);
                stream.write_all(&(reply.len() as u16).to_be_bytes()).await.unwrap();
                stream.write_all(&reply).await.unwrap();
            }
        });

        let client = PlainClient::new(addr, &opts(), true);
        assert_eq!(client.exchange(&query(1), Network::Udp).await.unwrap().id(), 1);
        assert_eq!(client.exchange(&query(2), Network::Tcp).await.unwrap().id(), 2);
    }

    #[tokio::test]
    async fn closed_cached_connection_is_recoverable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len = [0u8; 2];
            stream.read_exact(&mut len).await.unwrap();
            let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
            stream.read_exact(&mut body).await.unwrap();
            let reply = reply_to(&body);
            stream.write_all(&(reply.len() as u16).to_be_bytes()).await.unwrap();
            stream.write_all(&reply).await.unwrap();
            // 应答后关闭连接
        });

        let client = PlainClient::new(addr, &opts(), true);
        client.exchange(&query(1), Network::Tcp).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = client.exchange(&query(2), Network::Tcp).await.unwrap_err();
        assert!(err.is_recoverable(), "{}", err);
    }

    #[tokio::test]
    async fn udp_timeout() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let client = PlainClient::new(
            addr,
            &TransportOptions {
                timeout: Duration::from_millis(50),
                ..TransportOptions::default()
            },
            false,
        );
        let err = client.exchange(&query(1), Network::Udp).await.unwrap_err();
        assert!(matches!(err, ForwardError::Timeout(_)));
        drop(server);
    }
}
