//! DNS 监听：UDP 每个报文一个任务，TCP 每个连接一个任务（连接内顺序处理多个查询）。

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::ForwardError;
use crate::forward::message::{error_response, to_wire, Request};
use crate::forward::Handler;
use crate::upstream::Network;

const MAX_DNS_PACKET_SIZE: usize = 4096;
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// 无 EDNS 时 UDP 应答上限
const MIN_UDP_PAYLOAD: usize = 512;

pub struct DnsServer {
    udp: Arc<UdpSocket>,
    tcp: TcpListener,
    handler: Arc<dyn Handler>,
}

impl DnsServer {
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn Handler>) -> io::Result<Self> {
        let udp = Arc::new(UdpSocket::bind(addr).await?);
        // 端口为 0 时 TCP 复用 UDP 分配到的端口
        let tcp = TcpListener::bind(udp.local_addr()?).await?;
        Ok(Self { udp, tcp, handler })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!(listen = %addr, "dns server listening on udp+tcp");
        }
        let udp = tokio::spawn(run_udp(self.udp, self.handler.clone(), cancel.clone()));
        let tcp = tokio::spawn(run_tcp(self.tcp, self.handler, cancel));
        let _ = tokio::join!(udp, tcp);
    }
}

async fn run_udp(socket: Arc<UdpSocket>, handler: Arc<dyn Handler>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "udp recv error");
                    continue;
                }
            },
        };
        let query = buf[..len].to_vec();
        let socket = socket.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Some(reply) = handle_query(handler.as_ref(), &query, Network::Udp).await {
                if let Err(e) = socket.send_to(&reply, peer).await {
                    debug!(peer = %peer, error = %e, "udp send error");
                }
            }
        });
    }
}

async fn run_tcp(listener: TcpListener, handler: Arc<dyn Handler>, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "tcp accept error");
                    continue;
                }
            },
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tcp_connection(stream, handler.as_ref()).await {
                debug!(peer = %peer, error = %e, "tcp connection closed");
            }
        });
    }
}

async fn handle_tcp_connection(mut stream: TcpStream, handler: &dyn Handler) -> io::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(()),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;

        let Some(reply) = handle_query(handler, &query, Network::Tcp).await else {
            return Ok(());
        };
        let len = u16::try_from(reply.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "reply too large"))?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&reply).await?;
    }
}

/// Run one wire query through the handler chain and encode the reply.
///
/// Errors become a reply with the matching rcode; unparseable queries get no reply.
pub async fn handle_query(handler: &dyn Handler, bytes: &[u8], network: Network) -> Option<Vec<u8>> {
    let request = match Request::from_bytes(bytes, network) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "dropping malformed query");
            return None;
        }
    };

    let reply = match handler.serve(&request).await {
        Ok(reply) => reply,
        Err(e) => {
            log_failure(&request, &e);
            error_response(&request.message, e.response_code())
        }
    };

    let mut wire = encode(&reply)?;
    if network == Network::Udp {
        let max = (request.message.max_payload() as usize).max(MIN_UDP_PAYLOAD);
        if wire.len() > max {
            wire = encode(&truncated(&request.message, &reply))?;
        }
    }
    Some(wire)
}

fn encode(reply: &Message) -> Option<Vec<u8>> {
    match to_wire(reply) {
        Ok(wire) => Some(wire),
        Err(e) => {
            error!(error = %e, "failed to encode reply");
            None
        }
    }
}

/// Header and question only, with TC set.
fn truncated(request: &Message, reply: &Message) -> Message {
    let mut out = error_response(request, reply.response_code());
    out.set_truncated(true)
        .set_authoritative(reply.authoritative())
        .set_recursion_available(reply.recursion_available());
    out
}

fn log_failure(request: &Request, e: &ForwardError) {
    let kind = e.kind().as_str();
    match e {
        ForwardError::LimitExceeded(_) | ForwardError::NoNextHandler(_) => {
            debug!(query = request.describe(), kind = kind, error = %e, "query failed");
        }
        _ => warn!(query = request.describe(), kind = kind, error = %e, "query failed"),
    }
}
