use std::net::IpAddr;

use hickory_resolver::proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_resolver::proto::serialize::binary::BinEncodable;

use crate::common::ForwardError;
use crate::router::geoip::answer_addrs;
use crate::upstream::Network;

/// 入站请求：DNS 报文加到达的网络
#[derive(Debug, Clone)]
pub struct Request {
    pub message: Message,
    pub network: Network,
}

impl Request {
    pub fn new(message: Message, network: Network) -> Self {
        Self { message, network }
    }

    pub fn from_bytes(bytes: &[u8], network: Network) -> Result<Self, ForwardError> {
        let message =
            Message::from_vec(bytes).map_err(|e| ForwardError::Protocol(format!("malformed query: {}", e)))?;
        Ok(Self::new(message, network))
    }

    pub fn id(&self) -> u16 {
        self.message.id()
    }

    pub fn question(&self) -> Option<&Query> {
        self.message.queries().first()
    }

    /// Lowercased, fully qualified question name.
    pub fn domain(&self) -> Option<String> {
        self.question().map(|q| q.name().to_lowercase().to_ascii())
    }

    /// `name type` for logging.
    pub fn describe(&self) -> String {
        match self.question() {
            Some(q) => format!("{} {}", q.name(), q.query_type()),
            None => "<no question>".to_string(),
        }
    }
}

/// Whether `reply` answers `request`: a response with the same id and the same single question.
pub fn matches(request: &Message, reply: &Message) -> bool {
    if reply.message_type() != MessageType::Response || reply.id() != request.id() {
        return false;
    }
    match (request.queries(), reply.queries()) {
        ([q], [r]) => {
            q.name().to_lowercase() == r.name().to_lowercase()
                && q.query_type() == r.query_type()
                && q.query_class() == r.query_class()
        }
        _ => false,
    }
}

pub fn validate(request: &Request, reply: &Message) -> Result<(), ForwardError> {
    if matches(&request.message, reply) {
        return Ok(());
    }
    Err(ForwardError::ResponseMismatch {
        id: reply.id(),
        question: request.describe(),
    })
}

/// Synthesized reply carrying `rcode` and the original question.
pub fn error_response(request: &Message, rcode: ResponseCode) -> Message {
    let mut reply = Message::error_msg(request.id(), request.op_code(), rcode);
    reply
        .set_message_type(MessageType::Response)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .add_queries(request.queries().to_vec());
    reply
}

pub fn to_wire(message: &Message) -> Result<Vec<u8>, ForwardError> {
    message
        .to_bytes()
        .map_err(|e| ForwardError::Protocol(format!("encode reply: {}", e)))
}

/// First A/AAAA address in the answer section.
pub fn first_answer_addr(reply: &Message) -> Option<IpAddr> {
    answer_addrs(reply).into_iter().next()
}
