use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::proto::op::{Message, MessageType, OpCode, Query};
use hickory_resolver::proto::rr::{Name, RecordType};
use tracing::{debug, info, warn};

use super::{Network, Transport, Upstream};
use crate::common::ForwardError;
use crate::config::types::HealthCheckConfig;

/// 健康探测参数
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub interval: Duration,
    pub domain: String,
    pub recursion_desired: bool,
    pub timeout: Duration,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            domain: ".".to_string(),
            recursion_desired: true,
            timeout: Duration::from_secs(2),
        }
    }
}

impl HealthCheck {
    pub fn from_config(config: &HealthCheckConfig, timeout: Duration) -> Self {
        Self {
            interval: config.interval(),
            domain: config.domain.clone(),
            recursion_desired: config.recursion_desired,
            timeout,
        }
    }

    /// `<domain> IN NS` probe query.
    pub fn probe_message(&self) -> Result<Message, ForwardError> {
        let name = Name::from_str(&self.domain)
            .map_err(|e| ForwardError::Config(format!("invalid health-check domain: {}", e)))?;
        let mut msg = Message::new();
        msg.set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(self.recursion_desired)
            .add_query(Query::query(name, RecordType::NS));
        Ok(msg)
    }
}

impl Upstream {
    /// Send one probe; any well-formed reply counts as alive.
    pub async fn check(&self) -> Result<(), ForwardError> {
        let probe = self.health().probe_message()?;
        let network = match self.transport() {
            Transport::Tcp => Network::Tcp,
            _ => Network::Udp,
        };
        match tokio::time::timeout(self.health().timeout, self.exchange(&probe, network)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ForwardError::Timeout(self.address().to_string())),
        }
    }

    /// Start the out-of-band probe loop unless one is already running.
    ///
    /// 每次失败累加计数并等待 interval，成功后清零退出；上游被释放后循环结束。
    pub fn probe(self: &Arc<Self>) {
        if self.probing().swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(upstream) = weak.upgrade() else {
                    return;
                };
                match upstream.check().await {
                    Ok(()) => {
                        if upstream.fails() > 0 {
                            info!(upstream = upstream.address(), "upstream is healthy again");
                        }
                        upstream.reset();
                        upstream.probing().store(false, Ordering::Release);
                        return;
                    }
                    Err(e) => {
                        let fails = upstream.record_failure();
                        warn!(
                            upstream = upstream.address(),
                            fails = fails,
                            error = %e,
                            "health check failed"
                        );
                        let interval = upstream.health().interval;
                        drop(upstream);
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        });
        debug!(upstream = self.address(), "health check started");
    }
}
