use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_resolver::proto::op::Message;
use hickory_resolver::proto::serialize::binary::BinEncodable;

use super::{DnsClient, Network, TransportOptions};
use crate::common::ForwardError;

const DNS_MESSAGE: &str = "application/dns-message";

/// DNS-over-HTTPS 客户端（RFC 8484 GET）
pub struct DohClient {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl DohClient {
    pub fn new(url: &str, opts: &TransportOptions) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(opts.timeout)
            .pool_idle_timeout(opts.expire)
            .build()
            .map_err(|e| ForwardError::Config(format!("DoH client for {}: {}", url, e)))?;
        Ok(Self {
            url: url.to_string(),
            client,
            timeout: opts.timeout,
        })
    }

    /// GET URL carrying the query as the `dns` parameter.
    pub fn request_url(&self, bytes: &[u8]) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}dns={}", self.url, sep, URL_SAFE_NO_PAD.encode(bytes))
    }
}

#[async_trait]
impl DnsClient for DohClient {
    async fn exchange(&self, request: &Message, _network: Network) -> Result<Message, ForwardError> {
        let bytes = request
            .to_bytes()
            .map_err(|e| ForwardError::Protocol(e.to_string()))?;

        let response = self
            .client
            .get(self.request_url(&bytes))
            .header(reqwest::header::ACCEPT, DNS_MESSAGE)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ForwardError::Timeout(self.url.clone())
                } else {
                    ForwardError::transport(self.url.clone(), e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::transport(self.url.clone(), format!("HTTP {}", status)));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ForwardError::transport(self.url.clone(), e))?;
        Message::from_vec(&body)
            .map_err(|e| ForwardError::Protocol(format!("bad reply from {}: {}", self.url, e)))
    }
}

impl std::fmt::Debug for DohClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohClient")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_url_encoding() {
        let client = DohClient::new("https://dns.google/dns-query", &TransportOptions::default()).unwrap();
        // 0xfb 0xff 编码为 URL 安全且无填充
        assert_eq!(
            client.request_url(&[0xfb, 0xff]),
            "https://dns.google/dns-query?dns=-_8"
        );

        let client = DohClient::new("https://doh.example/q?ct", &TransportOptions::default()).unwrap();
        assert!(client.request_url(&[0]).starts_with("https://doh.example/q?ct&dns="));
    }
}
