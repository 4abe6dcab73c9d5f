use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use hickory_resolver::proto::op::Message;
use hickory_resolver::proto::rr::RData;
use tracing::debug;

/// 国家代码查询能力（IP -> ISO 国家代码）
pub trait GeoLookup: Send + Sync {
    fn country_code(&self, ip: IpAddr) -> Result<String>;
}

/// GeoIP 数据库（MaxMind mmdb 格式）
pub struct GeoIpDb {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl GeoIpDb {
    /// 从 mmdb 文件加载
    pub fn load(path: &str) -> Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path)
            .map_err(|e| anyhow::anyhow!("failed to load GeoIP database '{}': {}", path, e))?;
        Ok(Self { reader })
    }
}

impl GeoLookup for GeoIpDb {
    /// 查询 IP 对应的国家 ISO 代码（如 "CN", "US"）
    fn country_code(&self, ip: IpAddr) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct Country {
            country: Option<CountryInfo>,
        }
        #[derive(serde::Deserialize)]
        struct CountryInfo {
            iso_code: Option<String>,
        }

        let result: Country = self
            .reader
            .lookup(ip)
            .map_err(|e| anyhow::anyhow!("GeoIP lookup for {} failed: {}", ip, e))?;
        result
            .country
            .and_then(|c| c.iso_code)
            .ok_or_else(|| anyhow::anyhow!("no country for {}", ip))
    }
}

/// A/AAAA addresses of the answer section, in order.
pub fn answer_addrs(message: &Message) -> Vec<IpAddr> {
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoRule {
    pub region: String,
    pub upstream: String,
}

/// Response-time steering: picks an upstream from the country of the answer addresses.
#[derive(Default)]
pub struct GeoPolicy {
    lookup: Option<Arc<dyn GeoLookup>>,
    rules: Vec<GeoRule>,
}

impl GeoPolicy {
    pub fn new(lookup: Arc<dyn GeoLookup>) -> Self {
        Self {
            lookup: Some(lookup),
            rules: Vec::new(),
        }
    }

    /// A policy without a database; `classify` always returns the default.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn append(&mut self, region: &str, upstream: &str) {
        self.rules.push(GeoRule {
            region: region.trim().to_uppercase(),
            upstream: upstream.to_string(),
        });
    }

    pub fn rules(&self) -> &[GeoRule] {
        &self.rules
    }

    pub fn is_enabled(&self) -> bool {
        self.lookup.is_some() && !self.rules.is_empty()
    }

    /// Upstream for the first answer address whose country has a rule, else `default`.
    pub fn classify<'a>(&'a self, response: &Message, default: &'a str) -> &'a str {
        let Some(lookup) = self.lookup.as_ref() else {
            return default;
        };
        if self.rules.is_empty() {
            return default;
        }

        for addr in answer_addrs(response) {
            let country = match lookup.country_code(addr) {
                Ok(code) => code,
                Err(e) => {
                    debug!(address = %addr, error = %e, "GeoIP lookup failed");
                    continue;
                }
            };
            if let Some(rule) = self.rules.iter().find(|r| r.region == country) {
                debug!(address = %addr, country = country, upstream = rule.upstream, "geo rule matched");
                return &rule.upstream;
            }
        }
        default
    }
}
