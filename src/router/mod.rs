pub mod geoip;
pub mod provider;
pub mod rules;
pub mod trie;

use std::sync::Arc;

use hickory_resolver::proto::op::Message;
use tracing::{debug, info};

use crate::config::ForwardConfig;
use geoip::{GeoIpDb, GeoLookup, GeoPolicy};
use rules::RuleSet;

/// Request-time routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<'a> {
    pub upstream: &'a str,
    /// false when no rule matched and the default was used
    pub matched: bool,
}

/// 路由快照：规则、地理策略与默认上游，构建后只读
pub struct Router {
    rules: RuleSet,
    geo: GeoPolicy,
    default: String,
}

impl Router {
    pub fn new(rules: RuleSet, geo: GeoPolicy, default: impl Into<String>) -> Self {
        Self {
            rules,
            geo,
            default: default.into(),
        }
    }

    pub fn from_config(config: &ForwardConfig) -> anyhow::Result<Self> {
        let mut rules = RuleSet::new();
        for rule in &config.rules {
            rules.append(&rule.pattern, &rule.upstream)?;
        }

        let geo = match &config.geoip {
            Some(geoip) => {
                let db = GeoIpDb::load(&geoip.database)?;
                info!(path = geoip.database, "GeoIP database loaded");
                let lookup: Arc<dyn GeoLookup> = Arc::new(db);
                let mut geo = GeoPolicy::new(lookup);
                for rule in &geoip.rules {
                    geo.append(&rule.region, &rule.upstream);
                }
                geo
            }
            None => GeoPolicy::disabled(),
        };

        info!(
            rules = rules.len(),
            geo_rules = geo.rules().len(),
            default = config.default,
            "router initialized"
        );
        Ok(Self::new(rules, geo, config.default.clone()))
    }

    /// Pick the upstream for a domain: first matching rule, else the default.
    pub fn route_request(&self, domain: &str) -> Route<'_> {
        match self.rules.find(domain) {
            Some(upstream) => Route {
                upstream,
                matched: true,
            },
            None => {
                debug!(domain = domain, default = self.default, "no rule matched, using default");
                Route {
                    upstream: &self.default,
                    matched: false,
                }
            }
        }
    }

    /// Upstream to re-issue the query against, when the answer geolocates elsewhere.
    pub fn route_response(&self, response: &Message, answered_by: &str) -> Option<&str> {
        if !self.geo.is_enabled() {
            return None;
        }
        let target = self.geo.classify(response, &self.default);
        (target != answered_by).then_some(target)
    }

    pub fn default_upstream(&self) -> &str {
        &self.default
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn geo(&self) -> &GeoPolicy {
        &self.geo
    }
}
