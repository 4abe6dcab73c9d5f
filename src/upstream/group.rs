use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::info;

use super::health::HealthCheck;
use super::policy::SelectionPolicy;
use super::{TransportOptions, Upstream, UpstreamAddr};
use crate::common::ForwardError;
use crate::config::types::UpstreamGroupConfig;

/// 上游组：有序的上游列表加选择策略
pub struct UpstreamGroup {
    name: String,
    upstreams: Vec<Arc<Upstream>>,
    policy: SelectionPolicy,
}

impl UpstreamGroup {
    pub fn new(name: impl Into<String>, upstreams: Vec<Arc<Upstream>>, policy: SelectionPolicy) -> Self {
        Self {
            name: name.into(),
            upstreams,
            policy,
        }
    }

    pub fn from_config(
        config: &UpstreamGroupConfig,
        default_policy: &str,
        opts: &TransportOptions,
        health: &HealthCheck,
    ) -> Result<Self, ForwardError> {
        let policy = SelectionPolicy::from_name(config.policy.as_deref().unwrap_or(default_policy))?;
        let upstreams = config
            .to
            .iter()
            .map(|raw| {
                let addr = UpstreamAddr::parse(raw)?;
                Upstream::from_addr(&addr, opts, health.clone()).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        if upstreams.is_empty() {
            return Err(ForwardError::NoUpstreamConfigured(config.name.clone()));
        }

        info!(
            group = config.name,
            upstreams = ?upstreams.iter().map(|u| u.address()).collect::<Vec<_>>(),
            policy = policy.name(),
            "upstream group configured"
        );
        Ok(Self::new(config.name.clone(), upstreams, policy))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Candidates for one request, in the policy's order.
    pub fn ordered(&self) -> Vec<Arc<Upstream>> {
        self.policy.order(&self.upstreams)
    }

    /// 所有上游都 down 时的兜底选择
    pub fn random(&self) -> Option<Arc<Upstream>> {
        self.upstreams.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn healthy_count(&self, max_fails: u32) -> usize {
        self.upstreams.iter().filter(|u| !u.is_down(max_fails)).count()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use hickory_resolver::proto::op::Message;

    use super::*;
    use crate::upstream::policy::PolicyKind;
    use crate::upstream::{DnsClient, Network, Transport};

    struct Never;

    #[async_trait]
    impl DnsClient for Never {
        async fn exchange(&self, _request: &Message, _network: Network) -> Result<Message, ForwardError> {
            Err(ForwardError::transport("never", "unreachable"))
        }
    }

    fn group(kind: PolicyKind) -> UpstreamGroup {
        let upstreams = ["a", "b", "c"]
            .iter()
            .map(|name| {
                Arc::new(Upstream::new(*name, Transport::Plain, Arc::new(Never), HealthCheck::default()))
            })
            .collect();
        UpstreamGroup::new("g", upstreams, SelectionPolicy::new(kind))
    }

    fn names(list: &[Arc<Upstream>]) -> Vec<&str> {
        list.iter().map(|u| u.address()).collect()
    }

    #[test]
    fn ordered_follows_policy() {
        let seq = group(PolicyKind::Sequential);
        assert_eq!(names(&seq.ordered()), vec!["a", "b", "c"]);

        let rr = group(PolicyKind::RoundRobin);
        assert_eq!(names(&rr.ordered()), vec!["a", "b", "c"]);
        assert_eq!(names(&rr.ordered()), vec!["b", "c", "a"]);
        assert_eq!(names(&rr.ordered()), vec!["c", "a", "b"]);
    }

    #[test]
    fn healthy_count_tracks_failures() {
        let g = group(PolicyKind::Sequential);
        assert_eq!(g.healthy_count(1), 3);
        g.upstreams()[0].record_failure();
        assert_eq!(g.healthy_count(1), 2);
        assert_eq!(g.healthy_count(0), 3);
        assert!(g.random().is_some());
    }

    #[test]
    fn from_config_builds_upstreams() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let config = UpstreamGroupConfig {
                name: "U0".into(),
                to: vec!["8.8.8.8".into(), "tcp://1.1.1.1".into()],
                policy: Some("sequential".into()),
            };
            let g = UpstreamGroup::from_config(
                &config,
                "random",
                &TransportOptions::default(),
                &HealthCheck::default(),
            )
            .unwrap();
            assert_eq!(g.len(), 2);
            assert_eq!(g.policy().name(), "sequential");
            assert_eq!(g.upstreams()[1].transport(), Transport::Tcp);
        });
    }

    #[test]
    fn from_config_rejects_bad_address() {
        let config = UpstreamGroupConfig {
            name: "U0".into(),
            to: vec!["not-an-ip".into()],
            policy: None,
        };
        assert!(UpstreamGroup::from_config(
            &config,
            "random",
            &TransportOptions::default(),
            &HealthCheck::default()
        )
        .is_err());
    }
}
