//! 转发处理器
//!
//! 流程：范围检查 → 并发准入 → 规则路由 → 上游遍历（含备份请求竞速）
//! → 响应校验 → 地理重路由（仅默认路由的查询，最多一次）。

pub mod admission;
pub mod message;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use hickory_resolver::proto::op::Message;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::ForwardError;
use crate::config::ForwardConfig;
use crate::router::provider::SharedScope;
use crate::router::Router;
use crate::upstream::{HealthCheck, Network, TransportOptions, Upstream, UpstreamGroup};
use admission::ConcurrencyLimiter;
use message::{first_answer_addr, validate, Request};

/// A link in the handler chain.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    async fn serve(&self, request: &Request) -> Result<Message, ForwardError>;
}

/// 转发参数，构建后只读
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    pub max_fails: u32,
    /// None 表示关闭备份请求
    pub backup_delay: Option<Duration>,
    /// 整个请求的截止时间
    pub timeout: Duration,
    /// 单次发送超时
    pub upstream_timeout: Duration,
    pub force_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            max_fails: 2,
            backup_delay: None,
            timeout: Duration::from_secs(5),
            upstream_timeout: Duration::from_secs(2),
            force_tcp: false,
            prefer_udp: false,
        }
    }
}

impl ForwardOptions {
    pub fn from_config(config: &ForwardConfig) -> Self {
        Self {
            max_fails: config.max_fails,
            backup_delay: config.backup_delay(),
            timeout: config.timeout(),
            upstream_timeout: config.upstream_timeout(),
            force_tcp: config.force_tcp,
            prefer_udp: config.prefer_udp,
        }
    }

    fn network_for(&self, inbound: Network) -> Network {
        if self.force_tcp {
            Network::Tcp
        } else if self.prefer_udp {
            Network::Udp
        } else {
            inbound
        }
    }
}

/// 路由与上游组的不可变快照，重载时整体替换
pub struct ForwardState {
    pub router: Router,
    pub groups: HashMap<String, Arc<UpstreamGroup>>,
    pub options: ForwardOptions,
}

impl ForwardState {
    pub fn new(router: Router, groups: Vec<UpstreamGroup>, options: ForwardOptions) -> Self {
        let groups = groups
            .into_iter()
            .map(|g| (g.name().to_string(), Arc::new(g)))
            .collect();
        Self {
            router,
            groups,
            options,
        }
    }

    pub fn from_config(config: &ForwardConfig) -> anyhow::Result<Self> {
        let router = Router::from_config(config)?;
        let opts = TransportOptions {
            tls_servername: config.tls_servername.clone(),
            expire: config.expire(),
            timeout: config.upstream_timeout(),
        };
        let health = HealthCheck::from_config(&config.health_check, config.upstream_timeout());
        let groups = config
            .upstreams
            .iter()
            .map(|g| UpstreamGroup::from_config(g, &config.policy, &opts, &health))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(router, groups, ForwardOptions::from_config(config)))
    }

    pub fn group(&self, name: &str) -> Result<&Arc<UpstreamGroup>, ForwardError> {
        self.groups
            .get(name)
            .ok_or_else(|| ForwardError::NoUpstreamConfigured(name.to_string()))
    }
}

struct Branch {
    result: Result<Message, ForwardError>,
    upstream: Arc<Upstream>,
    backup: bool,
}

/// 竞速失败时每个分支各自的错误
type BranchFailures = Vec<(Arc<Upstream>, ForwardError)>;

pub struct Forwarder {
    name: String,
    scope: SharedScope,
    state: ArcSwap<ForwardState>,
    limiter: ConcurrencyLimiter,
    next: Option<Arc<dyn Handler>>,
}

impl Forwarder {
    pub fn new(name: impl Into<String>, scope: SharedScope, state: ForwardState, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            scope,
            state: ArcSwap::from_pointee(state),
            limiter: ConcurrencyLimiter::new(max_concurrent),
            next: None,
        }
    }

    pub fn from_config(config: &ForwardConfig, scope: SharedScope) -> anyhow::Result<Self> {
        let state = ForwardState::from_config(config)?;
        let domains = scope.load().format();
        info!(
            forward = config.name,
            domains = domains.len(),
            groups = state.groups.len(),
            backup = ?state.options.backup_delay,
            max_concurrent = config.max_concurrent,
            "forwarder configured"
        );
        debug!(forward = config.name, domains = ?domains, "forward scope");
        Ok(Self::new(config.name.clone(), scope, state, config.max_concurrent))
    }

    /// 范围外的查询交给下一个处理器
    pub fn with_next(mut self, next: Arc<dyn Handler>) -> Self {
        self.next = Some(next);
        self
    }

    pub fn scope(&self) -> &SharedScope {
        &self.scope
    }

    pub fn state(&self) -> Arc<ForwardState> {
        self.state.load_full()
    }

    /// Publish a new routing snapshot; in-flight queries keep the old one.
    pub fn update(&self, state: ForwardState) {
        self.state.store(Arc::new(state));
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    async fn forward(&self, request: &Request, domain: &str) -> Result<Message, ForwardError> {
        let state = self.state.load_full();
        // 重路由与首次转发共用同一个截止时间
        let deadline = Instant::now() + state.options.timeout;
        let route = state.router.route_request(domain);
        let group = state.group(route.upstream)?;
        let reply = forward_group(&state.options, group, request, deadline).await?;

        if route.matched {
            return Ok(reply);
        }
        let Some(target) = state.router.route_response(&reply, route.upstream) else {
            return Ok(reply);
        };
        if Instant::now() >= deadline {
            debug!(domain = domain, from = route.upstream, to = target, "no time left for geo re-route");
            return Ok(reply);
        }
        debug!(domain = domain, from = route.upstream, to = target, "geo re-route");
        let group = state.group(target)?;
        forward_group(&state.options, group, request, deadline).await
    }
}

#[async_trait]
impl Handler for Forwarder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn serve(&self, request: &Request) -> Result<Message, ForwardError> {
        let domain = request
            .domain()
            .ok_or_else(|| ForwardError::Protocol("query has no question".to_string()))?;

        if !self.scope.load().contains(&domain) {
            return match &self.next {
                Some(next) => next.serve(request).await,
                None => Err(ForwardError::NoNextHandler(domain)),
            };
        }

        let _guard = self.limiter.acquire().inspect_err(|e| {
            warn!(forward = self.name, domain = domain, error = %e, "query rejected");
        })?;

        self.forward(request, &domain).await
    }
}

/// Walk the group's candidates until one answers or `deadline` passes.
pub async fn forward_group(
    options: &ForwardOptions,
    group: &UpstreamGroup,
    request: &Request,
    deadline: Instant,
) -> Result<Message, ForwardError> {
    let candidates = group.ordered();
    let len = candidates.len();
    if len == 0 {
        return Err(ForwardError::NoHealthyUpstream);
    }

    let mut network = options.network_for(request.network);
    let mut index = 0;
    let mut fails = 0;
    let mut last_err = None;

    while Instant::now() < deadline {
        if index >= len {
            // 到达列表末尾，从头开始
            index = 0;
            fails = 0;
        }

        let mut selected = &candidates[index..];
        let fallback;
        index += 1;
        if selected[0].is_down(options.max_fails) {
            fails += 1;
            if fails < len {
                continue;
            }
            // 所有上游都 down，认为健康检查失效，随机挑一个
            let Some(random) = group.random() else {
                break;
            };
            warn!(group = group.name(), upstream = random.address(), "all upstreams down, healthcheck assumed broken");
            fallback = [random];
            selected = &fallback[..];
        }
        let upstream = &selected[0];

        let result = loop {
            match race(options, selected, request, network, deadline).await {
                Ok((reply, _)) if reply.truncated() && !options.force_tcp && options.prefer_udp && network == Network::Udp => {
                    debug!(upstream = upstream.address(), "truncated reply, retrying over tcp");
                    network = Network::Tcp;
                    continue;
                }
                Ok(ok) => break Ok(ok),
                Err(failures) => {
                    let mut closed = false;
                    for (failed, e) in &failures {
                        if matches!(e, ForwardError::CachedConnectionClosed) {
                            closed = true;
                            continue;
                        }
                        warn!(group = group.name(), upstream = failed.address(), error = %e, "upstream failed");
                        if e.counts_against_upstream() {
                            failed.record_failure();
                        }
                        if options.max_fails != 0 {
                            failed.probe();
                        }
                    }
                    // 缓存连接被对端关闭，不占用失败名额，原样重试
                    if closed && Instant::now() < deadline {
                        continue;
                    }
                    break Err(merge_failures(failures));
                }
            }
        };

        let (reply, winner) = match result {
            Ok(ok) => ok,
            Err(e) => {
                last_err = Some(e);
                if fails < len {
                    continue;
                }
                break;
            }
        };

        validate(request, &reply).inspect_err(|e| {
            warn!(upstream = winner.address(), error = %e, "wrong reply");
        })?;
        winner.reset();
        debug!(
            upstream = winner.address(),
            answer = ?first_answer_addr(&reply),
            "upstream answered"
        );
        return Ok(reply);
    }

    Err(last_err.unwrap_or(ForwardError::NoHealthyUpstream))
}

/// Send to `candidates[0]`, racing a delayed backup to `candidates[1]` when enabled.
async fn race(
    options: &ForwardOptions,
    candidates: &[Arc<Upstream>],
    request: &Request,
    network: Network,
    deadline: Instant,
) -> Result<(Message, Arc<Upstream>), BranchFailures> {
    let primary = Arc::clone(&candidates[0]);
    let delay = match options.backup_delay {
        Some(delay) if candidates.len() > 1 => delay,
        _ => {
            let send_deadline = deadline.min(Instant::now() + options.upstream_timeout);
            return match send(&primary, &request.message, network, send_deadline).await {
                Ok(reply) => Ok((reply, primary)),
                Err(e) => Err(vec![(primary, e)]),
            };
        }
    };
    let backup = Arc::clone(&candidates[1]);

    // 两个分支共享同一截止时间
    let send_deadline = deadline.min(Instant::now() + delay + options.upstream_timeout);
    let (tx, mut rx) = mpsc::channel::<Branch>(2);
    let cancel = CancellationToken::new();

    {
        let tx = tx.clone();
        let cancel = cancel.clone();
        let message = request.message.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = send(&primary, &message, network, send_deadline) => result,
            };
            let _ = tx
                .send(Branch {
                    result,
                    upstream: primary,
                    backup: false,
                })
                .await;
        });
    }
    {
        let cancel = cancel.clone();
        let message = request.message.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = send(&backup, &message, network, send_deadline) => result,
            };
            let _ = tx
                .send(Branch {
                    result,
                    upstream: backup,
                    backup: true,
                })
                .await;
        });
    }

    let mut failures = Vec::with_capacity(2);
    while let Some(branch) = rx.recv().await {
        match branch.result {
            Ok(reply) => {
                cancel.cancel();
                debug!(upstream = branch.upstream.address(), backup = branch.backup, "race won");
                return Ok((reply, branch.upstream));
            }
            Err(e) => {
                debug!(upstream = branch.upstream.address(), backup = branch.backup, error = %e, "race branch failed");
                failures.push((branch.upstream, e));
                if failures.len() == 2 {
                    break;
                }
            }
        }
    }
    cancel.cancel();
    Err(failures)
}

/// 单个分支失败时原样返回其错误，两个分支都失败时报告 `AllUpstreamsFailed`
fn merge_failures(mut failures: BranchFailures) -> ForwardError {
    if failures.len() > 1 {
        return ForwardError::AllUpstreamsFailed;
    }
    failures.pop().map_or(ForwardError::NoHealthyUpstream, |(_, e)| e)
}

async fn send(
    upstream: &Upstream,
    message: &Message,
    network: Network,
    deadline: Instant,
) -> Result<Message, ForwardError> {
    match tokio::time::timeout_at(deadline, upstream.exchange(message, network)).await {
        Ok(result) => result,
        Err(_) => Err(ForwardError::Timeout(upstream.address().to_string())),
    }
}
