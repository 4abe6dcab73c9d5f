use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::router::rules::Rule;
use crate::upstream::policy::SelectionPolicy;
use crate::upstream::UpstreamAddr;

/// 单个上游组允许的最大地址数
pub const MAX_UPSTREAMS: usize = 15;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default = "default_listen")]
    pub listen: String,
    pub forwards: Vec<ForwardConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.forwards.is_empty() {
            anyhow::bail!("at least one forward is required");
        }
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("invalid listen address '{}'", self.listen);
        }
        for forward in &self.forwards {
            forward
                .validate()
                .map_err(|e| anyhow::anyhow!("forward '{}': {}", forward.name, e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:5353".to_string()
}

/// 一个转发节：范围、上游组、规则与策略参数
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    #[serde(default = "default_forward_name")]
    pub name: String,
    /// 范围后缀或规则集文件路径
    pub from: Vec<String>,
    /// 未命中规则时使用的上游组
    pub default: String,
    pub upstreams: Vec<UpstreamGroupConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub geoip: Option<GeoIpConfig>,
    #[serde(default = "default_policy")]
    pub policy: String,
    #[serde(rename = "max-fails", default = "default_max_fails")]
    pub max_fails: u32,
    /// 空闲连接过期秒数
    #[serde(default = "default_expire")]
    pub expire: u64,
    /// 备份请求延迟（毫秒），0 为关闭
    #[serde(rename = "backup-request", default)]
    pub backup_request: u64,
    #[serde(rename = "max-concurrent", default)]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(rename = "upstream-timeout", default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(rename = "health-check", default)]
    pub health_check: HealthCheckConfig,
    #[serde(rename = "force-tcp", default)]
    pub force_tcp: bool,
    #[serde(rename = "prefer-udp", default)]
    pub prefer_udp: bool,
    #[serde(rename = "tls-servername", default)]
    pub tls_servername: Option<String>,
    #[serde(rename = "reload-interval", default = "default_reload_interval")]
    pub reload_interval: u64,
}

impl ForwardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.from.iter().all(|f| f.trim().is_empty()) {
            anyhow::bail!("'from' must name at least one domain or rule-set file");
        }
        if self.upstreams.is_empty() {
            anyhow::bail!("at least one upstream group is required");
        }
        SelectionPolicy::from_name(&self.policy)?;

        let mut names = HashSet::new();
        for group in &self.upstreams {
            if !names.insert(group.name.as_str()) {
                anyhow::bail!("duplicate upstream group '{}'", group.name);
            }
            group.validate()?;
        }

        // 验证 default / rules / geoip 指向存在的上游组
        if !names.contains(self.default.as_str()) {
            anyhow::bail!(
                "no upstream defined: default '{}' does not match any upstream group",
                self.default
            );
        }
        for rule in &self.rules {
            if !names.contains(rule.upstream.as_str()) {
                anyhow::bail!(
                    "no upstream defined: rule upstream '{}' does not match any upstream group",
                    rule.upstream
                );
            }
            Rule::parse(&rule.pattern, &rule.upstream)?;
        }
        if let Some(geoip) = &self.geoip {
            for rule in &geoip.rules {
                if rule.region.trim().is_empty() {
                    anyhow::bail!("geoip rule region must not be empty");
                }
                if !names.contains(rule.upstream.as_str()) {
                    anyhow::bail!(
                        "no upstream defined: geoip upstream '{}' does not match any upstream group",
                        rule.upstream
                    );
                }
            }
        }
        if self.timeout == 0 {
            anyhow::bail!("timeout must be positive");
        }
        if self.upstream_timeout == 0 {
            anyhow::bail!("upstream-timeout must be positive");
        }
        if self.health_check.interval == 0 {
            anyhow::bail!("health-check interval must be positive");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout)
    }

    pub fn backup_delay(&self) -> Option<Duration> {
        (self.backup_request > 0).then(|| Duration::from_millis(self.backup_request))
    }

    pub fn expire(&self) -> Duration {
        Duration::from_secs(self.expire)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval)
    }
}

fn default_forward_name() -> String {
    "forward".to_string()
}

fn default_policy() -> String {
    "random".to_string()
}

fn default_max_fails() -> u32 {
    2
}

fn default_expire() -> u64 {
    10
}

fn default_timeout() -> u64 {
    5000
}

fn default_upstream_timeout() -> u64 {
    2000
}

fn default_reload_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamGroupConfig {
    pub name: String,
    pub to: Vec<String>,
    /// 覆盖节级别的选择策略
    #[serde(default)]
    pub policy: Option<String>,
}

impl UpstreamGroupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.to.is_empty() {
            anyhow::bail!("upstream group '{}' has no addresses", self.name);
        }
        if self.to.len() > MAX_UPSTREAMS {
            anyhow::bail!(
                "upstream group '{}': more than {} upstreams",
                self.name,
                MAX_UPSTREAMS
            );
        }
        for addr in &self.to {
            UpstreamAddr::parse(addr)?;
        }
        if let Some(policy) = &self.policy {
            SelectionPolicy::from_name(policy)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub pattern: String,
    pub upstream: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoIpConfig {
    pub database: String,
    #[serde(default)]
    pub rules: Vec<GeoRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoRuleConfig {
    pub region: String,
    pub upstream: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    /// 探测间隔（毫秒）
    #[serde(default = "default_hc_interval")]
    pub interval: u64,
    #[serde(default = "default_hc_domain")]
    pub domain: String,
    #[serde(rename = "recursion-desired", default = "default_true")]
    pub recursion_desired: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_hc_interval(),
            domain: default_hc_domain(),
            recursion_desired: true,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }
}

fn default_hc_interval() -> u64 {
    500
}

fn default_hc_domain() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}
