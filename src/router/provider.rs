//! 转发范围（scope）来源
//!
//! `from` 列表中的每一项要么是域名后缀，要么是规则集文件路径。
//! 规则集文件每行一个后缀，`#` 开头为注释，`include: <path>` 引入相对路径的其他文件。
//! 基于文件的范围会周期性重新读取，构建新的 trie 后原子替换。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::trie::DomainTrie;

/// 并发读者共享的范围 trie，重载时整体替换
pub type SharedScope = Arc<ArcSwap<DomainTrie>>;

const MAX_INCLUDE_DEPTH: usize = 8;

/// Lowercase a suffix and make it fully qualified.
pub fn normalize_name(name: &str) -> String {
    let trimmed = name.trim().to_lowercase();
    if trimmed.ends_with('.') {
        trimmed
    } else {
        format!("{}.", trimmed)
    }
}

/// Read a rule-set file, following `include:` lines.
pub fn read_ruleset(path: &Path) -> Result<Vec<String>> {
    read_ruleset_at_depth(path, 0)
}

fn read_ruleset_at_depth(path: &Path, depth: usize) -> Result<Vec<String>> {
    if depth > MAX_INCLUDE_DEPTH {
        anyhow::bail!("include depth exceeded at {}", path.display());
    }
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("invalid path={} err={}", path.display(), e))?;
    let dirname = path.parent().unwrap_or_else(|| Path::new("."));

    let mut zones = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(included) = line.strip_prefix("include:") {
            let sub_path = dirname.join(included.trim());
            let sub = read_ruleset_at_depth(&sub_path, depth + 1).map_err(|e| {
                anyhow::anyhow!("unable to read include file '{}': {}", line, e)
            })?;
            zones.extend(sub);
        } else {
            zones.push(normalize_name(line));
        }
    }
    Ok(zones)
}

/// Scope entries from a `from` list: literal suffixes plus rule-set files.
#[derive(Debug, Clone)]
pub struct ScopeSource {
    entries: Vec<String>,
}

impl ScopeSource {
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }

    /// Entries that name an existing file.
    pub fn files(&self) -> Vec<PathBuf> {
        self.entries
            .iter()
            .map(PathBuf::from)
            .filter(|p| p.is_file())
            .collect()
    }

    pub fn is_file_backed(&self) -> bool {
        !self.files().is_empty()
    }

    /// Build a fresh trie from all entries.
    pub fn build(&self) -> Result<DomainTrie> {
        let mut trie = DomainTrie::new();
        let mut inserted = 0usize;
        for entry in &self.entries {
            let path = Path::new(entry);
            if path.is_file() {
                let zones = read_ruleset(path)?;
                if zones.is_empty() {
                    anyhow::bail!("unable to normalize '{}': rule set is empty", entry);
                }
                for zone in &zones {
                    trie.insert(zone);
                }
                inserted += zones.len();
            } else {
                let name = entry.trim();
                if name.is_empty() {
                    continue;
                }
                trie.insert(&normalize_name(name));
                inserted += 1;
            }
        }
        if inserted == 0 {
            anyhow::bail!("scope is empty");
        }
        Ok(trie)
    }
}

/// Rebuild the scope and publish it; the previous trie stays on failure.
pub fn reload_scope(scope: &SharedScope, source: &ScopeSource) -> Result<usize> {
    let trie = source.build()?;
    let count = trie.len();
    debug!(domains = ?trie.format(), "scope rebuilt");
    scope.store(Arc::new(trie));
    Ok(count)
}

/// Periodically reload file-backed scopes. Returns None when nothing is file-backed.
pub fn spawn_scope_reload(
    name: String,
    scope: SharedScope,
    source: ScopeSource,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if !source.is_file_backed() || interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // 跳过首次立即触发
        loop {
            ticker.tick().await;
            match reload_scope(&scope, &source) {
                Ok(count) => info!(forward = name, domains = count, "scope reloaded"),
                Err(e) => error!(forward = name, error = %e, "update domains failed"),
            }
        }
    }))
}
