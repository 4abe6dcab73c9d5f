use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;

use crate::common::ForwardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Random,
    RoundRobin,
    Sequential,
}

/// 上游选择策略：每次请求给出候选的尝试顺序
#[derive(Debug)]
pub struct SelectionPolicy {
    kind: PolicyKind,
    cursor: AtomicUsize,
}

impl SelectionPolicy {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn from_name(name: &str) -> Result<Self, ForwardError> {
        let kind = match name {
            "random" => PolicyKind::Random,
            "round_robin" => PolicyKind::RoundRobin,
            "sequential" => PolicyKind::Sequential,
            other => {
                return Err(ForwardError::Config(format!("unknown policy '{}'", other)));
            }
        };
        Ok(Self::new(kind))
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            PolicyKind::Random => "random",
            PolicyKind::RoundRobin => "round_robin",
            PolicyKind::Sequential => "sequential",
        }
    }

    /// Order in which the pool is tried for one request.
    pub fn order<T: Clone>(&self, pool: &[T]) -> Vec<T> {
        match self.kind {
            PolicyKind::Random => {
                let mut out = pool.to_vec();
                out.shuffle(&mut rand::thread_rng());
                out
            }
            PolicyKind::RoundRobin => {
                if pool.is_empty() {
                    return Vec::new();
                }
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
                pool[start..].iter().chain(&pool[..start]).cloned().collect()
            }
            PolicyKind::Sequential => pool.to_vec(),
        }
    }
}
