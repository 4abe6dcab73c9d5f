use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::common::ForwardError;

/// 在途查询计数器；`max == 0` 表示不限制
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    max: usize,
    active: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Count the query in; the returned guard counts it out on drop.
    ///
    /// The count is incremented before the check, so a rejected query still
    /// holds its slot until the guard created here is dropped.
    pub fn acquire(&self) -> Result<AdmissionGuard, ForwardError> {
        let count = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        let guard = AdmissionGuard {
            active: self.active.clone(),
        };
        if self.max > 0 && count > self.max {
            return Err(ForwardError::LimitExceeded(self.max));
        }
        Ok(guard)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

pub struct AdmissionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_acquire_release() {
        let limiter = ConcurrencyLimiter::new(2);
        let g1 = limiter.acquire().unwrap();
        let g2 = limiter.acquire().unwrap();
        assert_eq!(limiter.active_count(), 2);

        let err = limiter.acquire().err().unwrap();
        assert!(matches!(err, ForwardError::LimitExceeded(2)));
        // 被拒绝的请求不占位
        assert_eq!(limiter.active_count(), 2);

        drop(g1);
        assert_eq!(limiter.active_count(), 1);
        let _g3 = limiter.acquire().unwrap();
        drop(g2);
        assert_eq!(limiter.active_count(), 1);
    }

    #[test]
    fn zero_is_unlimited() {
        let limiter = ConcurrencyLimiter::new(0);
        let guards: Vec<_> = (0..100).map(|_| limiter.acquire().unwrap()).collect();
        assert_eq!(limiter.active_count(), 100);
        drop(guards);
        assert_eq!(limiter.active_count(), 0);
    }

    #[test]
    fn clones_share_the_counter() {
        let limiter = ConcurrencyLimiter::new(1);
        let other = limiter.clone();
        let _g = limiter.acquire().unwrap();
        assert!(other.acquire().is_err());
    }
}
