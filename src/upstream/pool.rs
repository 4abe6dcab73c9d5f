//! 上游空闲连接缓存
//!
//! TCP/TLS 查询完成后连接归还到池中，在 `expire` 时间内可被下一次查询复用。
//! 复用的连接可能已被对端关闭，调用方据此区分 `CachedConnectionClosed`。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// 每个上游保留的最大空闲连接数
const MAX_IDLE: usize = 8;

struct IdleConn<S> {
    stream: S,
    last_used: Instant,
}

pub struct ConnPool<S> {
    expire: Duration,
    idle: Mutex<VecDeque<IdleConn<S>>>,
    /// 清理任务在第一次归还连接时启动，构造时不依赖运行时
    cleanup_started: AtomicBool,
}

impl<S: Send + 'static> ConnPool<S> {
    pub fn new(expire: Duration) -> Self {
        Self {
            expire,
            idle: Mutex::new(VecDeque::new()),
            cleanup_started: AtomicBool::new(false),
        }
    }

    /// 取出最近使用且未过期的连接
    pub async fn get(&self) -> Option<S> {
        let mut idle = self.idle.lock().await;
        let now = Instant::now();
        // LIFO：最近归还的连接更可能存活
        while let Some(entry) = idle.pop_back() {
            if now.duration_since(entry.last_used) > self.expire {
                continue;
            }
            return Some(entry.stream);
        }
        None
    }

    /// 归还连接；`expire` 为 0 时不缓存
    pub async fn put(self: &Arc<Self>, stream: S) {
        if self.expire.is_zero() {
            return;
        }
        if !self.cleanup_started.swap(true, Ordering::AcqRel) {
            self.spawn_cleanup();
        }
        let mut idle = self.idle.lock().await;
        if idle.len() >= MAX_IDLE {
            idle.pop_front();
        }
        idle.push_back(IdleConn {
            stream,
            last_used: Instant::now(),
        });
    }

    /// 清理过期连接
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let expire = self.expire;
        self.idle
            .lock()
            .await
            .retain(|entry| now.duration_since(entry.last_used) <= expire);
    }

    pub async fn len(&self) -> usize {
        self.idle.lock().await.len()
    }

    pub fn cleanup_started(&self) -> bool {
        self.cleanup_started.load(Ordering::Acquire)
    }

    /// 启动定时清理任务，池被释放后退出
    fn spawn_cleanup(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.expire;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(pool) => pool.cleanup().await,
                    None => break,
                }
            }
        });
    }
}
