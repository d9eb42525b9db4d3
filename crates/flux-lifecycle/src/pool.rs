use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use flux_core::Outcome;
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::lifecycle::ListenableCloseable;

/// 连接池统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub routable: usize,
    pub evicted: usize,
    pub closed: usize,
    pub failed: usize,
}

struct PoolInner {
    name: String,
    routable: Mutex<HashMap<u64, Arc<dyn ListenableCloseable>>>,
    next_id: AtomicU64,
    evicted: AtomicUsize,
    closed: AtomicUsize,
    failed: AtomicUsize,
}

impl PoolInner {
    fn routable(&self) -> MutexGuard<'_, HashMap<u64, Arc<dyn ListenableCloseable>>> {
        self.routable.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn evict(&self, id: u64) {
        let removed = self.routable().remove(&id).is_some();
        if removed {
            self.evicted.fetch_add(1, Ordering::SeqCst);
            debug!(pool = %self.name, id, "Connection evicted");
        }
    }

    fn record(&self, id: u64, outcome: &Outcome) {
        match outcome {
            Ok(()) => {
                self.closed.fetch_add(1, Ordering::SeqCst);
                debug!(pool = %self.name, id, "Connection closed");
            }
            Err(cause) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                warn!(pool = %self.name, id, error = %cause, "Connection closed with error");
            }
        }
    }
}

/// 连接池
///
/// 连接一开始关闭（closing）就不再可路由，完全关闭（closed）后计入统计。
/// 关闭连接池会拒绝新连接并优雅关闭所有仍可路由的连接。
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    is_shutting_down: AtomicBool,
    max_drain_duration: Duration,
}

impl ConnectionPool {
    pub fn new(name: impl Into<String>, max_drain_duration: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                routable: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                evicted: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
            }),
            is_shutting_down: AtomicBool::new(false),
            max_drain_duration,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 加入连接，返回它在池中的编号；正在关闭时拒绝
    pub fn register(&self, connection: Arc<dyn ListenableCloseable>) -> Option<u64> {
        let id = {
            // 关闭标志在同一把锁下设置，排空快照不会漏掉刚加入的连接
            let mut routable = self.inner.routable();
            if self.is_shutting_down() {
                debug!(pool = %self.inner.name, "Rejecting new connection: shutting down");
                return None;
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
            routable.insert(id, connection.clone());
            id
        };

        // 已经在关闭的连接会在订阅时立即回调，所以必须在锁外订阅
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        connection.on_closing().subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.evict(id);
            }
        });

        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        connection.on_close().subscribe(move |outcome| {
            if let Some(inner) = weak.upgrade() {
                inner.record(id, &outcome);
            }
        });

        debug!(pool = %self.inner.name, id, "Connection registered");
        Some(id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.routable().contains_key(&id)
    }

    /// 当前可路由连接的快照
    pub fn routable(&self) -> Vec<Arc<dyn ListenableCloseable>> {
        self.inner.routable().values().cloned().collect()
    }

    pub fn routable_count(&self) -> usize {
        self.inner.routable().len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            routable: self.routable_count(),
            evicted: self.inner.evicted.load(Ordering::SeqCst),
            closed: self.inner.closed.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// 优雅关闭所有连接，超过排空时限的连接被强制关闭
    ///
    /// 排空时限对整个连接池计算一次，不随连接数增长。返回每个连接的关闭结果。
    pub async fn close_gracefully(&self) -> Vec<Outcome> {
        info!(pool = %self.inner.name, "Starting connection drain");
        let connections: Vec<_> = {
            let routable = self.inner.routable();
            self.is_shutting_down.store(true, Ordering::SeqCst);
            routable.values().cloned().collect()
        };

        let deadline = Instant::now() + self.max_drain_duration;
        let pending: Vec<_> = connections
            .iter()
            .map(|connection| connection.close_async_gracefully())
            .collect();

        let mut outcomes = Vec::with_capacity(pending.len());
        for (connection, closed) in connections.iter().zip(pending) {
            let outcome = match timeout_at(deadline, closed.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        pool = %self.inner.name,
                        timeout = ?self.max_drain_duration,
                        "Drain timeout, forcing close"
                    );
                    connection.close_async().await
                }
            };
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|outcome| outcome.is_err()).count();
        if failed == 0 {
            info!(pool = %self.inner.name, connections = outcomes.len(), "All connections drained");
        } else {
            warn!(pool = %self.inner.name, failed, "Some connections failed to close cleanly");
        }
        outcomes
    }
}
