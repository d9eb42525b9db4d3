use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flux_core::{Cause, CompletionSignal, Offload, Task};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Executor `{0}` is shut down")]
    Rejected(String),

    #[error("Failed to start executor `{name}`: {source}")]
    Start {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid executor config: {0}")]
    InvalidConfig(String),
}

/// 转移执行器配置
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// 执行器名称，同时作为线程名前缀
    pub name: String,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl ExecutorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker_threads: default_worker_threads(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.name.is_empty() {
            return Err(ExecutorError::InvalidConfig(
                "executor name must not be empty".to_string(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(ExecutorError::InvalidConfig(format!(
                "executor `{}` needs at least one worker thread",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new("flux-offload")
    }
}

/// 转移执行器
///
/// 用于把回调从 I/O 线程转移出去的线程池。显式创建、显式关闭；
/// 关闭后提交的任务会被拒绝，排队中尚未运行的任务会被丢弃。
pub struct OffloadExecutor {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
    submitted: AtomicU64,
    shutdown_grace: Duration,
    on_close: CompletionSignal,
}

impl OffloadExecutor {
    pub fn builder(name: impl Into<String>) -> OffloadExecutorBuilder {
        OffloadExecutorBuilder::new(name)
    }

    pub fn new(config: ExecutorConfig) -> Result<Arc<Self>, ExecutorError> {
        config.validate()?;

        let counter = Arc::new(AtomicUsize::new(0));
        let prefix = config.name.clone();
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.worker_threads)
            .thread_name_fn(move || {
                format!("{}-{}", prefix, counter.fetch_add(1, Ordering::SeqCst))
            })
            .enable_all()
            .build()
            .map_err(|source| ExecutorError::Start {
                name: config.name.clone(),
                source,
            })?;

        info!(
            executor = %config.name,
            workers = config.worker_threads,
            "Offload executor started"
        );

        Ok(Arc::new(Self {
            name: config.name,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            closed: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            on_close: CompletionSignal::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 提交任务
    pub fn execute<F>(&self, task: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            debug!(executor = %self.name, "Rejecting task: executor is shut down");
            return Err(ExecutorError::Rejected(self.name.clone()));
        }

        self.submitted.fetch_add(1, Ordering::Relaxed);
        // 与关闭竞争时任务会随运行时一起被丢弃
        drop(self.handle.spawn_blocking(task));
        Ok(())
    }

    /// 当前线程是否属于本执行器
    ///
    /// 线程名必须是 `{name}-{序号}`，名为 `io` 的执行器不会认领 `io-blocking-0`。
    pub fn owns_current_thread(&self) -> bool {
        std::thread::current()
            .name()
            .and_then(|thread| thread.strip_prefix(self.name.as_str()))
            .and_then(|rest| rest.strip_prefix('-'))
            .map(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 关闭执行器；可重复调用，只有第一次真正关闭
    pub fn close(&self) -> CompletionSignal {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let runtime = self
                .runtime
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();

            if let Some(runtime) = runtime {
                info!(executor = %self.name, "Shutting down offload executor");
                if Handle::try_current().is_ok() {
                    // 异步上下文中不能阻塞等待
                    runtime.shutdown_background();
                } else {
                    runtime.shutdown_timeout(self.shutdown_grace);
                }
            }

            self.on_close.complete(());
            info!(executor = %self.name, submitted = self.submitted(), "Offload executor shut down");
        }
        self.on_close.clone()
    }

    pub fn on_close(&self) -> CompletionSignal {
        self.on_close.clone()
    }
}

impl Offload for OffloadExecutor {
    fn execute(&self, task: Task) -> Result<(), Cause> {
        OffloadExecutor::execute(self, task).map_err(Cause::new)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for OffloadExecutor {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            warn!(executor = %self.name, "Offload executor dropped without close()");
            self.close();
        }
    }
}

/// 转移执行器构建器
pub struct OffloadExecutorBuilder {
    config: ExecutorConfig,
}

impl OffloadExecutorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: ExecutorConfig::new(name),
        }
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn build(self) -> Result<Arc<OffloadExecutor>, ExecutorError> {
        OffloadExecutor::new(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::FluxError;
    use std::sync::mpsc;

    #[test]
    fn test_runs_task_on_named_thread() {
        let executor = OffloadExecutor::builder("test-pool")
            .with_worker_threads(2)
            .build()
            .unwrap();
        let (tx, rx) = mpsc::channel();

        let owner = executor.clone();
        executor
            .execute(move || {
                tx.send(owner.owns_current_thread()).unwrap();
            })
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!executor.owns_current_thread());
        assert_eq!(executor.submitted(), 1);

        executor.close();
    }

    #[test]
    fn test_rejects_after_close() {
        let executor = OffloadExecutor::builder("test-closed")
            .with_worker_threads(1)
            .build()
            .unwrap();

        let on_close = executor.close();
        assert!(on_close.is_done());
        assert!(executor.is_shutdown());

        let err = executor.execute(|| {}).unwrap_err();
        assert!(matches!(err, ExecutorError::Rejected(name) if name == "test-closed"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let executor = OffloadExecutor::builder("test-idempotent")
            .with_worker_threads(1)
            .build()
            .unwrap();

        let first = executor.close();
        let second = executor.close();
        assert!(first.is_done());
        assert!(second.is_done());
    }

    #[test]
    fn test_zero_workers_is_invalid() {
        let result = OffloadExecutor::builder("test-empty")
            .with_worker_threads(0)
            .build();
        assert!(matches!(result, Err(ExecutorError::InvalidConfig(_))));
    }

    #[test]
    fn test_offloaded_signal_after_close_delivers_rejection() {
        let executor = OffloadExecutor::builder("test-reject-signal")
            .with_worker_threads(1)
            .build()
            .unwrap();
        executor.close();

        let signal = CompletionSignal::<()>::new();
        let view = signal.publish_on(executor.clone());
        let (tx, rx) = mpsc::channel();
        view.subscribe(move |outcome| {
            tx.send(outcome).unwrap();
        });
        signal.complete(());

        let cause = rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            cause.downcast_ref::<FluxError>(),
            Some(FluxError::OffloadRejected(name)) if name == "test-reject-signal"
        ));
    }

    #[tokio::test]
    async fn test_close_inside_async_context() {
        let executor = OffloadExecutor::builder("test-async-close")
            .with_worker_threads(1)
            .build()
            .unwrap();

        executor.close().await.unwrap();
        assert!(executor.is_shutdown());
    }

    #[test]
    fn test_prefix_named_executor_does_not_claim_threads() {
        let io = OffloadExecutor::builder("test-io")
            .with_worker_threads(1)
            .build()
            .unwrap();
        let io_blocking = OffloadExecutor::builder("test-io-blocking")
            .with_worker_threads(1)
            .build()
            .unwrap();
        let (tx, rx) = mpsc::channel();

        let (outer, inner) = (io.clone(), io_blocking.clone());
        io_blocking
            .execute(move || {
                tx.send((outer.owns_current_thread(), inner.owns_current_thread()))
                    .unwrap();
            })
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (false, true));

        io.close();
        io_blocking.close();
    }

    #[test]
    fn test_shutdown_grace_saturates() {
        let builder = OffloadExecutor::builder("test-grace").with_shutdown_grace(Duration::MAX);
        assert_eq!(builder.config.shutdown_grace_ms, u64::MAX);

        let builder =
            OffloadExecutor::builder("test-grace").with_shutdown_grace(Duration::from_secs(2));
        assert_eq!(builder.config.shutdown_grace_ms, 2_000);
    }

    #[test]
    fn test_config_defaults() {
        let config: ExecutorConfig = toml::from_str(r#"name = "io-offload""#).unwrap();
        assert_eq!(config.name, "io-offload");
        assert!(config.worker_threads > 0);
        assert_eq!(config.shutdown_grace_ms, 5_000);
    }
}
