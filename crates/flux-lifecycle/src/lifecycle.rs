use std::sync::Arc;

use flux_core::{blocking_invocation, BlockingError, Cause, Completion, CompletionSignal, Outcome};
use flux_executor::{ExecutionStrategy, OffloadPoint};
use tracing::{debug, warn};

use crate::state::{AtomicLifecycleState, LifecycleState};

/// 底层传输（连接、通道）
///
/// 核心不假设 `close` 是幂等的，由状态机保证它最多被调用一次。
pub trait Transport: Send + Sync + 'static {
    /// 尽力立即关闭
    fn close(&self) -> Result<(), Cause>;

    /// 开始优雅关闭：允许进行中的工作完成，最终应触发关闭
    fn close_gracefully(&self) -> Result<(), Cause> {
        self.close()
    }

    /// 把传输原生的「已关闭」事件桥接到 `notifier`
    fn on_closed(&self, notifier: ClosedNotifier);
}

/// 传输用来报告自身已关闭的句柄
#[derive(Clone)]
pub struct ClosedNotifier {
    closed: CompletionSignal,
}

impl ClosedNotifier {
    pub fn closed(&self) -> bool {
        self.closed.complete(())
    }

    pub fn failed(&self, cause: impl Into<Cause>) -> bool {
        self.closed.fail(cause)
    }

    pub fn terminate(&self, outcome: Outcome) -> bool {
        self.closed.terminate(outcome)
    }
}

/// 可监听关闭过程的资源
pub trait ListenableCloseable: Send + Sync {
    /// 立即关闭；重复调用复用已有的结果
    fn close_async(&self) -> Completion;

    /// 优雅关闭；重复调用复用已有的结果
    fn close_async_gracefully(&self) -> Completion;

    /// 开始关闭时完成，不晚于 `on_close`
    fn on_closing(&self) -> Completion;

    /// 传输确认关闭后完成
    fn on_close(&self) -> Completion;

    /// 阻塞直到关闭完成
    fn close_blocking(&self) -> Result<(), BlockingError> {
        blocking_invocation(&self.close_async())
    }

    fn close_gracefully_blocking(&self) -> Result<(), BlockingError> {
        blocking_invocation(&self.close_async_gracefully())
    }
}

impl<C: ListenableCloseable + ?Sized> ListenableCloseable for Arc<C> {
    fn close_async(&self) -> Completion {
        (**self).close_async()
    }

    fn close_async_gracefully(&self) -> Completion {
        (**self).close_async_gracefully()
    }

    fn on_closing(&self) -> Completion {
        (**self).on_closing()
    }

    fn on_close(&self) -> Completion {
        (**self).on_close()
    }
}

/// 资源生命周期状态机
///
/// 资源持有一个 `Lifecycle` 并把关闭操作委托给它。无论多少线程并发调用
/// `close_async`/`close_async_gracefully`，closing 信号只触发一次，每种拆除
/// 动作最多执行一次，closed 信号只完成一次，所有调用者看到同一个结果。
///
/// 拆除动作同步失败时，失败成为 closed 的终态结果，不重试。
/// 优雅关闭钩子失败时资源进入 CLOSING 并强制关闭传输。
pub struct Lifecycle<T: Transport> {
    transport: T,
    state: AtomicLifecycleState,
    on_closing: CompletionSignal,
    on_close: CompletionSignal,
    on_close_offloaded: Completion,
}

impl<T: Transport> Lifecycle<T> {
    /// closed 信号按 `strategy` 的 `Close` 投递点转移
    pub fn new(transport: T, strategy: &ExecutionStrategy) -> Self {
        let on_closing = CompletionSignal::new();
        let on_close = CompletionSignal::new();

        // 非主动关闭（对端断开等）也要通知 closing 的观察者
        let closing = on_closing.clone();
        on_close.subscribe(move |outcome| {
            closing.terminate(outcome);
        });

        transport.on_closed(ClosedNotifier {
            closed: on_close.clone(),
        });

        Self {
            on_close_offloaded: strategy.publish_on(OffloadPoint::Close, &on_close),
            transport,
            state: AtomicLifecycleState::new(),
            on_closing,
            on_close,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> LifecycleState {
        self.state.load()
    }

    pub fn is_closed(&self) -> bool {
        self.on_close.is_done()
    }

    pub fn close_async(&self) -> Completion {
        self.close();
        self.on_close_offloaded.clone()
    }

    pub fn close_async_gracefully(&self) -> Completion {
        self.close_gracefully();
        self.on_close_offloaded.clone()
    }

    /// 与 `close_async` 相同，但结果在完成线程上直接投递
    pub fn close_async_no_offload(&self) -> Completion {
        self.close();
        self.on_close.inline()
    }

    pub fn close_async_gracefully_no_offload(&self) -> Completion {
        self.close_gracefully();
        self.on_close.inline()
    }

    /// closing 信号仅供内部协作者（负载均衡、连接池）使用，不转移
    pub fn on_closing(&self) -> Completion {
        self.on_closing.inline()
    }

    pub fn on_close(&self) -> Completion {
        self.on_close_offloaded.clone()
    }

    pub fn on_close_no_offload(&self) -> Completion {
        self.on_close.inline()
    }

    fn close(&self) {
        let previous = self.state.enter_closing();
        if previous == LifecycleState::Closing {
            debug!("Close already in progress");
            return;
        }

        debug!(from = %previous, "Closing resource");
        self.on_closing.complete(());
        if let Err(cause) = self.transport.close() {
            warn!(error = %cause, "Transport close failed");
            self.on_close.fail(cause);
        }
    }

    fn close_gracefully(&self) {
        if !self.state.begin_graceful() {
            debug!(state = %self.state(), "Graceful close skipped");
            return;
        }

        debug!("Gracefully closing resource");
        self.on_closing.complete(());
        if let Err(cause) = self.transport.close_gracefully() {
            warn!(error = %cause, "Graceful close failed, forcing close");
            // 先记录钩子的失败，避免强制关闭的成功结果覆盖它
            self.on_close.fail(cause);
            if self.state.escalate() {
                if let Err(cause) = self.transport.close() {
                    warn!(error = %cause, "Forced close after failed graceful close failed");
                }
            }
        }
    }
}

impl<T: Transport> ListenableCloseable for Lifecycle<T> {
    fn close_async(&self) -> Completion {
        Lifecycle::close_async(self)
    }

    fn close_async_gracefully(&self) -> Completion {
        Lifecycle::close_async_gracefully(self)
    }

    fn on_closing(&self) -> Completion {
        Lifecycle::on_closing(self)
    }

    fn on_close(&self) -> Completion {
        Lifecycle::on_close(self)
    }
}
