use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use thiserror::Error;
use tracing::debug;

use crate::completion::{Outcome, Subscribable};
use crate::error::Cause;

/// 阻塞调用错误
#[derive(Debug, Clone, Error)]
pub enum BlockingError {
    /// 被等待的操作本身失败，原因原样透传
    #[error(transparent)]
    Failed(Cause),

    /// 等待被外部中断，与操作自身的失败无关
    #[error("Blocking wait was interrupted")]
    Interrupted,
}

impl BlockingError {
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            BlockingError::Failed(cause) => Some(cause),
            BlockingError::Interrupted => None,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, BlockingError::Interrupted)
    }
}

/// 阻塞等待 `source` 的终态结果
///
/// 没有隐含超时：若 `source` 永不完成，调用线程会一直等待。
/// 不要在驱动 `source` 完成的同一线程上调用。
pub fn blocking_invocation<T, S>(source: &S) -> Result<T, BlockingError>
where
    T: Send + 'static,
    S: Subscribable<T> + ?Sized,
{
    BlockingInvocation::new(source).wait()
}

trait Unpark: Send + Sync {
    fn interrupt(&self);
}

struct Parker<T> {
    state: Mutex<ParkState<T>>,
    ready: Condvar,
}

struct ParkState<T> {
    outcome: Option<Outcome<T>>,
    interrupted: bool,
}

impl<T> Parker<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(ParkState {
                outcome: None,
                interrupted: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ParkState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unpark(&self, outcome: Outcome<T>) {
        self.lock().outcome = Some(outcome);
        self.ready.notify_all();
    }
}

impl<T: Send> Unpark for Parker<T> {
    fn interrupt(&self) {
        self.lock().interrupted = true;
        self.ready.notify_all();
    }
}

/// 阻塞调用
///
/// 每次阻塞调用创建一个，返回或出错后即丢弃。
pub struct BlockingInvocation<'a, T, S: ?Sized> {
    source: &'a S,
    interrupt: Option<&'a Interrupt>,
    _outcome: std::marker::PhantomData<fn() -> T>,
}

impl<'a, T, S> BlockingInvocation<'a, T, S>
where
    T: Send + 'static,
    S: Subscribable<T> + ?Sized,
{
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            interrupt: None,
            _outcome: std::marker::PhantomData,
        }
    }

    /// 允许通过 `interrupt` 打断等待
    pub fn interruptible(mut self, interrupt: &'a Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn wait(self) -> Result<T, BlockingError> {
        let parker = Arc::new(Parker::new());

        if let Some(interrupt) = self.interrupt {
            if !interrupt.register(parker.clone()) {
                debug!("Blocking invocation interrupted before waiting");
                return Err(BlockingError::Interrupted);
            }
        }

        let unparker = parker.clone();
        let subscription = self
            .source
            .subscribe_boxed(Box::new(move |outcome| unparker.unpark(outcome)));

        let result = {
            let mut state = parker.lock();
            loop {
                if let Some(outcome) = state.outcome.take() {
                    break outcome.map_err(BlockingError::Failed);
                }
                if state.interrupted {
                    break Err(BlockingError::Interrupted);
                }
                state = parker
                    .ready
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };

        let interrupted = matches!(result, Err(BlockingError::Interrupted));
        if let Some(interrupt) = self.interrupt {
            interrupt.unregister(interrupted);
        }
        if interrupted {
            subscription.cancel();
            debug!("Blocking invocation interrupted, subscription cancelled");
        }
        result
    }
}

/// 阻塞等待的中断句柄
///
/// 与线程中断标志类似：`interrupt()` 唤醒当前登记的等待者；没有等待者时
/// 标志会保留，下一次等待立即以 `Interrupted` 返回并清除标志。
/// 同一时刻只应有一个线程使用同一个句柄等待。
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<Mutex<InterruptState>>,
}

#[derive(Default)]
struct InterruptState {
    pending: bool,
    waiter: Option<Arc<dyn Unpark>>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        let waiter = {
            let mut state = self.lock();
            match state.waiter.take() {
                Some(waiter) => Some(waiter),
                None => {
                    state.pending = true;
                    None
                }
            }
        };
        if let Some(waiter) = waiter {
            waiter.interrupt();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending
    }

    fn register(&self, waiter: Arc<dyn Unpark>) -> bool {
        let mut state = self.lock();
        if state.pending {
            state.pending = false;
            return false;
        }
        state.waiter = Some(waiter);
        true
    }

    /// 结束等待；中断已取走等待者但结果先到时，把中断留给下一次等待
    fn unregister(&self, interrupted: bool) {
        let mut state = self.lock();
        if state.waiter.take().is_none() && !interrupted {
            state.pending = true;
        }
    }

    fn lock(&self) -> MutexGuard<'_, InterruptState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
