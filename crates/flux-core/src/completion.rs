use std::any::Any;
use std::collections::BTreeMap;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::{error, trace, warn};

use crate::error::{Cause, FluxError};

/// 终态结果
pub type Outcome<T = ()> = std::result::Result<T, Cause>;

/// 一次性观察者回调
pub type Observer<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

/// 被转移到其他线程执行的任务
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 信号投递的转移目标（通常是线程池）
pub trait Offload: Send + Sync {
    /// 提交任务；被拒绝或被丢弃的任务不会执行
    fn execute(&self, task: Task) -> Result<(), Cause>;

    fn name(&self) -> &str;
}

/// 可订阅终态结果的来源
pub trait Subscribable<T>: Send + Sync {
    fn subscribe_boxed(&self, observer: Observer<T>) -> Subscription;
}

enum State<T> {
    Pending {
        observers: BTreeMap<u64, Observer<T>>,
        next_id: u64,
    },
    Terminal(Outcome<T>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // 回调从不在持锁期间运行，中毒时状态仍然一致
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
}

impl<T: Send> Detach for Shared<T> {
    fn detach(&self, id: u64) -> bool {
        match &mut *self.lock() {
            State::Pending { observers, .. } => observers.remove(&id).is_some(),
            State::Terminal(_) => false,
        }
    }
}

/// 一次性、可重放的多播完成信号
///
/// 第一次 `complete`/`fail` 决定结果，之后的调用都是空操作。
/// 完成前注册的观察者在完成时收到结果；完成后注册的观察者立即收到
/// 缓存的结果。每个观察者恰好收到一次投递。
pub struct CompletionSignal<T = ()> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CompletionSignal<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> CompletionSignal<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending {
                    observers: BTreeMap::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    /// 以成功结束；返回是否由本次调用完成
    pub fn complete(&self, value: T) -> bool {
        self.terminate(Ok(value))
    }

    /// 以失败结束；返回是否由本次调用完成
    pub fn fail(&self, cause: impl Into<Cause>) -> bool {
        self.terminate(Err(cause.into()))
    }

    pub fn terminate(&self, outcome: Outcome<T>) -> bool {
        let observers = {
            let mut state = self.shared.lock();
            let observers = match &mut *state {
                State::Terminal(_) => return false,
                State::Pending { observers, .. } => std::mem::take(observers),
            };
            *state = State::Terminal(outcome.clone());
            observers
        };

        trace!(
            observers = observers.len(),
            success = outcome.is_ok(),
            "Completion signal terminated"
        );

        for observer in observers.into_values() {
            deliver(observer, outcome.clone());
        }
        true
    }

    /// 注册观察者；已完成时在当前线程立即重放结果
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.subscribe_boxed(Box::new(observer))
    }

    /// 当前结果（未完成时为 `None`）
    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.shared.lock() {
            State::Pending { .. } => None,
            State::Terminal(outcome) => Some(outcome.clone()),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.shared.lock(), State::Terminal(_))
    }

    /// 等待中的观察者数量
    pub fn pending_observers(&self) -> usize {
        match &*self.shared.lock() {
            State::Pending { observers, .. } => observers.len(),
            State::Terminal(_) => 0,
        }
    }

    /// 经由 `offload` 投递的视图
    pub fn publish_on(&self, offload: Arc<dyn Offload>) -> Completion<T> {
        Completion {
            signal: self.clone(),
            offload: Some(offload),
        }
    }

    /// 在完成线程上直接投递的视图
    pub fn inline(&self) -> Completion<T> {
        Completion {
            signal: self.clone(),
            offload: None,
        }
    }

    /// 等待结果的 future；被丢弃时只取消自身的订阅
    pub fn wait(&self) -> Wait<T> {
        Wait::new(self)
    }
}

impl<T> Default for CompletionSignal<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscribable<T> for CompletionSignal<T>
where
    T: Clone + Send + 'static,
{
    fn subscribe_boxed(&self, observer: Observer<T>) -> Subscription {
        let outcome = {
            let mut state = self.shared.lock();
            match &mut *state {
                State::Pending { observers, next_id } => {
                    let id = *next_id;
                    *next_id += 1;
                    observers.insert(id, observer);
                    let shared: Arc<dyn Detach> = self.shared.clone();
                    return Subscription::registered(Arc::downgrade(&shared), id);
                }
                State::Terminal(outcome) => outcome.clone(),
            }
        };

        deliver(observer, outcome);
        Subscription::delivered()
    }
}

impl<T> IntoFuture for CompletionSignal<T>
where
    T: Clone + Send + 'static,
{
    type Output = Outcome<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Self::IntoFuture {
        Wait::new(&self)
    }
}

/// 单个观察者的订阅句柄
///
/// 取消只影响这一个观察者，不会影响信号本身或其他观察者。
/// 丢弃句柄不会取消订阅。
pub struct Subscription {
    registration: Option<(Weak<dyn Detach>, u64)>,
}

impl Subscription {
    fn registered(signal: Weak<dyn Detach>, id: u64) -> Self {
        Self {
            registration: Some((signal, id)),
        }
    }

    fn delivered() -> Self {
        Self { registration: None }
    }

    /// 取消订阅；仅当观察者在投递前被移除时返回 `true`
    pub fn cancel(&self) -> bool {
        match &self.registration {
            Some((signal, id)) => signal
                .upgrade()
                .map(|signal| signal.detach(*id))
                .unwrap_or(false),
            None => false,
        }
    }
}

/// 带投递线程策略的信号视图
///
/// `offload` 为 `None` 时在完成信号的线程上投递，否则每个观察者的回调
/// 都提交给转移执行器。执行器拒绝或丢弃任务时，观察者在当前线程收到
/// 拒绝错误，而不是被遗漏。
pub struct Completion<T = ()> {
    signal: CompletionSignal<T>,
    offload: Option<Arc<dyn Offload>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
            offload: self.offload.clone(),
        }
    }
}

impl<T> Completion<T>
where
    T: Clone + Send + 'static,
{
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.subscribe_boxed(Box::new(observer))
    }

    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.signal.outcome()
    }

    pub fn is_done(&self) -> bool {
        self.signal.is_done()
    }

    pub fn is_offloaded(&self) -> bool {
        self.offload.is_some()
    }

    /// 底层的未转移信号
    pub fn signal(&self) -> &CompletionSignal<T> {
        &self.signal
    }

    pub fn wait(&self) -> Wait<T> {
        Wait::new(self)
    }
}

impl<T> Subscribable<T> for Completion<T>
where
    T: Clone + Send + 'static,
{
    fn subscribe_boxed(&self, observer: Observer<T>) -> Subscription {
        let offload = match &self.offload {
            Some(offload) => offload.clone(),
            None => return self.signal.subscribe_boxed(observer),
        };

        self.signal.subscribe(move |outcome| {
            let redelivery = Redelivery {
                observer: Some(observer),
                outcome: Some(outcome),
                target: offload.name().to_string(),
            };
            if let Err(cause) = offload.execute(Box::new(move || redelivery.run())) {
                // 任务已被丢弃，Redelivery 的 drop 已经投递了拒绝错误
                warn!(executor = offload.name(), error = %cause, "Signal offload rejected");
            }
        })
    }
}

impl<T> IntoFuture for Completion<T>
where
    T: Clone + Send + 'static,
{
    type Output = Outcome<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Self::IntoFuture {
        Wait::new(&self)
    }
}

struct Redelivery<T> {
    observer: Option<Observer<T>>,
    outcome: Option<Outcome<T>>,
    target: String,
}

impl<T> Redelivery<T> {
    fn run(mut self) {
        if let (Some(observer), Some(outcome)) = (self.observer.take(), self.outcome.take()) {
            deliver(observer, outcome);
        }
    }
}

impl<T> Drop for Redelivery<T> {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.take() {
            let cause = Cause::new(FluxError::OffloadRejected(self.target.clone()));
            deliver(observer, Err(cause));
        }
    }
}

/// 等待终态结果的 future
pub struct Wait<T> {
    receiver: oneshot::Receiver<Outcome<T>>,
    subscription: Subscription,
}

impl<T> Wait<T>
where
    T: Send + 'static,
{
    fn new<S>(source: &S) -> Self
    where
        S: Subscribable<T> + ?Sized,
    {
        let (tx, rx) = oneshot::channel();
        let subscription = source.subscribe_boxed(Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }));
        Self {
            receiver: rx,
            subscription,
        }
    }
}

impl<T> Future for Wait<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Cause::new(FluxError::Cancelled))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Wait<T> {
    fn drop(&mut self) {
        self.subscription.cancel();
    }
}

/// 调用观察者，隔离其 panic
pub(crate) fn deliver<T>(observer: Observer<T>, outcome: Outcome<T>) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(move || observer(outcome))) {
        error!(panic = %panic_message(&*panic), "Completion observer panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
