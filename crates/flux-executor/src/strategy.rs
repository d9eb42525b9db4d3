use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use flux_core::{Completion, CompletionSignal, Offload};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::{ExecutorError, OffloadExecutor};

const POINT_COUNT: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown offload point: {0}")]
pub struct UnknownOffloadPoint(pub String);

/// 处理边界（可独立决定是否转移的投递点）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadPoint {
    ConnectionAccept,
    RequestMetadata,
    RequestBody,
    ResponseMetadata,
    ResponseBody,
    Close,
}

impl OffloadPoint {
    pub const ALL: [OffloadPoint; POINT_COUNT] = [
        OffloadPoint::ConnectionAccept,
        OffloadPoint::RequestMetadata,
        OffloadPoint::RequestBody,
        OffloadPoint::ResponseMetadata,
        OffloadPoint::ResponseBody,
        OffloadPoint::Close,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OffloadPoint::ConnectionAccept => "connection_accept",
            OffloadPoint::RequestMetadata => "request_metadata",
            OffloadPoint::RequestBody => "request_body",
            OffloadPoint::ResponseMetadata => "response_metadata",
            OffloadPoint::ResponseBody => "response_body",
            OffloadPoint::Close => "close",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for OffloadPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OffloadPoint {
    type Err = UnknownOffloadPoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OffloadPoint::ALL
            .into_iter()
            .find(|point| point.as_str() == s)
            .ok_or_else(|| UnknownOffloadPoint(s.to_string()))
    }
}

/// 投递方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// 在产生事件的线程（通常是 I/O 线程）上直接执行
    Inline,
    /// 转移到执行器
    Offload,
}

/// 单个作用域（全局、服务器、服务、方法）上的策略设置
///
/// 未设置的投递点继承自更宽的作用域。
#[derive(Clone, Default)]
pub struct StrategyScope {
    points: [Option<Dispatch>; POINT_COUNT],
    executor: Option<Arc<OffloadExecutor>>,
}

impl StrategyScope {
    /// 全部继承
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offload_all() -> Self {
        Self::uniform(Dispatch::Offload)
    }

    pub fn offload_none() -> Self {
        Self::uniform(Dispatch::Inline)
    }

    fn uniform(dispatch: Dispatch) -> Self {
        Self {
            points: [Some(dispatch); POINT_COUNT],
            executor: None,
        }
    }

    pub fn offload(self, point: OffloadPoint) -> Self {
        self.with(point, Dispatch::Offload)
    }

    pub fn inline(self, point: OffloadPoint) -> Self {
        self.with(point, Dispatch::Inline)
    }

    pub fn with(mut self, point: OffloadPoint, dispatch: Dispatch) -> Self {
        self.points[point.index()] = Some(dispatch);
        self
    }

    pub fn with_executor(mut self, executor: Arc<OffloadExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn dispatch(&self, point: OffloadPoint) -> Option<Dispatch> {
        self.points[point.index()]
    }

    pub fn executor(&self) -> Option<&Arc<OffloadExecutor>> {
        self.executor.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.executor.is_none() && self.points.iter().all(Option::is_none)
    }
}

impl fmt::Debug for StrategyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for point in OffloadPoint::ALL {
            if let Some(dispatch) = self.dispatch(point) {
                map.entry(&point.as_str(), &dispatch);
            }
        }
        if let Some(executor) = &self.executor {
            map.entry(&"executor", &executor.name());
        }
        map.finish()
    }
}

/// 为一次调用解析完成的执行策略，构造后不可变
#[derive(Clone)]
pub struct ExecutionStrategy {
    points: [Dispatch; POINT_COUNT],
    executor: Option<Arc<OffloadExecutor>>,
}

impl ExecutionStrategy {
    pub fn offload_none() -> Self {
        Self {
            points: [Dispatch::Inline; POINT_COUNT],
            executor: None,
        }
    }

    pub fn offload_all(executor: Arc<OffloadExecutor>) -> Self {
        Self {
            points: [Dispatch::Offload; POINT_COUNT],
            executor: Some(executor),
        }
    }

    /// 按从宽到窄的顺序合并作用域
    ///
    /// 较窄的作用域只覆盖它显式设置的投递点；所有作用域都未设置的点默认转移。
    /// 执行器取最窄的显式设置，否则使用 `fallback`。
    pub fn resolve<'a, I>(fallback: &Arc<OffloadExecutor>, scopes: I) -> Self
    where
        I: IntoIterator<Item = &'a StrategyScope>,
    {
        let mut points = [None; POINT_COUNT];
        let mut executor = None;

        for scope in scopes {
            for (resolved, specified) in points.iter_mut().zip(scope.points.iter()) {
                if specified.is_some() {
                    *resolved = *specified;
                }
            }
            if let Some(scoped) = &scope.executor {
                executor = Some(scoped.clone());
            }
        }

        let points = points.map(|dispatch| dispatch.unwrap_or(Dispatch::Offload));
        let executor = if points.contains(&Dispatch::Offload) {
            Some(executor.unwrap_or_else(|| fallback.clone()))
        } else {
            None
        };

        Self { points, executor }
    }

    pub fn dispatch(&self, point: OffloadPoint) -> Dispatch {
        self.points[point.index()]
    }

    pub fn is_offloaded(&self, point: OffloadPoint) -> bool {
        self.dispatch(point) == Dispatch::Offload && self.executor.is_some()
    }

    pub fn offloads_nothing(&self) -> bool {
        OffloadPoint::ALL.iter().all(|point| !self.is_offloaded(*point))
    }

    pub fn executor(&self) -> Option<&Arc<OffloadExecutor>> {
        self.executor.as_ref()
    }

    /// `point` 处使用的转移目标；直接执行时为 `None`
    pub fn offload_for(&self, point: OffloadPoint) -> Option<Arc<dyn Offload>> {
        if self.dispatch(point) != Dispatch::Offload {
            return None;
        }
        self.executor
            .as_ref()
            .map(|executor| executor.clone() as Arc<dyn Offload>)
    }

    /// 按 `point` 的设置投递 `signal` 的视图
    pub fn publish_on<T>(&self, point: OffloadPoint, signal: &CompletionSignal<T>) -> Completion<T>
    where
        T: Clone + Send + 'static,
    {
        match self.offload_for(point) {
            Some(offload) => signal.publish_on(offload),
            None => signal.inline(),
        }
    }

    /// 在 `point` 处执行任务：转移或在当前线程直接执行
    pub fn execute<F>(&self, point: OffloadPoint, task: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        match (&self.executor, self.dispatch(point)) {
            (Some(executor), Dispatch::Offload) => executor.execute(task),
            _ => {
                task();
                Ok(())
            }
        }
    }
}

impl fmt::Debug for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for point in OffloadPoint::ALL {
            map.entry(&point.as_str(), &self.dispatch(point));
        }
        map.entry(
            &"executor",
            &self.executor.as_ref().map(|executor| executor.name()),
        );
        map.finish()
    }
}
