use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// 资源生命周期状态
///
/// 只能沿 OPEN -> GRACEFULLY_CLOSING -> CLOSING 或 OPEN -> CLOSING 单向推进。
/// 「已关闭」不是状态值，由 closed 信号完成来表示。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecycleState {
    Open = 0,
    GracefullyClosing = 1,
    Closing = 2,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Open,
            1 => LifecycleState::GracefullyClosing,
            _ => LifecycleState::Closing,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Open => "open",
            LifecycleState::GracefullyClosing => "gracefully_closing",
            LifecycleState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// 原子状态单元，所有转换都通过交换或比较交换完成
pub(crate) struct AtomicLifecycleState(AtomicU8);

impl AtomicLifecycleState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Open as u8))
    }

    pub(crate) fn load(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// 无条件进入 CLOSING，返回之前的状态
    pub(crate) fn enter_closing(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.swap(LifecycleState::Closing as u8, Ordering::AcqRel))
    }

    /// OPEN -> GRACEFULLY_CLOSING
    pub(crate) fn begin_graceful(&self) -> bool {
        self.transition(LifecycleState::Open, LifecycleState::GracefullyClosing)
    }

    /// GRACEFULLY_CLOSING -> CLOSING
    pub(crate) fn escalate(&self) -> bool {
        self.transition(LifecycleState::GracefullyClosing, LifecycleState::Closing)
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
