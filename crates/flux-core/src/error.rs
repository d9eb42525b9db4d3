use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// FLUX Core 统一错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FluxError {
    #[error("Offload rejected: {0}")]
    OffloadRejected(String),

    #[error("Subscription cancelled before a terminal outcome was delivered")]
    Cancelled,
}

/// 可在多个订阅者之间共享的失败原因
///
/// 终态结果会被广播给任意数量的订阅者，所以原因必须可以廉价克隆。
/// `Display` 与 `source()` 都直接委托给被包装的错误，`downcast_ref`
/// 可以取回原始错误类型。
#[derive(Clone)]
pub struct Cause(Arc<dyn StdError + Send + Sync + 'static>);

impl Cause {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// 从一段文本构造原因
    pub fn msg(message: impl Into<String>) -> Self {
        Self(Arc::new(Message(message.into())))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    pub fn is<E>(&self) -> bool
    where
        E: StdError + 'static,
    {
        self.0.is::<E>()
    }

    /// 两个原因是否来自同一次失败
    pub fn same_as(&self, other: &Cause) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl StdError for Cause {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl From<FluxError> for Cause {
    fn from(err: FluxError) -> Self {
        Cause::new(err)
    }
}

impl From<std::io::Error> for Cause {
    fn from(err: std::io::Error) -> Self {
        Cause::new(err)
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_keeps_original_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let cause = Cause::new(io);

        assert_eq!(cause.to_string(), "disk full");
        let original = cause.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(original.kind(), std::io::ErrorKind::Other);
    }

    #[test]
    fn test_cause_clone_shares_identity() {
        let cause = Cause::msg("boom");
        let copy = cause.clone();

        assert!(cause.same_as(&copy));
        assert!(!cause.same_as(&Cause::msg("boom")));
    }

    #[test]
    fn test_flux_error_into_cause() {
        let cause: Cause = FluxError::Cancelled.into();
        assert!(cause.is::<FluxError>());
        assert_eq!(cause.downcast_ref::<FluxError>(), Some(&FluxError::Cancelled));
    }
}
