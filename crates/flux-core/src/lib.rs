pub mod blocking;
pub mod completion;
pub mod error;

pub use blocking::{blocking_invocation, BlockingError, BlockingInvocation, Interrupt};
pub use completion::{
    Completion, CompletionSignal, Observer, Offload, Outcome, Subscribable, Subscription, Task,
    Wait,
};
pub use error::{Cause, FluxError};
