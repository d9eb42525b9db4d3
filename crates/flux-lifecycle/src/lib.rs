pub mod lifecycle;
pub mod pool;
pub mod state;
pub mod transport;

pub use lifecycle::{ClosedNotifier, Lifecycle, ListenableCloseable, Transport};
pub use pool::{ConnectionPool, PoolStats};
pub use state::LifecycleState;
pub use transport::{ShutdownListener, ShutdownMode, TaskTransport, TransportError};
