use std::future::Future;

use flux_core::{Cause, CompletionSignal};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::debug;

use crate::lifecycle::{ClosedNotifier, Transport};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport task `{name}` aborted: {reason}")]
    Aborted { name: String, reason: String },
}

/// I/O 任务看到的关闭请求
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownMode {
    Running,
    Graceful,
    Immediate,
}

/// I/O 任务持有的关闭监听器
#[derive(Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<ShutdownMode>,
}

impl ShutdownListener {
    pub fn mode(&self) -> ShutdownMode {
        *self.rx.borrow()
    }

    /// 等待下一次模式变化
    pub async fn changed(&mut self) -> ShutdownMode {
        if self.rx.changed().await.is_err() {
            return ShutdownMode::Immediate;
        }
        *self.rx.borrow_and_update()
    }

    /// 等待直到模式至少达到 `mode`
    pub async fn reached(&mut self, mode: ShutdownMode) -> ShutdownMode {
        loop {
            let current = *self.rx.borrow_and_update();
            if current >= mode {
                return current;
            }
            if self.rx.changed().await.is_err() {
                return ShutdownMode::Immediate;
            }
        }
    }
}

/// 由一个 tokio 任务驱动的传输
///
/// 任务结束即视为传输关闭：`Ok` 完成 closed 信号，`Err` 或任务异常退出则以
/// 失败完成。关闭请求通过 [`ShutdownListener`] 传给任务，任务自行决定如何收尾。
pub struct TaskTransport {
    name: String,
    mode: watch::Sender<ShutdownMode>,
    closed: CompletionSignal,
}

impl TaskTransport {
    pub fn spawn<F, Fut>(name: impl Into<String>, handle: &Handle, io: F) -> Self
    where
        F: FnOnce(ShutdownListener) -> Fut,
        Fut: Future<Output = Result<(), Cause>> + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = watch::channel(ShutdownMode::Running);
        let closed = CompletionSignal::new();

        let task = handle.spawn(io(ShutdownListener { rx }));
        let done = closed.clone();
        let task_name = name.clone();
        handle.spawn(async move {
            match task.await {
                Ok(Ok(())) => {
                    debug!(transport = %task_name, "Transport task finished");
                    done.complete(());
                }
                Ok(Err(cause)) => {
                    debug!(transport = %task_name, error = %cause, "Transport task failed");
                    done.fail(cause);
                }
                Err(err) => {
                    done.fail(Cause::new(TransportError::Aborted {
                        name: task_name,
                        reason: err.to_string(),
                    }));
                }
            }
        });

        Self {
            name,
            mode: tx,
            closed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ShutdownMode {
        *self.mode.borrow()
    }
}

impl Transport for TaskTransport {
    fn close(&self) -> Result<(), Cause> {
        self.mode.send_replace(ShutdownMode::Immediate);
        Ok(())
    }

    fn close_gracefully(&self) -> Result<(), Cause> {
        self.mode.send_if_modified(|mode| {
            if *mode == ShutdownMode::Running {
                *mode = ShutdownMode::Graceful;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    fn on_closed(&self, notifier: ClosedNotifier) {
        self.closed.subscribe(move |outcome| {
            notifier.terminate(outcome);
        });
    }
}
