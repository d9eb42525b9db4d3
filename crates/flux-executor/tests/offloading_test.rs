use flux_core::{BlockingError, BlockingInvocation, CompletionSignal, Interrupt};
use flux_executor::{ExecutionStrategy, OffloadExecutor, OffloadPoint, StrategyScope};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

fn single_thread(name: &str) -> Arc<OffloadExecutor> {
    OffloadExecutor::builder(name)
        .with_worker_threads(1)
        .with_shutdown_grace(Duration::from_millis(200))
        .build()
        .unwrap()
}

/// 在 I/O 线程上完成信号，返回观察者所在线程是否属于 I/O 线程和转移线程
fn delivery_threads(
    io: &Arc<OffloadExecutor>,
    offload: &Arc<OffloadExecutor>,
    strategy: &ExecutionStrategy,
) -> (bool, bool) {
    let signal = CompletionSignal::<u32>::new();
    let view = strategy.publish_on(OffloadPoint::ResponseBody, &signal);
    let (tx, rx) = mpsc::channel();

    let io_owner = io.clone();
    let offload_owner = offload.clone();
    view.subscribe(move |outcome| {
        assert_eq!(outcome.unwrap(), 42);
        tx.send((io_owner.owns_current_thread(), offload_owner.owns_current_thread()))
            .unwrap();
    });

    io.execute(move || {
        signal.complete(42);
    })
    .unwrap();

    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

#[test]
fn test_offload_none_delivers_on_reactor_thread() {
    let io = single_thread("contract-io-a");
    let offload = single_thread("contract-offload-a");

    let strategy = ExecutionStrategy::offload_none();
    assert_eq!(delivery_threads(&io, &offload, &strategy), (true, false));

    io.close();
    offload.close();
}

#[test]
fn test_offload_all_never_delivers_on_reactor_thread() {
    let io = single_thread("contract-io-b");
    let offload = single_thread("contract-offload-b");

    let strategy = ExecutionStrategy::offload_all(offload.clone());
    for _ in 0..10 {
        assert_eq!(delivery_threads(&io, &offload, &strategy), (false, true));
    }

    io.close();
    offload.close();
}

#[test]
fn test_point_specific_override() {
    let io = single_thread("contract-io-c");
    let offload = single_thread("contract-offload-c");

    let global = StrategyScope::offload_all();
    let route = StrategyScope::new().inline(OffloadPoint::ResponseBody);
    let strategy = ExecutionStrategy::resolve(&offload, [&global, &route]);

    assert_eq!(delivery_threads(&io, &offload, &strategy), (true, false));
    assert!(strategy.is_offloaded(OffloadPoint::ResponseMetadata));

    io.close();
    offload.close();
}

/// 模拟一次流式响应：I/O 线程先把响应体交给处理函数，之后的每一轮再产生一个元素。
/// 处理函数用阻塞适配器逐个读取元素。
fn streaming_exchange(
    io: &Arc<OffloadExecutor>,
    strategy: ExecutionStrategy,
    interrupt: Interrupt,
) -> mpsc::Receiver<Result<Vec<u32>, BlockingError>> {
    let elements: Vec<CompletionSignal<u32>> = (0..3).map(|_| CompletionSignal::new()).collect();
    let (tx, rx) = mpsc::channel();

    let body = elements.clone();
    let reactor = io.clone();
    io.execute(move || {
        strategy
            .execute(OffloadPoint::ResponseBody, move || {
                let read = body
                    .iter()
                    .map(|element| {
                        BlockingInvocation::new(element)
                            .interruptible(&interrupt)
                            .wait()
                    })
                    .collect::<Result<Vec<_>, _>>();
                let _ = tx.send(read);
            })
            .unwrap();

        for (i, element) in elements.into_iter().enumerate() {
            reactor
                .execute(move || {
                    element.complete(i as u32);
                })
                .unwrap();
        }
    })
    .unwrap();

    rx
}

#[test]
fn test_blocking_stream_read_with_offload_completes() {
    let io = single_thread("hazard-io-a");
    let offload = single_thread("hazard-offload-a");

    let rx = streaming_exchange(
        &io,
        ExecutionStrategy::offload_all(offload.clone()),
        Interrupt::new(),
    );

    let body = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(body, vec![0, 1, 2]);

    io.close();
    offload.close();
}

#[test]
fn test_blocking_stream_read_without_offload_stalls_reactor() {
    let io = single_thread("hazard-io-b");
    let interrupt = Interrupt::new();

    let rx = streaming_exchange(&io, ExecutionStrategy::offload_none(), interrupt.clone());

    // 处理函数占住了唯一的 I/O 线程，元素永远不会产生
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(300)).unwrap_err(),
        RecvTimeoutError::Timeout
    );

    interrupt.interrupt();
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(result, Err(BlockingError::Interrupted)));

    io.close();
}
