use flux_core::Cause;
use flux_executor::{ExecutionContext, ExecutorConfig, OffloadPoint};
use flux_lifecycle::{ConnectionPool, Lifecycle, ShutdownMode, TaskTransport};
use flux_logging::{init_logging, LoggingConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::sleep;

/// 模拟一条连接：周期性处理消息，收到优雅关闭后处理完手头的工作再退出
fn spawn_connection(id: usize, reset_after: Option<Duration>) -> TaskTransport {
    TaskTransport::spawn(format!("conn-{}", id), &Handle::current(), move |mut shutdown| async move {
        let reset = async {
            match reset_after {
                Some(delay) => sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(reset);

        loop {
            tokio::select! {
                _ = sleep(Duration::from_millis(200)) => {}
                _ = &mut reset => {
                    return Err(Cause::msg("connection reset by peer"));
                }
                mode = shutdown.changed() => match mode {
                    ShutdownMode::Graceful => {
                        println!("  [conn-{}] 收到优雅关闭，处理剩余请求", id);
                        sleep(Duration::from_millis(300)).await;
                        return Ok(());
                    }
                    ShutdownMode::Immediate => return Ok(()),
                    ShutdownMode::Running => {}
                },
            }
        }
    })
}

#[tokio::main]
async fn main() {
    if let Err(e) = init_logging(&LoggingConfig::default().with_directive("flux_lifecycle=debug")) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    println!("=== FLUX 资源生命周期示例 ===\n");

    // 1. 创建执行上下文
    println!("1. 创建执行上下文");
    let context = ExecutionContext::builder()
        .with_default_executor(ExecutorConfig::new("demo-offload"))
        .build()
        .unwrap();
    let strategy = context.strategy();
    println!(
        "关闭结果投递: {:?}\n",
        strategy.dispatch(OffloadPoint::Close)
    );

    // 2. 创建连接池
    println!("2. 创建连接池（最大排空时间: 2秒）");
    let pool = ConnectionPool::new("demo", Duration::from_secs(2));

    for id in 0..3 {
        let reset_after = (id == 2).then(|| Duration::from_millis(500));
        let connection = Arc::new(Lifecycle::new(spawn_connection(id, reset_after), &strategy));
        pool.register(connection);
    }
    println!("可路由连接数: {}\n", pool.routable_count());

    // 3. 等待对端断开一条连接
    println!("3. 等待 conn-2 被对端重置");
    sleep(Duration::from_secs(1)).await;
    println!("统计: {:?}\n", pool.stats());

    // 4. 优雅关闭连接池
    println!("4. 优雅关闭连接池");
    let outcomes = pool.close_gracefully().await;
    for outcome in &outcomes {
        println!("  关闭结果: {:?}", outcome);
    }

    println!("\n最终统计: {}", serde_json::to_string(&pool.stats()).unwrap());

    // 5. 关闭执行上下文
    println!("\n5. 关闭执行上下文");
    context.close();
    println!("\n=== 示例完成 ===");
}
