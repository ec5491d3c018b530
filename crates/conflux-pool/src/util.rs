//! 内部小工具：select 分支里的可选睡眠。

use conflux_core::Clock;
use std::time::Duration;

/// `Some(d)` 时按注入时钟睡眠；`None` 时永久悬置，使对应的 select 分支
/// 自然失活（无需在每个调用点写 `if let` 守卫）。
pub(crate) async fn optional_sleep(clock: &dyn Clock, duration: Option<Duration>) {
    match duration {
        Some(duration) => clock.sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}
