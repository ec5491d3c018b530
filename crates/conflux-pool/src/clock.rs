//! 生产时钟：将 [`Clock`] 契约落到 Tokio 的时间驱动上。
//!
//! # 设计动机（Why）
//! - 契约层的 `MockClock` 面向测试；运行期的睡眠应复用事件管理器
//!   current_thread 运行时自带的定时器轮，而不是为每次等待派生线程。
//!
//! # 注意事项（Trade-offs）
//! - `tokio::time::sleep` 的定时器句柄在 Future 首次被轮询时才会绑定
//!   运行时，因此这里把构造推迟到 `async` 块内部——`sleep` 本身可以在
//!   任意线程上调用，只要返回的 Future 最终在 Tokio 运行时中被驱动。

use conflux_core::{Clock, Sleep};
use std::time::{Duration, Instant};

/// 基于 Tokio 定时器的系统时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        // 构造推迟到首次 poll，保证在运行时上下文之外调用本方法不会 panic。
        Box::pin(async move {
            tokio::time::sleep(duration).await;
        })
    }
}
