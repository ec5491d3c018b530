//! 时钟登记表：用户键控的一次性/周期性定时器。
//!
//! ## 核心意图（Why）
//! - 把“到期回调”与通道的线程亲和绑定：指定了通道的时钟钉在该通道的
//!   管理器上触发，消除“数据到达 vs. 超时”跨线程竞态；
//! - 周期重排用绝对截止时间推进（`deadline += period`），避免回调耗时
//!   造成的漂移累积。
//!
//! ## 行为契约（What）
//! - clock id 由调用方选择，在“当前已登记”的集合内必须唯一；重复登记
//!   返回 `DuplicateClockId`（冲突可重试）；
//! - `period` 为 `None` 或零时为一次性时钟，触发后自动摘除；
//! - 注销对不存在或已触发完毕的 id 是无害的空操作。

use crate::pool::PoolShared;
use conflux_core::ClockCallback;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// 登记表中的一条时钟记录。
#[derive(Debug)]
pub(crate) struct TimerEntry {
    pub(crate) manager_index: usize,
    /// 任务句柄在派生后回填；注销时用于中止任务。
    pub(crate) handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerEntry {
    pub(crate) fn new(manager_index: usize) -> Self {
        Self {
            manager_index,
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn store_handle(&self, handle: JoinHandle<()>) {
        *self.handle.lock().expect("timer handle slot poisoned") = Some(handle);
    }

    pub(crate) fn abort(&self) {
        if let Some(handle) = self.handle.lock().expect("timer handle slot poisoned").take() {
            handle.abort();
        }
    }
}

/// 时钟任务主体：驻留在指派管理器的运行时上。
///
/// # 执行逻辑（How）
/// 1. 睡到首个截止时间（已过期则立即触发）；
/// 2. 执行回调；周期时钟按绝对时间推进下一截止点，一次性时钟退出；
/// 3. 退出前从登记表自摘，使同一 id 可被顺序复用。
pub(crate) async fn clock_task(
    shared: Arc<PoolShared>,
    clock_id: u64,
    callback: ClockCallback,
    start: Instant,
    period: Option<Duration>,
) {
    let mut deadline = start;
    loop {
        let now = shared.clock.now();
        if deadline > now {
            shared.clock.sleep(deadline - now).await;
        }
        callback();
        match period {
            Some(period) if !period.is_zero() => deadline += period,
            _ => break,
        }
    }
    shared.remove_timer(clock_id);
}
