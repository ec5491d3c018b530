//! 指标装置：事件管理器的忙闲采样与池级字节账本。
//!
//! # 设计目标（Why）
//! - **忙闲比**：对外契约是“最近一个已完成采样窗口内的 0–100 百分比”。
//!   实现手段是把每个任务的 `poll` 耗时累加进所属管理器的 CPU 账户，
//!   窗口期满时以 `cpu / 窗口时长` 折算百分比——窗口内未被记账的时间
//!   即阻塞等待（IO）时间，因此该比值等价于 `cpu / (cpu + io)`；
//! - **字节账本**：通道销毁后其累计读写字节不能从池级总量中消失。
//!   池维护带符号的调整量，销毁时把通道的终值并入调整量，使
//!   “活跃通道之和 + 调整量 == 生命周期总量”恒成立。
//!
//! # 契约说明（What）
//! - [`TimeMetrics::percentage`] 返回最近完成窗口的百分比，从未采样时
//!   返回 0；
//! - [`ByteAdjustments`] 的读取-清零语义与池级 `*_reset` 访问器配套：
//!   返回 `调整量 + 活跃和`，并把调整量置为 `-活跃和`，使后续总量从零
//!   重新累计；
//! - [`Instrumented`] 对包裹的 Future 透明：输出类型不变，仅在启用
//!   采集时记账。
//!
//! # 风险提示（Trade-offs）
//! - 记账用 `Relaxed` 原子累加，采样读取可能与写入交错；契约本就允许
//!   结果对应“最近的某个瞬间”，无需更强的序。

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// 单个事件管理器的忙闲采样状态。
#[derive(Debug)]
pub(crate) struct TimeMetrics {
    /// 当前窗口内累计的 poll 耗时（纳秒）。
    cpu_nanos: AtomicU64,
    /// 当前窗口的起点。
    window_start: Mutex<Instant>,
    /// 最近一个已完成窗口折算出的百分比。
    last_percentage: AtomicU32,
}

impl TimeMetrics {
    pub(crate) fn new() -> Self {
        Self {
            cpu_nanos: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
            last_percentage: AtomicU32::new(0),
        }
    }

    /// 记入一次任务轮询的耗时。
    pub(crate) fn record_poll(&self, elapsed: Duration) {
        self.cpu_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// 结算当前窗口：折算百分比并开启下一窗口。
    ///
    /// # 契约说明（What）
    /// - 百分比夹取到 `[0, 100]`；窗口长度为零时保持上一次的样本不变。
    pub(crate) fn sample(&self, now: Instant) {
        let window = {
            let mut start = self
                .window_start
                .lock()
                .expect("time metrics window poisoned");
            let elapsed = now.saturating_duration_since(*start);
            *start = now;
            elapsed
        };
        let cpu = self.cpu_nanos.swap(0, Ordering::Relaxed);
        let total = window.as_nanos() as u64;
        if total == 0 {
            return;
        }
        let percentage = ((cpu.saturating_mul(100)) / total).min(100) as u32;
        self.last_percentage.store(percentage, Ordering::Relaxed);
    }

    /// 最近一个已完成窗口的忙碌百分比；从未采样时为 0。
    pub(crate) fn percentage(&self) -> u32 {
        self.last_percentage.load(Ordering::Relaxed)
    }
}

/// 池级字节账本的调整量（带符号，见模块级说明）。
#[derive(Debug, Default)]
pub(crate) struct ByteAdjustments {
    pub(crate) read: i64,
    pub(crate) written: i64,
    pub(crate) requested: i64,
}

/// 对 Future 的 poll 记账包装。
///
/// # 教案式注释
/// - **意图 (Why)**：事件管理器上的所有任务统一经此包装派生，才能把
///   “执行回调/驱动 IO 的时间”与“阻塞等待的时间”区分开；
/// - **逻辑 (How)**：内部以 `Pin<Box<F>>` 持有被包装的 Future，使本类型
///   自身 `Unpin`，无需不安全的结构化投影（本 crate 禁用 `unsafe`）；
/// - **权衡 (Trade-offs)**：每个任务一次堆分配；任务均为长生命周期的
///   循环体，这笔开销可以忽略。未启用采集时跳过计时，包装近似零成本。
pub(crate) struct Instrumented<F> {
    inner: Pin<Box<F>>,
    metrics: Option<std::sync::Arc<TimeMetrics>>,
}

impl<F: Future> Instrumented<F> {
    pub(crate) fn new(inner: F, metrics: Option<std::sync::Arc<TimeMetrics>>) -> Self {
        Self {
            inner: Box::pin(inner),
            metrics,
        }
    }
}

impl<F: Future> Future for Instrumented<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.metrics {
            Some(metrics) => {
                let started = Instant::now();
                let result = this.inner.as_mut().poll(cx);
                metrics.record_poll(started.elapsed());
                result
            }
            None => this.inner.as_mut().poll(cx),
        }
    }
}
