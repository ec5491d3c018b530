//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义通道池对外的错误域，使同步 API 的三段式状态语义
//!   （受理成功 / 冲突可重试 / 硬失败）在 Rust 中以
//!   `Result<_, PoolError>` + [`ErrorCategory`] 的组合表达；
//! - 区分“配置构造期错误”（[`ConfigError`]，绝不产生副作用）与
//!   “运行期操作错误”（[`PoolError`]），两者的处置策略完全不同。
//!
//! ## 设计要求（What）
//! - 所有错误实现 `thiserror::Error`，`Send + Sync + 'static`，可跨线程
//!   传播；
//! - 可重试冲突（重复 id、写缓存软拒绝）通过
//!   [`PoolError::category`] 标记为 [`ErrorCategory::Retryable`]，对应
//!   原始三段式语义中的“正状态”；硬失败一律 `NonRetryable`；
//! - 前置条件违例在调用点同步拒绝，不触发任何回调，也不留下副作用。

use crate::ids::ChannelId;
use std::io;
use thiserror::Error;

/// 错误的自动化处置分类。
///
/// # 设计背景（Why）
/// - 调用方需要在不解析错误文案的情况下决定“稍后重试”还是“放弃”；
///   该分类即三段式状态码中“正 / 负”区分的结构化形态。
///
/// # 契约说明（What）
/// - `Retryable`：冲突性拒绝，等待在途操作完成或缓存排空后重试同一请求
///   通常会成功；
/// - `NonRetryable`：硬失败，重复同一请求不会改变结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 冲突性拒绝，稍后重试同一请求可能成功。
    Retryable,
    /// 硬失败，需要调用方改变条件后再尝试。
    NonRetryable,
}

/// 通道池运行期错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合生命周期、目录冲突、容量与 I/O 失败等关键路径
///   的异常；细粒度变体帮助运维快速定位故障来源；
/// - **契约 (What)**：同步 API 的返回值只描述“请求是否被受理”；异步的
///   连接/接受失败从不经由本类型返回，而是通过池状态回调送达；
/// - **设计权衡 (Trade-offs)**：`Io` 变体持有 `std::io::Error`，因此本
///   类型不派生 `Clone`；需要留存错误的调用方应记录 `category` 与文案。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// 池尚未启动（或已停止），操作被拒绝。
    #[error("channel pool is not running")]
    NotRunning,

    /// 池已处于运行状态，重复 `start` 被拒绝且不改动任何状态。
    #[error("channel pool is already started")]
    AlreadyStarted,

    /// 优雅停机未在宽限期内完成，`unjoined` 个管理器线程被强制弃管。
    ///
    /// - **契约 (What)**：返回该错误时池已不再运行，目录已清空；未退出
    ///   的线程不再被池引用，其任务已被取消。
    #[error("stop incomplete: {unjoined} event manager thread(s) failed to join")]
    StopIncomplete { unjoined: usize },

    /// 同一 server id 上已存在监听器。
    ///
    /// - **风险 (Trade-offs)**：属于冲突性拒绝；待 `close(server_id)`
    ///   之后可以复用同一 id。
    #[error("server id {server_id} already has an active listener")]
    DuplicateServerId { server_id: u64 },

    /// 同一 source id 上已有未完结的连接序列。
    ///
    /// - **契约 (What)**：当前调用无任何副作用；在途序列成功或耗尽后，
    ///   相同 id 的重试会被受理。
    #[error("source id {source_id} already has a connect sequence in flight")]
    DuplicateSourceId { source_id: u64 },

    /// 同一 clock id 已有未触发的注册。
    #[error("clock id {clock_id} is already registered")]
    DuplicateClockId { clock_id: u64 },

    /// 通道 ID 未命中目录：从未存在，或已经关闭并被移除。
    ///
    /// - **意图 (Why)**：对已死 ID 的任何引用都是错误而非静默忽略，
    ///   这是目录唯一所有权模型的外在保证。
    #[error("{channel_id} is not a live channel")]
    UnknownChannel { channel_id: ChannelId },

    /// server id 未命中监听器目录。
    #[error("server id {server_id} has no active listener")]
    UnknownServer { server_id: u64 },

    /// 参数违反前置条件，调用被同步拒绝且无副作用。
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: &'static str },

    /// 并发通道数已达 `max_connections` 上限。
    #[error("connection capacity exhausted (limit {limit})")]
    CapacityLimit { limit: usize },

    /// 写入会使缓存越过高水位，消息被整体拒绝（绝不部分入队）。
    ///
    /// - **契约 (What)**：属于软拒绝；待缓存排空（观察
    ///   `WriteCacheLowwat` 事件）后重试即可。
    #[error("write cache high watermark reached on {channel_id}")]
    WriteCacheHighWater { channel_id: ChannelId },

    /// 写入超出调用方本次指定的入队水位，消息被整体拒绝。
    #[error("per-call enqueue watermark exceeded on {channel_id}")]
    EnqueueWatermarkExceeded { channel_id: ChannelId },

    /// 通道写半部已关闭，不再接受新的写入。
    #[error("write side of {channel_id} is closed")]
    WriteSideClosed { channel_id: ChannelId },

    /// 底层系统调用失败。`op` 标记失败的操作，便于日志聚合。
    #[error("io failure during {op}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl PoolError {
    /// 返回错误的自动化处置分类。
    ///
    /// # 执行逻辑（How）
    /// - 目录冲突（重复 server/source/clock id）与写缓存软拒绝映射为
    ///   [`ErrorCategory::Retryable`]；其余变体一律
    ///   [`ErrorCategory::NonRetryable`]。
    pub fn category(&self) -> ErrorCategory {
        match self {
            PoolError::DuplicateServerId { .. }
            | PoolError::DuplicateSourceId { .. }
            | PoolError::DuplicateClockId { .. }
            | PoolError::WriteCacheHighWater { .. }
            | PoolError::EnqueueWatermarkExceeded { .. } => ErrorCategory::Retryable,
            _ => ErrorCategory::NonRetryable,
        }
    }

    /// 便捷判断：是否属于“稍后重试同一请求可能成功”的冲突性拒绝。
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Retryable
    }
}

/// 配置构造期错误：所有违例在 `build()` 时同步拒绝，绝不构造出半合法的池。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// 事件管理器线程数必须至少为 1。
    #[error("max_threads must be >= 1 (got {provided})")]
    InvalidThreadCount { provided: usize },

    /// 水位线必须满足 `low <= high` 且 `high >= 1`。
    #[error("write cache watermarks must satisfy low <= high, high >= 1 (got low={low}, high={high})")]
    InvalidWatermarks { low: usize, high: usize },

    /// 开启时间指标采集时，采样间隔必须为正。
    #[error("metrics_interval must be positive when collect_time_metrics is enabled")]
    InvalidMetricsInterval,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_conflicts_are_retryable() {
        assert!(PoolError::DuplicateSourceId { source_id: 9 }.is_retryable());
        assert!(PoolError::DuplicateServerId { server_id: 9 }.is_retryable());
        assert!(PoolError::DuplicateClockId { clock_id: 9 }.is_retryable());
        assert!(
            PoolError::WriteCacheHighWater {
                channel_id: ChannelId::from_raw(1)
            }
            .is_retryable()
        );
    }

    #[test]
    fn hard_failures_are_not_retryable() {
        assert_eq!(
            PoolError::NotRunning.category(),
            ErrorCategory::NonRetryable
        );
        assert_eq!(
            PoolError::UnknownChannel {
                channel_id: ChannelId::from_raw(3)
            }
            .category(),
            ErrorCategory::NonRetryable
        );
        assert_eq!(
            PoolError::CapacityLimit { limit: 16 }.category(),
            ErrorCategory::NonRetryable
        );
    }
}
