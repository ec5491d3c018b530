//! 事件与回调契约的权威锚点模块。
//!
//! ## 设计目标（Why）
//! - **统一语义出口**：通道态、池态与严重级别只在此处定义一次，回调签名
//!   以类型别名固定，实现层与调用方不得另起平行枚举；
//! - **回调即事实**：同步 API 的返回值只回答“请求是否被受理”，通道与池
//!   的生命周期真相一律经由回调传递，因此回调契约必须稳定且机读友好。
//!
//! ## 契约说明（What）
//! - [`ChannelState`]：单条通道的状态迁移与告警事件；消费方对
//!   `ChannelDown` 至少要以 `shutdown` 响应，否则资源无法回收；
//! - [`PoolState`]：池级别的异步事件（接受超时、连接失败、容量上限等），
//!   搭配 [`Severity`] 用于被动监控；
//! - 回调闭包必须 `Send + Sync`，且能承受来自任意工作线程的调用——库不
//!   做跨线程串行化，也不保证所有事件都来自同一线程。
//!
//! ## 风险与注意事项（Trade-offs）
//! - 回调在产生事件的事件管理器线程上同步执行，耗时逻辑会阻塞该线程的
//!   就绪循环；建议回调内只做轻量登记，重活转交自己的执行器。

use crate::ids::ChannelId;
use bytes::BytesMut;
use std::any::Any;
use std::sync::Arc;

/// 通道级事件。
///
/// # 设计背景（Why）
/// - 读写半部可独立关闭，因此除 `ChannelDown` 外还需要方向限定的
///   `ChannelDownRead` / `ChannelDownWrite`；
/// - 写缓存水位线事件采用“闩锁”语义：越过高水位至多触发一次
///   `WriteCacheHiwat`，回落至低水位且此前确实越线时恰好触发一次
///   `WriteCacheLowwat`，不会在水位之上反复告警。
///
/// # 契约说明（What）
/// - `ChannelUp`：通道建立完毕，ID 自此可用于 `write`/`shutdown` 等操作；
/// - `ChannelDown`：通道整体关闭，整个生命周期内恰好触发一次；
/// - `ReadTimeout`：配置了读超时且窗口内无数据到达；窗口随活动重启；
/// - `MessageDiscarded`：通道因 I/O 故障关闭时写缓存中尚有未送出的数据；
/// - `AutoReadEnabled` / `AutoReadDisabled`：读循环的暂停/恢复确认，每次
///   状态翻转恰好一条。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChannelState {
    /// 通道建立完毕，可以开始读写。
    ChannelUp,
    /// 通道整体关闭（读写两侧均不可用），生命周期内恰好一次。
    ChannelDown,
    /// 读半部关闭，写半部仍可用（仅保持半开策略下出现）。
    ChannelDownRead,
    /// 写半部关闭，读半部仍可用（仅保持半开策略下出现）。
    ChannelDownWrite,
    /// 读超时窗口内没有任何数据到达。
    ReadTimeout,
    /// 写缓存越过高水位；每次越线至多一条。
    WriteCacheHiwat,
    /// 写缓存自越线状态回落至低水位；每次回落恰好一条。
    WriteCacheLowwat,
    /// 通道关闭时写缓存中仍有未送出的数据被丢弃。
    MessageDiscarded,
    /// 读循环已恢复。
    AutoReadEnabled,
    /// 读循环已暂停。
    AutoReadDisabled,
}

/// 池级事件。
///
/// # 契约说明（What）
/// - `AcceptTimeout`：某监听器在空闲超时窗口内未接受任何连接；
/// - `ErrorAccepting`：`accept` 因瞬时资源耗尽失败，池已进入指数退避；
/// - `ErrorConnecting`：一次外连尝试失败或超时；N 次尝试耗尽会产生恰好
///   N 条该事件；
/// - `ChannelLimit` / `CapacityLimit`：达到 `max_connections` 上限；前者
///   伴随接受/导入路径，后者伴随 `connect` 的同步拒绝；
/// - `ErrorBindingLocalAddr`：外连时绑定本地地址失败；
/// - `ErrorSettingOptions`：套接字选项设置失败；
/// - `EventManagerLimit`：无法再派生事件管理器线程。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolState {
    /// 监听器空闲超时。
    AcceptTimeout,
    /// `accept` 瞬时失败，正在退避重试。
    ErrorAccepting,
    /// 单次外连尝试失败。
    ErrorConnecting,
    /// 通道数量达到上限（接受/导入路径）。
    ChannelLimit,
    /// 池容量耗尽（`connect` 同步拒绝路径）。
    CapacityLimit,
    /// 本地地址绑定失败。
    ErrorBindingLocalAddr,
    /// 套接字选项设置失败。
    ErrorSettingOptions,
    /// 事件管理器线程派生失败。
    EventManagerLimit,
}

/// 池级事件的严重级别。
///
/// - `Critical`：请求被拒绝或资源已不可用，需要立即关注；
/// - `Alert`：信息性告警，池仍在按既定策略自救（退避、重试）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// 请求已被拒绝或资源不可用。
    Critical,
    /// 信息性告警，池内部仍在处理。
    Alert,
}

/// 通道的不透明用户上下文。
///
/// 以 `Arc<dyn Any>` 承载，调用方自行向下转型；池只负责在回调时原样回传。
pub type ChannelContext = Arc<dyn Any + Send + Sync>;

/// 通道状态回调。
///
/// # 契约说明（What）
/// - 参数依次为：通道 ID、创建该通道的 server/source id、事件、当前用户
///   上下文（若设置过）；
/// - **线程契约**：在产生事件的事件管理器线程上同步执行，同一通道的事件
///   保持先后顺序，不同通道的事件可能来自不同线程并发送达；
/// - **最低义务**：收到 [`ChannelState::ChannelDown`] 后必须调用
///   `shutdown` 归还通道资源。
pub type ChannelStateCallback =
    Arc<dyn Fn(ChannelId, u64, ChannelState, Option<ChannelContext>) + Send + Sync>;

/// 数据到达回调。
///
/// # 契约说明（What）
/// - `buffer` 为该通道的累积读缓冲；回调应消费所有完整的逻辑单元
///   （例如通过 `split_to` 截走），剩余字节由池保留并前缀到下次投递；
/// - 返回值为“凑齐下一个逻辑单元还需要的字节数”；返回 `0` 表示当前数据
///   不足以判断，有任何新数据到达即可再次回调；
/// - 返回 `n > 0` 时，池在缓冲至少增长 `n` 字节前不会重复回调。
pub type DataReadCallback =
    Arc<dyn Fn(&mut BytesMut, ChannelId, Option<ChannelContext>) -> usize + Send + Sync>;

/// 池状态回调。
///
/// 第二个参数为关联的 server/source id；无法关联具体对象的事件填 `0`。
pub type PoolStateCallback = Arc<dyn Fn(PoolState, u64, Severity) + Send + Sync>;

/// 注册时钟的到期回调。
pub type ClockCallback = Arc<dyn Fn() + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_are_object_safe_and_shareable() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        let cb: PoolStateCallback = Arc::new(move |state, id, severity| {
            assert_eq!(state, PoolState::ErrorConnecting);
            assert_eq!(id, 7);
            assert_eq!(severity, Severity::Alert);
            observed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let clone = Arc::clone(&cb);
        clone(PoolState::ErrorConnecting, 7, Severity::Alert);
        cb(PoolState::ErrorConnecting, 7, Severity::Alert);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
