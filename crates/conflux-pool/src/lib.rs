#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "conflux-pool: 基于 Tokio 的线程化 TCP 通道池。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：把“接受入站、带重试的外连、通道生命周期、写背压、半开关闭、定时器与负载指标”收敛为一个可从任意线程调用的池对象，调用方只面对同步 API 与三类回调。"]
#![doc = "- **What**：`ChannelPool` 编排器 + N 条事件管理器线程（每条一个 current_thread Tokio 运行时）；通道一经指派终生钉在同一管理器上，回调在产生事件的管理器线程上同步执行。"]
#![doc = "- **How**：契约（标识/事件/错误/配置/时钟）来自 `conflux-core`；本 crate 只含实现。时间全部经 `Clock` 注入，退避与重试序列可用 `MockClock` 确定性复现。"]
#![doc = ""]
#![doc = "== 使用提示 =="]
#![doc = "- 回调是生命周期的事实来源：同步返回值只表示请求是否被受理；"]
#![doc = "- 收到 `ChannelDown` 后必须调用 `shutdown` 归还通道；"]
#![doc = "- 写入被高水位软拒绝后，应等待 `WriteCacheLowwat` 再重试。"]

mod acceptor;
mod channel;
mod clock;
mod connector;
mod manager;
mod metrics;
mod pool;
mod timer;
mod util;

pub use clock::TokioClock;
pub use connector::ConnectTarget;
pub use pool::{ChannelPool, ChannelStatistics};

// 契约层的常用类型一并再导出，调用方通常只需依赖本 crate。
pub use conflux_core::{
    ChannelContext, ChannelId, ChannelPoolConfig, ChannelPoolConfigBuilder, ChannelState,
    ChannelStateCallback, Clock, ClockCallback, ConfigError, ConnectOptions, DataReadCallback,
    ErrorCategory, HalfOpenPolicy, ImportOptions, ListenOptions, MockClock, PoolError, PoolState,
    PoolStateCallback, ResolutionMode, Severity, ShutdownDirection, Sleep,
};
