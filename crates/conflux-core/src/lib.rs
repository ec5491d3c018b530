#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "conflux-core: TCP 通道池的契约层。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：将通道池对外暴露的标识、事件、回调、错误与配置集中为单一事实来源，使实现层（conflux-pool）与调用方共享同一语言，避免语义漂移。"]
#![doc = "- **What**：定义 `ChannelId`、通道/池事件枚举、三类回调别名、`PoolError`/`ConfigError` 错误域、配置构造器，以及可注入的 `Clock` 时钟抽象。"]
#![doc = "- **How**：本 crate 不落地任何 I/O 或线程逻辑；所有类型均为纯数据或纯契约，可在任意线程间安全传递（`Send + Sync + 'static`）。"]

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod ids;

pub use clock::{Clock, MockClock, Sleep};
pub use config::{
    ChannelPoolConfig, ChannelPoolConfigBuilder, ConnectOptions, HalfOpenPolicy, ImportOptions,
    ListenOptions, ResolutionMode, ShutdownDirection,
};
pub use error::{ConfigError, ErrorCategory, PoolError};
pub use event::{
    ChannelContext, ChannelState, ChannelStateCallback, ClockCallback, DataReadCallback,
    PoolState, PoolStateCallback, Severity,
};
pub use ids::ChannelId;
