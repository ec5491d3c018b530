//! 配置契约：池级配置与各操作的选项构造器。
//!
//! # 设计动机（Why）
//! - 将“构造即校验”作为硬约束：非法组合在 `build()` 处同步失败并返回
//!   [`ConfigError`](crate::error::ConfigError)，运行期代码从不面对
//!   半合法配置；
//! - 池级默认值（水位线、读超时）可被各操作选项逐通道覆盖，覆盖关系在
//!   此处集中声明，避免实现层散落判断。
//!
//! # 契约说明（What）
//! - [`ChannelPoolConfig`]：池构造参数，经由 [`ChannelPoolConfigBuilder`]
//!   校验后产出；
//! - [`ListenOptions`] / [`ConnectOptions`] / [`ImportOptions`]：单次
//!   操作的行为选项，全部具备保守默认值；
//! - [`HalfOpenPolicy`] 与 [`ShutdownDirection`]：半开语义与关闭方向的
//!   唯一定义点。

use crate::error::ConfigError;
use std::net::SocketAddr;
use std::time::Duration;

/// 写缓存高水位的默认值（1 MiB）。
pub const DEFAULT_WRITE_CACHE_HI_WATERMARK: usize = 1 << 20;

/// 指标采样窗口的默认值。
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// 通道的半开策略：决定单侧关闭时另一侧的命运。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HalfOpenPolicy {
    /// 任一方向的关闭都会使通道整体关闭（默认）。
    #[default]
    CloseBoth,
    /// 允许半开：单侧关闭后另一侧继续工作，直到它也关闭。
    KeepHalfOpen,
}

/// 外连时的主机名解析策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResolutionMode {
    /// 仅在第一次尝试前解析一次（默认）。
    #[default]
    Once,
    /// 每次尝试前都重新解析，适配 DNS 轮换场景。
    EachAttempt,
}

/// 关闭方向：`shutdown` 的第二个参数。
///
/// # 契约说明（What）
/// - `Read` / `Write` 在保持半开策略下只关闭对应半部；
/// - `Both` 等价于两个方向先后关闭；
/// - 在 [`HalfOpenPolicy::CloseBoth`] 策略下，任何方向都会整体关闭。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownDirection {
    /// 关闭读半部。
    Read,
    /// 关闭写半部。
    Write,
    /// 同时关闭读写半部。
    Both,
}

/// 通道池的池级配置。
///
/// # 教案式注释
/// - **意图 (Why)**：把线程数、容量上限、水位线等池级旋钮集中为一个经过
///   校验的值对象，实现层只读不改；
/// - **契约 (What)**：实例只能经 [`ChannelPoolConfigBuilder::build`] 获得，
///   因此不变量（`low <= high`、`max_threads >= 1`）恒成立；
/// - **权衡 (Trade-offs)**：字段私有 + 只读访问器，牺牲一点样板换取
///   “配置不可变”的全局假设。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelPoolConfig {
    max_threads: usize,
    max_connections: usize,
    metrics_interval: Duration,
    read_timeout: Option<Duration>,
    write_cache_hi_watermark: usize,
    write_cache_low_watermark: usize,
    collect_time_metrics: bool,
}

impl ChannelPoolConfig {
    /// 返回默认参数的构造器。
    pub fn builder() -> ChannelPoolConfigBuilder {
        ChannelPoolConfigBuilder::new()
    }

    /// 事件管理器线程数。
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// 并发通道数上限。
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// 忙闲比采样窗口。
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// 读超时；`None` 表示关闭该机制。
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// 写缓存高水位默认值（可逐通道覆盖）。
    pub fn write_cache_hi_watermark(&self) -> usize {
        self.write_cache_hi_watermark
    }

    /// 写缓存低水位默认值（可逐通道覆盖）。
    pub fn write_cache_low_watermark(&self) -> usize {
        self.write_cache_low_watermark
    }

    /// 是否采集事件管理器的时间指标。
    pub fn collect_time_metrics(&self) -> bool {
        self.collect_time_metrics
    }
}

impl Default for ChannelPoolConfig {
    fn default() -> Self {
        ChannelPoolConfigBuilder::new()
            .build()
            .expect("default channel pool config must be valid")
    }
}

/// [`ChannelPoolConfig`] 的构造器。
///
/// # 使用指引（How）
/// - 链式设置后调用 [`build`](Self::build)；任何违例都会同步返回
///   [`ConfigError`](crate::error::ConfigError)，不产出实例。
#[derive(Clone, Debug)]
pub struct ChannelPoolConfigBuilder {
    max_threads: usize,
    max_connections: usize,
    metrics_interval: Duration,
    read_timeout: Option<Duration>,
    write_cache_hi_watermark: usize,
    write_cache_low_watermark: usize,
    collect_time_metrics: bool,
}

impl ChannelPoolConfigBuilder {
    /// 以保守默认值初始化：单线程、1024 通道、1 MiB 高水位、0 低水位、
    /// 30s 采样窗口、不采集时间指标、无读超时。
    pub fn new() -> Self {
        Self {
            max_threads: 1,
            max_connections: 1024,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            read_timeout: None,
            write_cache_hi_watermark: DEFAULT_WRITE_CACHE_HI_WATERMARK,
            write_cache_low_watermark: 0,
            collect_time_metrics: false,
        }
    }

    /// 设置事件管理器线程数（必须 >= 1）。
    pub fn max_threads(mut self, value: usize) -> Self {
        self.max_threads = value;
        self
    }

    /// 设置并发通道数上限。
    pub fn max_connections(mut self, value: usize) -> Self {
        self.max_connections = value;
        self
    }

    /// 设置忙闲比采样窗口。
    pub fn metrics_interval(mut self, value: Duration) -> Self {
        self.metrics_interval = value;
        self
    }

    /// 设置读超时；`None` 关闭该机制。
    pub fn read_timeout(mut self, value: Option<Duration>) -> Self {
        self.read_timeout = value;
        self
    }

    /// 设置写缓存默认水位线。
    pub fn write_cache_watermarks(mut self, low: usize, high: usize) -> Self {
        self.write_cache_low_watermark = low;
        self.write_cache_hi_watermark = high;
        self
    }

    /// 开关事件管理器的时间指标采集。
    pub fn collect_time_metrics(mut self, value: bool) -> Self {
        self.collect_time_metrics = value;
        self
    }

    /// 校验并产出配置。
    ///
    /// # 契约说明（What）
    /// - **前置条件**：`max_threads >= 1`；`low <= high` 且 `high >= 1`；
    ///   开启时间指标时采样窗口为正；
    /// - **后置条件**：返回的配置在池的整个生命周期内不可变。
    pub fn build(self) -> Result<ChannelPoolConfig, ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::InvalidThreadCount { provided: 0 });
        }
        if self.write_cache_hi_watermark == 0
            || self.write_cache_low_watermark > self.write_cache_hi_watermark
        {
            return Err(ConfigError::InvalidWatermarks {
                low: self.write_cache_low_watermark,
                high: self.write_cache_hi_watermark,
            });
        }
        if self.collect_time_metrics && self.metrics_interval.is_zero() {
            return Err(ConfigError::InvalidMetricsInterval);
        }
        Ok(ChannelPoolConfig {
            max_threads: self.max_threads,
            max_connections: self.max_connections,
            metrics_interval: self.metrics_interval,
            read_timeout: self.read_timeout,
            write_cache_hi_watermark: self.write_cache_hi_watermark,
            write_cache_low_watermark: self.write_cache_low_watermark,
            collect_time_metrics: self.collect_time_metrics,
        })
    }
}

impl Default for ChannelPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `listen` 的行为选项。
#[derive(Clone, Debug)]
pub struct ListenOptions {
    backlog: u32,
    reuse_address: bool,
    enable_read: bool,
    half_open: HalfOpenPolicy,
    idle_timeout: Option<Duration>,
}

impl ListenOptions {
    /// 默认：backlog 128、允许地址复用、自动开读、任一侧关闭即整体关闭、
    /// 无空闲超时。
    pub fn new() -> Self {
        Self {
            backlog: 128,
            reuse_address: true,
            enable_read: true,
            half_open: HalfOpenPolicy::CloseBoth,
            idle_timeout: None,
        }
    }

    /// 设置监听队列深度。
    pub fn backlog(mut self, value: u32) -> Self {
        self.backlog = value;
        self
    }

    /// 开关 `SO_REUSEADDR`。
    pub fn reuse_address(mut self, value: bool) -> Self {
        self.reuse_address = value;
        self
    }

    /// 新通道是否自动进入读循环。
    pub fn enable_read(mut self, value: bool) -> Self {
        self.enable_read = value;
        self
    }

    /// 经此监听器建立的通道的半开策略。
    pub fn half_open(mut self, value: HalfOpenPolicy) -> Self {
        self.half_open = value;
        self
    }

    /// 空闲超时：窗口内未接受任何连接则触发
    /// [`PoolState::AcceptTimeout`](crate::event::PoolState::AcceptTimeout)。
    pub fn idle_timeout(mut self, value: Option<Duration>) -> Self {
        self.idle_timeout = value;
        self
    }

    /// 读取 backlog。
    pub fn backlog_value(&self) -> u32 {
        self.backlog
    }

    /// 读取地址复用开关。
    pub fn reuse_address_value(&self) -> bool {
        self.reuse_address
    }

    /// 读取自动开读开关。
    pub fn enable_read_value(&self) -> bool {
        self.enable_read
    }

    /// 读取半开策略。
    pub fn half_open_value(&self) -> HalfOpenPolicy {
        self.half_open
    }

    /// 读取空闲超时。
    pub fn idle_timeout_value(&self) -> Option<Duration> {
        self.idle_timeout
    }
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// `connect` 的行为选项。
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    enable_read: bool,
    half_open: HalfOpenPolicy,
    resolution: ResolutionMode,
    local_address: Option<SocketAddr>,
}

impl ConnectOptions {
    /// 默认：自动开读、任一侧关闭即整体关闭、仅解析一次、不绑定本地地址。
    pub fn new() -> Self {
        Self {
            enable_read: true,
            half_open: HalfOpenPolicy::CloseBoth,
            resolution: ResolutionMode::Once,
            local_address: None,
        }
    }

    /// 新通道是否自动进入读循环。
    pub fn enable_read(mut self, value: bool) -> Self {
        self.enable_read = value;
        self
    }

    /// 建立后的半开策略。
    pub fn half_open(mut self, value: HalfOpenPolicy) -> Self {
        self.half_open = value;
        self
    }

    /// 主机名解析策略。
    pub fn resolution(mut self, value: ResolutionMode) -> Self {
        self.resolution = value;
        self
    }

    /// 外连前绑定的本地地址；绑定失败触发
    /// [`PoolState::ErrorBindingLocalAddr`](crate::event::PoolState::ErrorBindingLocalAddr)
    /// 且该次尝试计为失败。
    pub fn local_address(mut self, value: Option<SocketAddr>) -> Self {
        self.local_address = value;
        self
    }

    /// 读取自动开读开关。
    pub fn enable_read_value(&self) -> bool {
        self.enable_read
    }

    /// 读取半开策略。
    pub fn half_open_value(&self) -> HalfOpenPolicy {
        self.half_open
    }

    /// 读取解析策略。
    pub fn resolution_value(&self) -> ResolutionMode {
        self.resolution
    }

    /// 读取本地绑定地址。
    pub fn local_address_value(&self) -> Option<SocketAddr> {
        self.local_address
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// `import` 的行为选项。
#[derive(Clone, Debug)]
pub struct ImportOptions {
    enable_read: bool,
    half_open: HalfOpenPolicy,
}

impl ImportOptions {
    /// 默认：自动开读、任一侧关闭即整体关闭。
    pub fn new() -> Self {
        Self {
            enable_read: true,
            half_open: HalfOpenPolicy::CloseBoth,
        }
    }

    /// 新通道是否自动进入读循环。
    pub fn enable_read(mut self, value: bool) -> Self {
        self.enable_read = value;
        self
    }

    /// 半开策略；导入已半关的套接字时应选择
    /// [`HalfOpenPolicy::KeepHalfOpen`]。
    pub fn half_open(mut self, value: HalfOpenPolicy) -> Self {
        self.half_open = value;
        self
    }

    /// 读取自动开读开关。
    pub fn enable_read_value(&self) -> bool {
        self.enable_read
    }

    /// 读取半开策略。
    pub fn half_open_value(&self) -> HalfOpenPolicy {
        self.half_open
    }
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    #[test]
    fn default_config_is_valid() {
        let config = ChannelPoolConfig::default();
        assert_eq!(config.max_threads(), 1);
        assert_eq!(config.max_connections(), 1024);
        assert_eq!(
            config.write_cache_hi_watermark(),
            DEFAULT_WRITE_CACHE_HI_WATERMARK
        );
        assert!(!config.collect_time_metrics());
    }

    #[test]
    fn zero_threads_is_rejected() {
        let err = ChannelPoolConfig::builder().max_threads(0).build();
        assert_eq!(err, Err(ConfigError::InvalidThreadCount { provided: 0 }));
    }

    #[test]
    fn inverted_watermarks_are_rejected() {
        let err = ChannelPoolConfig::builder()
            .write_cache_watermarks(64, 8)
            .build();
        assert_eq!(err, Err(ConfigError::InvalidWatermarks { low: 64, high: 8 }));
    }

    #[test]
    fn zero_metrics_interval_requires_metrics_off() {
        let err = ChannelPoolConfig::builder()
            .collect_time_metrics(true)
            .metrics_interval(Duration::ZERO)
            .build();
        assert_eq!(err, Err(ConfigError::InvalidMetricsInterval));

        let ok = ChannelPoolConfig::builder()
            .metrics_interval(Duration::ZERO)
            .build();
        assert!(ok.is_ok(), "未开启采集时窗口为零不应拒绝");
    }
}
