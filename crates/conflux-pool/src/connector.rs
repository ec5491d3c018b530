//! 连接器状态机：有界、按间隔推进的外连尝试序列。
//!
//! ## 核心意图（Why）
//! - 每个 source id 至多一条在途序列；序列一经启动不可取消，只以
//!   “成功建立通道”或“尝试耗尽”收场——这使调用方的状态模型只有两个
//!   出口，全部经回调送达；
//! - 每次失败的尝试都触发一条 `ErrorConnecting` 告警（N 次尝试耗尽
//!   恰好 N 条），被动监控无需等待最终结果即可看到劣化。
//!
//! ## 行为契约（What）
//! - 尝试节奏：单次尝试的预算为 `interval`（连接与超时二选一）；失败后
//!   等满本轮剩余时间再开始下一次尝试；
//! - 解析策略：[`ResolutionMode::Once`] 只在首次尝试前解析主机名并缓存
//!   结果；[`ResolutionMode::EachAttempt`] 每次尝试前重新解析；
//! - 本地绑定失败触发 `ErrorBindingLocalAddr` 告警，且该次尝试计为
//!   失败（进入下一轮或耗尽）。

use crate::pool::PoolShared;
use conflux_core::{PoolState, ResolutionMode, Severity};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, lookup_host};
use tracing::debug;

/// 外连目标：既可以是已解析地址，也可以是待解析的主机名。
#[derive(Clone, Debug)]
pub enum ConnectTarget {
    /// 直接连接到给定地址，不做解析。
    Addr(SocketAddr),
    /// 按解析策略将主机名解析为地址后连接。
    Host { host: String, port: u16 },
}

impl From<SocketAddr> for ConnectTarget {
    fn from(value: SocketAddr) -> Self {
        ConnectTarget::Addr(value)
    }
}

impl From<(String, u16)> for ConnectTarget {
    fn from((host, port): (String, u16)) -> Self {
        ConnectTarget::Host { host, port }
    }
}

impl From<(&str, u16)> for ConnectTarget {
    fn from((host, port): (&str, u16)) -> Self {
        ConnectTarget::Host {
            host: host.to_owned(),
            port,
        }
    }
}

/// 在途连接序列的目录占位记录。
///
/// 序列不可取消，目录中无需持有任务句柄；占位本身即“同一 source id
/// 不得重叠”不变量的载体。
#[derive(Debug)]
pub(crate) struct ConnectorEntry {
    pub(crate) manager_index: usize,
}

/// 单个序列的全部参数（启动时固化，之后只读）。
pub(crate) struct Connector {
    pub(crate) source_id: u64,
    pub(crate) target: ConnectTarget,
    pub(crate) num_attempts: u32,
    pub(crate) interval: Duration,
    pub(crate) options: conflux_core::ConnectOptions,
}

/// 单次尝试的失败形态，仅用于日志分类。
#[derive(Debug)]
enum AttemptFailure {
    Resolve(io::Error),
    NoAddresses,
    BindLocal(io::Error),
    Connect(io::Error),
    Timeout,
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::Resolve(err) => write!(f, "resolve failed: {err}"),
            AttemptFailure::NoAddresses => f.write_str("hostname resolved to no addresses"),
            AttemptFailure::BindLocal(err) => write!(f, "local bind failed: {err}"),
            AttemptFailure::Connect(err) => write!(f, "connect failed: {err}"),
            AttemptFailure::Timeout => f.write_str("attempt timed out"),
        }
    }
}

/// 连接序列主体：驻留在指派的管理器运行时上。
pub(crate) async fn connect_loop(shared: Arc<PoolShared>, connector: Connector) {
    let mut cached: Option<SocketAddr> = match connector.target {
        ConnectTarget::Addr(addr) => Some(addr),
        ConnectTarget::Host { .. } => None,
    };

    for attempt in 1..=connector.num_attempts {
        let attempt_started = shared.clock.now();
        match run_attempt(&shared, &connector, &mut cached).await {
            Ok(stream) => {
                debug!(
                    source_id = connector.source_id,
                    attempt, "connect attempt succeeded"
                );
                shared.remove_connector(connector.source_id);
                shared.adopt_connected(&connector, stream);
                return;
            }
            Err(failure) => {
                debug!(
                    source_id = connector.source_id,
                    attempt,
                    %failure,
                    "connect attempt failed"
                );
                shared.fire_pool_event(
                    PoolState::ErrorConnecting,
                    connector.source_id,
                    Severity::Alert,
                );
                if attempt < connector.num_attempts {
                    // 等满本轮剩余预算，保持尝试间隔的节奏。
                    let elapsed = shared
                        .clock
                        .now()
                        .saturating_duration_since(attempt_started);
                    if elapsed < connector.interval {
                        shared.clock.sleep(connector.interval - elapsed).await;
                    }
                }
            }
        }
    }
    shared.remove_connector(connector.source_id);
}

/// 单次尝试：解析 → 可选本地绑定 → 带超时的非阻塞连接。
async fn run_attempt(
    shared: &Arc<PoolShared>,
    connector: &Connector,
    cached: &mut Option<SocketAddr>,
) -> Result<std::net::TcpStream, AttemptFailure> {
    let addr = match (&connector.target, connector.options.resolution_value()) {
        (ConnectTarget::Addr(addr), _) => *addr,
        (ConnectTarget::Host { host, port }, mode) => {
            if let Some(addr) = *cached
                && mode == ResolutionMode::Once
            {
                addr
            } else {
                let mut addresses = lookup_host((host.as_str(), *port))
                    .await
                    .map_err(AttemptFailure::Resolve)?;
                let addr = addresses.next().ok_or(AttemptFailure::NoAddresses)?;
                *cached = Some(addr);
                addr
            }
        }
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(AttemptFailure::Connect)?;

    if let Some(local) = connector.options.local_address_value()
        && let Err(err) = socket.bind(local)
    {
        shared.fire_pool_event(
            PoolState::ErrorBindingLocalAddr,
            connector.source_id,
            Severity::Alert,
        );
        return Err(AttemptFailure::BindLocal(err));
    }

    let stream = if connector.interval.is_zero() {
        // 单次尝试且未设间隔：不施加超时（构造期已校验该组合）。
        socket.connect(addr).await.map_err(AttemptFailure::Connect)?
    } else {
        tokio::select! {
            connected = socket.connect(addr) => {
                connected.map_err(AttemptFailure::Connect)?
            }
            _ = shared.clock.sleep(connector.interval) => {
                // 超时：丢弃在途套接字（关闭并重建是每轮尝试的固定动作）。
                return Err(AttemptFailure::Timeout);
            }
        }
    };

    stream.into_std().map_err(AttemptFailure::Connect)
}
