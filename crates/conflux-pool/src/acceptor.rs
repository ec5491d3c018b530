//! 监听器状态机：接受循环、瞬时资源耗尽的指数退避与空闲超时。
//!
//! ## 核心意图（Why）
//! - `accept` 因描述符/缓冲耗尽而失败属于瞬时故障，绝不升级为硬错误：
//!   监听器退出就绪等待、按指数退避计划一次重试，并以
//!   `ErrorAccepting` 告警让被动监控可见；
//! - 退避策略抽成独立的 [`AcceptBackoff`] 状态机（尝试计数 + 延迟），
//!   不内联在 I/O 循环里，使序列属性可以脱离真实套接字单测。
//!
//! ## 行为契约（What）
//! - 退避延迟从 1s 起逐次翻倍，封顶 64s；下一次 `accept` 成功后复位回
//!   基准值；
//! - 空闲超时窗口自上次接受（或上次超时触发）起算，窗口内无连接则
//!   触发 `AcceptTimeout` 并重启窗口；
//! - `close(server_id)` 只关闭监听套接字，已接受的通道不受影响。

use crate::pool::PoolShared;
use conflux_core::{PoolState, Severity};
use std::cmp;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

/// 退避基准延迟。
pub(crate) const ACCEPT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// 退避延迟上限。
pub(crate) const ACCEPT_BACKOFF_CAP: Duration = Duration::from_secs(64);

/// 接受重试的指数退避状态机。
///
/// # 契约说明（What）
/// - [`next_delay`](Self::next_delay) 产出非递减序列
///   `base, 2*base, 4*base, …`，到达 `cap` 后维持不变；
/// - [`reset`](Self::reset) 在一次成功的 `accept` 后调用，使序列从
///   基准值重新开始。
#[derive(Debug)]
pub(crate) struct AcceptBackoff {
    base: Duration,
    cap: Duration,
    current: Option<Duration>,
}

impl AcceptBackoff {
    pub(crate) fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: None,
        }
    }

    /// 下一次重试前应等待的时长。
    pub(crate) fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(current) => cmp::min(current.saturating_mul(2), self.cap),
        };
        self.current = Some(next);
        next
    }

    /// 成功接受后复位到基准值。
    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

/// 一个 server id 对应的监听器记录。
pub(crate) struct Acceptor {
    server_id: u64,
    local_addr: SocketAddr,
    manager_index: usize,
    enable_read: bool,
    half_open: conflux_core::HalfOpenPolicy,
    idle_timeout: Option<Duration>,
    /// 由接受循环一次性取走的监听套接字。
    listener: Mutex<Option<std::net::TcpListener>>,
    close_tx: watch::Sender<bool>,
}

impl Acceptor {
    pub(crate) fn new(
        server_id: u64,
        local_addr: SocketAddr,
        manager_index: usize,
        listener: std::net::TcpListener,
        options: &conflux_core::ListenOptions,
    ) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            server_id,
            local_addr,
            manager_index,
            enable_read: options.enable_read_value(),
            half_open: options.half_open_value(),
            idle_timeout: options.idle_timeout_value(),
            listener: Mutex::new(Some(listener)),
            close_tx,
        }
    }

    pub(crate) fn server_id(&self) -> u64 {
        self.server_id
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn manager_index(&self) -> usize {
        self.manager_index
    }

    /// 经此监听器建立的通道是否自动进入读循环。
    pub(crate) fn read_enabled(&self) -> bool {
        self.enable_read
    }

    /// 经此监听器建立的通道的半开策略。
    pub(crate) fn half_open_policy(&self) -> conflux_core::HalfOpenPolicy {
        self.half_open
    }

    /// 通知接受循环退出并释放监听套接字。
    pub(crate) fn close(&self) {
        let _ = self.close_tx.send_replace(true);
    }

    fn close_rx(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    fn take_listener(&self) -> Option<std::net::TcpListener> {
        self.listener.lock().expect("listener slot poisoned").take()
    }
}

/// `accept` 失败是否属于“应退避重试”的瞬时资源耗尽。
///
/// 覆盖 EMFILE/ENFILE（描述符耗尽）、ENOBUFS/ENOMEM（缓冲耗尽）；其余
/// 失败同样走退避路径，只是额外记录告警日志。
fn is_resource_exhaustion(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    matches!(err.raw_os_error(), Some(libc_code) if RESOURCE_ERRNOS.contains(&libc_code))
}

/// EMFILE / ENFILE / ENOMEM / ENOBUFS（Linux 与 BSD 系的取值并集）。
const RESOURCE_ERRNOS: &[i32] = &[23, 24, 12, 55, 105];

/// 接受循环：驻留在监听器所属管理器的运行时上。
pub(crate) async fn accept_loop(shared: Arc<PoolShared>, acceptor: Arc<Acceptor>) {
    let Some(std_listener) = acceptor.take_listener() else {
        return;
    };
    let listener = match TcpListener::from_std(std_listener) {
        Ok(listener) => listener,
        Err(err) => {
            warn!(
                server_id = acceptor.server_id,
                error = %err,
                "failed to register listener with the event manager reactor"
            );
            shared.fire_pool_event(
                PoolState::ErrorAccepting,
                acceptor.server_id,
                Severity::Critical,
            );
            shared.remove_acceptor(acceptor.server_id);
            return;
        }
    };

    let mut close_rx = acceptor.close_rx();
    let mut backoff = AcceptBackoff::new(ACCEPT_BACKOFF_BASE, ACCEPT_BACKOFF_CAP);

    loop {
        if *close_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = close_rx.changed() => break,
            _ = crate::util::optional_sleep(shared.clock.as_ref(), acceptor.idle_timeout) => {
                // 空闲窗口内没有任何连接抵达；告警后窗口自动重启。
                shared.fire_pool_event(
                    PoolState::AcceptTimeout,
                    acceptor.server_id,
                    Severity::Alert,
                );
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    backoff.reset();
                    debug!(server_id = acceptor.server_id, peer = %peer_addr, "accepted connection");
                    shared.adopt_accepted(&acceptor, stream);
                }
                Err(err) => {
                    if is_resource_exhaustion(&err) {
                        debug!(
                            server_id = acceptor.server_id,
                            error = %err,
                            "accept hit resource exhaustion, backing off"
                        );
                    } else {
                        warn!(
                            server_id = acceptor.server_id,
                            error = %err,
                            "accept failed, backing off"
                        );
                    }
                    shared.fire_pool_event(
                        PoolState::ErrorAccepting,
                        acceptor.server_id,
                        Severity::Alert,
                    );
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = shared.clock.sleep(delay) => {}
                        _ = close_rx.changed() => break,
                    }
                }
            }
        }
    }
    // 监听套接字随 listener 在此处释放；已接受的通道不受影响。
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = AcceptBackoff::new(ACCEPT_BACKOFF_BASE, ACCEPT_BACKOFF_CAP);
        let mut observed = Vec::new();
        for _ in 0..8 {
            observed.push(backoff.next_delay().as_secs());
        }
        assert_eq!(observed, [1, 2, 4, 8, 16, 32, 64, 64]);
    }

    #[test]
    fn backoff_resets_after_success() {
        let mut backoff = AcceptBackoff::new(ACCEPT_BACKOFF_BASE, ACCEPT_BACKOFF_CAP);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn resource_errno_classification() {
        assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(24)));
        assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(23)));
        assert!(!is_resource_exhaustion(&io::Error::from_raw_os_error(111)));
    }
}
