//! # ChannelPool：通道池编排器
//!
//! ## 核心意图（Why）
//! - 池是全部目录（通道/监听器/连接器/时钟）的唯一所有者；事件管理器
//!   与任务只持有 ID 或 `Arc` 只读视图，销毁收敛为一次目录移除；
//! - 公共方法可从任意线程（包括回调内部）调用，且自身绝不阻塞在 I/O
//!   上：写是纯入队，读经回调驱动，连接与接受全部异步推进。
//!
//! ## 架构定位（Where）
//! - 下接 [`EventManager`]（线程与就绪循环）、[`Channel`]（单连接状态）
//!   与两个重试状态机（[`acceptor`](crate::acceptor) /
//!   [`connector`](crate::connector)）；
//! - 上对调用方暴露同步 API 与三类回调；回调是生命周期的事实来源，
//!   返回值只回答“请求是否被受理”。
//!
//! ## 行为契约（What）
//! - `start` 对已启动的池返回 `AlreadyStarted` 且不触碰任何状态；
//! - `stop` 优雅排空：静默关停全部通道与目录后逐一汇合管理器线程，
//!   宽限期内未退出的线程计入 [`PoolError::StopIncomplete`] 并被弃管；
//! - 指标访问器的结果与“最近的某个瞬间”一致（活跃和 + 调整量），不
//!   承诺与调用瞬间原子对齐。
//!
//! ## 风险提示（Trade-offs）
//! - 目录用 `DashMap` 分片锁：持 guard 期间不得调用用户回调，本模块的
//!   所有事件触发都安排在 guard 作用域之外。

use crate::acceptor::{Acceptor, accept_loop};
use crate::channel::{Channel, ChannelOrigin, read_loop, write_loop};
use crate::clock::TokioClock;
use crate::connector::{ConnectTarget, Connector, ConnectorEntry, connect_loop};
use crate::manager::EventManager;
use crate::metrics::ByteAdjustments;
use crate::timer::{TimerEntry, clock_task};
use bytes::Bytes;
use conflux_core::{
    ChannelContext, ChannelId, ChannelPoolConfig, ChannelState, ChannelStateCallback, Clock,
    ClockCallback, ConnectOptions, DataReadCallback, HalfOpenPolicy, ImportOptions, ListenOptions,
    PoolError, PoolState, PoolStateCallback, Severity, ShutdownDirection,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// 停机时等待每个管理器线程汇合的宽限期。
const STOP_GRACE: Duration = Duration::from_secs(5);

/// 单条通道的字节统计快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelStatistics {
    /// 自建立以来读入的字节数。
    pub bytes_read: u64,
    /// 自建立以来实际写出的字节数。
    pub bytes_written: u64,
    /// 自建立以来请求写出（成功入队）的字节数。
    pub bytes_requested: u64,
    /// 当前写缓存体量。
    pub write_cache_size: usize,
}

/// 新通道的装配参数（来源 + 逐通道行为开关）。
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChannelSeed {
    pub(crate) origin: ChannelOrigin,
    pub(crate) half_open: HalfOpenPolicy,
    pub(crate) enable_read: bool,
}

/// 池的共享内核：目录、回调、时钟与账本。
pub(crate) struct PoolShared {
    /// 指回自身的弱引用：&self 方法派生任务时借此取得 `Arc`。
    self_ref: Weak<PoolShared>,
    pub(crate) config: ChannelPoolConfig,
    pub(crate) channel_cb: ChannelStateCallback,
    pub(crate) data_cb: DataReadCallback,
    pub(crate) pool_cb: PoolStateCallback,
    pub(crate) clock: Arc<dyn Clock>,
    running: AtomicBool,
    managers: RwLock<Vec<Arc<EventManager>>>,
    channels: DashMap<ChannelId, Arc<Channel>>,
    acceptors: DashMap<u64, Arc<Acceptor>>,
    connectors: DashMap<u64, ConnectorEntry>,
    timers: DashMap<u64, Arc<TimerEntry>>,
    next_channel_id: AtomicU64,
    adjustments: Mutex<ByteAdjustments>,
}

impl PoolShared {
    /// 取得指向自身的 `Arc`（构造期经 `Arc::new_cyclic` 保证可升级）。
    fn arc(&self) -> Arc<PoolShared> {
        self.self_ref.upgrade().expect("pool shared storage alive")
    }

    // *** 事件触发 ***

    /// 在当前线程同步触发通道事件（仅限管理器任务上下文调用）。
    pub(crate) fn fire_channel_event(&self, channel: &Channel, state: ChannelState) {
        (self.channel_cb)(
            channel.id(),
            channel.origin().endpoint_id(),
            state,
            channel.context(),
        );
    }

    /// 把通道事件派发到其所属管理器的线程上执行。
    ///
    /// 任意线程（公共 API、关闭编排）产生的事件经此路径送达，维持
    /// “通道回调总在其管理器线程上执行”的线程契约。
    pub(crate) fn dispatch_channel_event(&self, channel: &Arc<Channel>, state: ChannelState) {
        let Some(manager) = self.manager_at(channel.manager_index()) else {
            return;
        };
        let shared = self.arc();
        let channel = Arc::clone(channel);
        manager.spawn(async move {
            shared.fire_channel_event(&channel, state);
        });
    }

    /// 触发池级事件（允许在任意线程上同步执行）。
    pub(crate) fn fire_pool_event(&self, state: PoolState, endpoint_id: u64, severity: Severity) {
        (self.pool_cb)(state, endpoint_id, severity);
    }

    // *** 管理器指派 ***

    fn managers_snapshot(&self) -> Vec<Arc<EventManager>> {
        self.managers.read().expect("managers lock poisoned").clone()
    }

    pub(crate) fn manager_at(&self, index: usize) -> Option<Arc<EventManager>> {
        self.managers
            .read()
            .expect("managers lock poisoned")
            .get(index)
            .cloned()
    }

    /// 选择新工作的宿主管理器：开启时间指标时按忙碌百分比（并列取
    /// 负载小者），否则按登记负载。
    pub(crate) fn allocate_manager(&self) -> Option<Arc<EventManager>> {
        let managers = self.managers.read().expect("managers lock poisoned");
        if self.config.collect_time_metrics() {
            managers
                .iter()
                .min_by_key(|m| (m.percentage(), m.load(), m.index()))
                .cloned()
        } else {
            managers.iter().min_by_key(|m| (m.load(), m.index())).cloned()
        }
    }

    // *** 通道装配 ***

    /// 接受路径：容量裁决后装配新通道。
    pub(crate) fn adopt_accepted(&self, acceptor: &Acceptor, stream: TcpStream) {
        if self.channels.len() >= self.config.max_connections() {
            drop(stream);
            self.fire_pool_event(
                PoolState::ChannelLimit,
                acceptor.server_id(),
                Severity::Critical,
            );
            return;
        }
        let std_stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(err) => {
                warn!(server_id = acceptor.server_id(), error = %err, "failed to detach accepted socket");
                return;
            }
        };
        let seed = ChannelSeed {
            origin: ChannelOrigin::Accepted {
                server_id: acceptor.server_id(),
            },
            half_open: acceptor.half_open_policy(),
            enable_read: acceptor.read_enabled(),
        };
        let _ = self.install_channel(std_stream, seed);
    }

    /// 连接路径：连接器已在发起时通过容量裁决。
    pub(crate) fn adopt_connected(&self, connector: &Connector, stream: std::net::TcpStream) {
        let seed = ChannelSeed {
            origin: ChannelOrigin::Connected {
                source_id: connector.source_id,
            },
            half_open: connector.options.half_open_value(),
            enable_read: connector.options.enable_read_value(),
        };
        let _ = self.install_channel(stream, seed);
    }

    /// 把一个（可能已半关的）非阻塞套接字装配为通道。
    ///
    /// # 执行步骤（How）
    /// 1. 选择宿主管理器并向其投递装配任务；
    /// 2. 任务内把套接字注册进该管理器的 reactor、分配通道 ID、写入
    ///    目录，并在同一线程上触发 `ChannelUp`；
    /// 3. 随后在同一管理器上派生读/写循环——通道终生不迁移。
    pub(crate) fn install_channel(
        &self,
        std_stream: std::net::TcpStream,
        seed: ChannelSeed,
    ) -> Result<(), PoolError> {
        if let Err(err) = std_stream.set_nonblocking(true) {
            return Err(PoolError::Io {
                op: "set socket nonblocking",
                source: err,
            });
        }
        let manager = self.allocate_manager().ok_or(PoolError::NotRunning)?;
        let manager_index = manager.index();
        let shared = self.arc();
        manager.spawn(async move {
            let stream = match TcpStream::from_std(std_stream) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "failed to register socket with the event manager reactor");
                    return;
                }
            };
            let (local_addr, peer_addr) = match (stream.local_addr(), stream.peer_addr()) {
                (Ok(local), Ok(peer)) => (local, peer),
                (Err(err), _) | (_, Err(err)) => {
                    warn!(error = %err, "failed to resolve socket addresses, dropping channel");
                    return;
                }
            };
            let id = ChannelId::from_raw(shared.next_channel_id.fetch_add(1, Ordering::SeqCst));
            let channel = Arc::new(Channel::new(
                id,
                seed.origin,
                manager_index,
                stream,
                local_addr,
                peer_addr,
                seed.half_open,
                shared.config.write_cache_low_watermark(),
                shared.config.write_cache_hi_watermark(),
                seed.enable_read,
                shared.clock.now(),
            ));
            shared.channels.insert(id, Arc::clone(&channel));
            if let Some(manager) = shared.manager_at(manager_index) {
                manager.register_entity();
            }
            debug!(channel = %id, peer = %peer_addr, manager = manager_index, "channel installed");
            if shared.channels.len() == shared.config.max_connections() {
                // 恰好到达上限：信息性告警，通道本身已受理。
                shared.fire_pool_event(
                    PoolState::ChannelLimit,
                    seed.origin.endpoint_id(),
                    Severity::Alert,
                );
            }
            shared.fire_channel_event(&channel, ChannelState::ChannelUp);
            if let Some(manager) = shared.manager_at(manager_index) {
                manager.spawn(read_loop(Arc::clone(&shared), Arc::clone(&channel)));
                manager.spawn(write_loop(Arc::clone(&shared), channel));
            }
        });
        Ok(())
    }

    // *** 关闭编排 ***
    //
    // 事件的恰好一次语义由三个原子闩承载：read_closed / write_closed 各
    // 守一个方向，down_fired 守 CHANNEL_DOWN 与目录移除。对已关闭方向的
    // 重复关闭是无害空操作，不重放任何事件。

    /// 读半部关闭（对端 EOF 或本端 `shutdown(Read)`）。
    ///
    /// `remove` 标记关闭是否由调用方的 `shutdown` 发起：是则整体关闭时
    /// 立即移除目录记录；否则记录保留（defunct）等待调用方按契约以
    /// `shutdown` 回收。
    pub(crate) fn on_read_closed(&self, channel: &Arc<Channel>, remove: bool) {
        if !channel.mark_read_closed() {
            return;
        }
        match channel.half_open() {
            HalfOpenPolicy::CloseBoth => self.finalize_close(channel, remove),
            HalfOpenPolicy::KeepHalfOpen => {
                if channel.is_write_closed() {
                    self.finalize_close(channel, remove);
                } else {
                    let _ = SockRef::from(channel.stream()).shutdown(Shutdown::Read);
                    channel.abort_read_loop();
                    self.dispatch_channel_event(channel, ChannelState::ChannelDownRead);
                }
            }
        }
    }

    /// 写半部关闭（本端 `shutdown(Write)` 或写路径故障）。
    ///
    /// 未送出的缓存数据被丢弃；确有丢弃时先于方向事件触发
    /// `MessageDiscarded`。
    pub(crate) fn on_write_closed(&self, channel: &Arc<Channel>, remove: bool) {
        if !channel.mark_write_closed() {
            return;
        }
        let discarded = channel.discard_pending_writes();
        if discarded {
            self.dispatch_channel_event(channel, ChannelState::MessageDiscarded);
        }
        match channel.half_open() {
            HalfOpenPolicy::CloseBoth => self.finalize_close(channel, remove),
            HalfOpenPolicy::KeepHalfOpen => {
                if channel.is_read_closed() {
                    self.finalize_close(channel, remove);
                } else {
                    let _ = SockRef::from(channel.stream()).shutdown(Shutdown::Write);
                    channel.abort_write_loop();
                    self.dispatch_channel_event(channel, ChannelState::ChannelDownWrite);
                }
            }
        }
    }

    /// 运行期 I/O 故障：无论半开策略，通道整体关闭。
    pub(crate) fn on_io_error(&self, channel: &Arc<Channel>, op: &'static str, err: std::io::Error) {
        debug!(channel = %channel.id(), op, error = %err, "channel io failure");
        channel.mark_read_closed();
        channel.mark_write_closed();
        let discarded = channel.discard_pending_writes();
        if discarded {
            self.dispatch_channel_event(channel, ChannelState::MessageDiscarded);
        }
        self.finalize_close(channel, false);
    }

    /// 整体关闭：恰好一次地触发 `ChannelDown`。
    ///
    /// 对端/故障发起的关闭（`remove == false`）保留目录记录：`ChannelDown`
    /// 的消费契约要求调用方以 `shutdown` 回收，届时记录才被移除。
    pub(crate) fn finalize_close(&self, channel: &Arc<Channel>, remove: bool) {
        channel.mark_read_closed();
        channel.mark_write_closed();
        let discarded = channel.discard_pending_writes();
        if !channel.mark_down() {
            return;
        }
        if discarded {
            self.dispatch_channel_event(channel, ChannelState::MessageDiscarded);
        }
        let _ = SockRef::from(channel.stream()).shutdown(Shutdown::Both);
        channel.broadcast_closed();
        channel.abort_read_loop();
        channel.abort_write_loop();
        self.dispatch_channel_event(channel, ChannelState::ChannelDown);
        if remove {
            self.remove_channel(channel.id());
        }
    }

    /// 目录移除（恰好一次）：把通道终值并入池级字节账本。
    pub(crate) fn remove_channel(&self, id: ChannelId) {
        if let Some((_, channel)) = self.channels.remove(&id) {
            {
                let mut adjustments = self.adjustments.lock().expect("adjustments poisoned");
                adjustments.read += channel.bytes_read() as i64;
                adjustments.written += channel.bytes_written() as i64;
                adjustments.requested += channel.bytes_requested() as i64;
            }
            if let Some(manager) = self.manager_at(channel.manager_index()) {
                manager.unregister_entity();
            }
        }
    }

    pub(crate) fn remove_acceptor(&self, server_id: u64) {
        if let Some((_, acceptor)) = self.acceptors.remove(&server_id) {
            acceptor.close();
            if let Some(manager) = self.manager_at(acceptor.manager_index()) {
                manager.unregister_entity();
            }
        }
    }

    pub(crate) fn remove_connector(&self, source_id: u64) {
        if let Some((_, entry)) = self.connectors.remove(&source_id) {
            if let Some(manager) = self.manager_at(entry.manager_index) {
                manager.unregister_entity();
            }
        }
    }

    /// 时钟任务触发完毕后的自摘（不中止任务）。
    pub(crate) fn remove_timer(&self, clock_id: u64) {
        if let Some((_, entry)) = self.timers.remove(&clock_id) {
            if let Some(manager) = self.manager_at(entry.manager_index) {
                manager.unregister_entity();
            }
        }
    }

    /// 注销路径：摘除并中止任务。对不存在的 id 为空操作。
    fn remove_timer_aborting(&self, clock_id: u64) {
        if let Some((_, entry)) = self.timers.remove(&clock_id) {
            entry.abort();
            if let Some(manager) = self.manager_at(entry.manager_index) {
                manager.unregister_entity();
            }
        }
    }

    /// 静默关停全部通道：不触发任何通道事件，只结算账本。
    fn teardown_channels(&self) {
        let ids: Vec<ChannelId> = self.channels.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, channel)) = self.channels.remove(&id) {
                channel.mark_down();
                channel.mark_read_closed();
                channel.mark_write_closed();
                channel.discard_pending_writes();
                let _ = SockRef::from(channel.stream()).shutdown(Shutdown::Both);
                channel.broadcast_closed();
                {
                    let mut adjustments = self.adjustments.lock().expect("adjustments poisoned");
                    adjustments.read += channel.bytes_read() as i64;
                    adjustments.written += channel.bytes_written() as i64;
                    adjustments.requested += channel.bytes_requested() as i64;
                }
                if let Some(manager) = self.manager_at(channel.manager_index()) {
                    manager.unregister_entity();
                }
            }
        }
    }

    fn teardown_timers(&self) {
        let ids: Vec<u64> = self.timers.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.remove_timer_aborting(id);
        }
    }

    fn lookup_channel(&self, id: ChannelId) -> Result<Arc<Channel>, PoolError> {
        self.channels
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(PoolError::UnknownChannel { channel_id: id })
    }

    fn ensure_running(&self) -> Result<(), PoolError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PoolError::NotRunning)
        }
    }

    /// 在池级账本锁内求活跃通道的字节和（与调整量读写保持互斥）。
    fn totals_with<R>(&self, f: impl FnOnce(&mut ByteAdjustments, i64, i64, i64) -> R) -> R {
        let mut adjustments = self.adjustments.lock().expect("adjustments poisoned");
        let mut read = 0i64;
        let mut written = 0i64;
        let mut requested = 0i64;
        for entry in self.channels.iter() {
            let channel = entry.value();
            read += channel.bytes_read() as i64;
            written += channel.bytes_written() as i64;
            requested += channel.bytes_requested() as i64;
        }
        f(&mut adjustments, read, written, requested)
    }
}

/// 线程化 TCP 通道池。
///
/// # 教案式注释
/// - **意图 (Why)**：以 N 条独立的事件管理器线程承载通道生命周期，
///   对外提供线程安全、非阻塞的同步 API 与回调驱动的事实流；
/// - **契约 (What)**：构造后需 [`start`](Self::start)；全部操作的前置
///   条件、冲突语义与事件副作用见各方法文档；
/// - **权衡 (Trade-offs)**：`Drop` 会尽力执行一次 `stop`，但无法上报
///   汇合失败；对停机结果有要求的调用方应显式调用 `stop`。
pub struct ChannelPool {
    shared: Arc<PoolShared>,
}

impl ChannelPool {
    /// 以默认时钟（Tokio 定时器）构造池。
    pub fn new(
        config: ChannelPoolConfig,
        channel_cb: ChannelStateCallback,
        data_cb: DataReadCallback,
        pool_cb: PoolStateCallback,
    ) -> Self {
        Self::with_clock(config, channel_cb, data_cb, pool_cb, Arc::new(TokioClock))
    }

    /// 注入自定义时钟构造池（测试用 `MockClock` 的入口）。
    pub fn with_clock(
        config: ChannelPoolConfig,
        channel_cb: ChannelStateCallback,
        data_cb: DataReadCallback,
        pool_cb: PoolStateCallback,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new_cyclic(|self_ref| PoolShared {
                self_ref: self_ref.clone(),
                config,
                channel_cb,
                data_cb,
                pool_cb,
                clock,
                running: AtomicBool::new(false),
                managers: RwLock::new(Vec::new()),
                channels: DashMap::new(),
                acceptors: DashMap::new(),
                connectors: DashMap::new(),
                timers: DashMap::new(),
                next_channel_id: AtomicU64::new(1),
                adjustments: Mutex::new(ByteAdjustments::default()),
            }),
        }
    }

    /// 池使用的时间源（测试中与 `MockClock` 配合推进）。
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.shared.clock)
    }

    // *** 生命周期 ***

    /// 启动：派生 `max_threads` 个事件管理器线程。
    ///
    /// # 契约说明（What）
    /// - **前置条件**：池未启动；已启动时返回 `AlreadyStarted` 且状态
    ///   不受影响；
    /// - **失败语义**：任一管理器线程派生失败即触发
    ///   `EventManagerLimit`（CRITICAL）、回滚已派生的线程并返回错误。
    pub fn start(&self) -> Result<(), PoolError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyStarted);
        }
        let mut spawned = Vec::with_capacity(self.shared.config.max_threads());
        for index in 0..self.shared.config.max_threads() {
            match EventManager::start(index, self.shared.config.collect_time_metrics()) {
                Ok(manager) => spawned.push(Arc::new(manager)),
                Err(err) => {
                    self.shared
                        .fire_pool_event(PoolState::EventManagerLimit, 0, Severity::Critical);
                    for manager in &spawned {
                        manager.stop(STOP_GRACE);
                    }
                    self.shared.running.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
        if self.shared.config.collect_time_metrics() {
            for manager in &spawned {
                let metrics = manager.time_metrics();
                let clock = Arc::clone(&self.shared.clock);
                let interval = self.shared.config.metrics_interval();
                manager.spawn(async move {
                    loop {
                        clock.sleep(interval).await;
                        metrics.sample(Instant::now());
                    }
                });
            }
        }
        *self.shared.managers.write().expect("managers lock poisoned") = spawned;
        debug!(
            threads = self.shared.config.max_threads(),
            "channel pool started"
        );
        Ok(())
    }

    /// 优雅停机：排空目录并汇合全部管理器线程。
    ///
    /// # 契约说明（What）
    /// - 通道被静默关停（不触发通道事件），其字节计数并入池级账本；
    /// - 宽限期内未退出的线程计入 [`PoolError::StopIncomplete`]，随后
    ///   被弃管——无论如何，返回时池都已回到未启动状态。
    pub fn stop(&self) -> Result<(), PoolError> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }
        self.shared.teardown_timers();
        self.shared.connectors.clear();
        let server_ids: Vec<u64> = self.shared.acceptors.iter().map(|e| *e.key()).collect();
        for server_id in server_ids {
            self.shared.remove_acceptor(server_id);
        }
        self.shared.teardown_channels();

        let managers = std::mem::take(
            &mut *self.shared.managers.write().expect("managers lock poisoned"),
        );
        let mut unjoined = 0usize;
        for manager in &managers {
            if !manager.stop(STOP_GRACE) {
                unjoined += 1;
            }
        }
        if unjoined > 0 {
            Err(PoolError::StopIncomplete { unjoined })
        } else {
            Ok(())
        }
    }

    /// 池保持运行，但立即关停并移除全部通道、连接器与时钟。
    ///
    /// 监听器与管理器线程不受影响；被移除的通道不触发任何事件，字节
    /// 计数照常并入账本。
    pub fn stop_and_remove_all_channels(&self) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        self.shared.teardown_timers();
        self.shared.connectors.clear();
        self.shared.teardown_channels();
        Ok(())
    }

    // *** 监听与连接 ***

    /// 在 `addr` 上开始监听，监听器以 `server_id` 标识。
    ///
    /// # 契约说明（What）
    /// - **冲突**：同一 `server_id` 已有监听器时返回
    ///   `DuplicateServerId`（冲突可重试），无任何副作用；
    /// - **返回值**：实际绑定的本地地址（端口 0 时为内核分配的端口）；
    /// - **事件**：选项设置失败触发 `ErrorSettingOptions` 告警后返回
    ///   错误；绑定/监听失败只经返回值报告。
    pub fn listen(
        &self,
        addr: SocketAddr,
        server_id: u64,
        options: ListenOptions,
    ) -> Result<SocketAddr, PoolError> {
        self.shared.ensure_running()?;
        if self.shared.acceptors.contains_key(&server_id) {
            return Err(PoolError::DuplicateServerId { server_id });
        }

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| PoolError::Io {
                op: "create listener socket",
                source: err,
            })?;
        if options.reuse_address_value()
            && let Err(err) = socket.set_reuse_address(true)
        {
            self.shared
                .fire_pool_event(PoolState::ErrorSettingOptions, server_id, Severity::Alert);
            return Err(PoolError::Io {
                op: "set SO_REUSEADDR",
                source: err,
            });
        }
        socket.set_nonblocking(true).map_err(|err| PoolError::Io {
            op: "set listener nonblocking",
            source: err,
        })?;
        socket.bind(&addr.into()).map_err(|err| PoolError::Io {
            op: "bind listener",
            source: err,
        })?;
        socket
            .listen(options.backlog_value().min(i32::MAX as u32) as i32)
            .map_err(|err| PoolError::Io {
                op: "listen",
                source: err,
            })?;
        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener.local_addr().map_err(|err| PoolError::Io {
            op: "query listener address",
            source: err,
        })?;

        let manager = self.shared.allocate_manager().ok_or(PoolError::NotRunning)?;
        let acceptor = Arc::new(Acceptor::new(
            server_id,
            local_addr,
            manager.index(),
            std_listener,
            &options,
        ));
        match self.shared.acceptors.entry(server_id) {
            Entry::Occupied(_) => {
                // 与并发 listen 竞争落败：丢弃刚绑定的套接字。
                return Err(PoolError::DuplicateServerId { server_id });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&acceptor));
            }
        }
        manager.register_entity();
        manager.spawn(accept_loop(Arc::clone(&self.shared), acceptor));
        debug!(server_id, %local_addr, "listener installed");
        Ok(local_addr)
    }

    /// 关闭 `server_id` 的监听器。已接受的通道不受影响。
    pub fn close(&self, server_id: u64) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        if !self.shared.acceptors.contains_key(&server_id) {
            return Err(PoolError::UnknownServer { server_id });
        }
        self.shared.remove_acceptor(server_id);
        Ok(())
    }

    /// 发起到 `target` 的连接序列，以 `source_id` 标识。
    ///
    /// # 契约说明（What）
    /// - **前置条件**：`num_attempts >= 1`，且 `interval > 0` 或
    ///   `num_attempts == 1`；违例返回 `InvalidArgument`，无副作用；
    /// - **容量**：池满时触发 `CapacityLimit`（CRITICAL）并返回
    ///   `CapacityLimit` 错误；
    /// - **冲突**：同一 `source_id` 的序列在途时返回
    ///   `DuplicateSourceId`（冲突可重试），无副作用、无回调；
    /// - **结局**：序列不可取消；成功以 `ChannelUp` 收场，每次失败的
    ///   尝试产生一条 `ErrorConnecting` 告警，耗尽后序列退场。
    pub fn connect(
        &self,
        target: impl Into<ConnectTarget>,
        num_attempts: u32,
        interval: Duration,
        source_id: u64,
        options: ConnectOptions,
    ) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        if num_attempts == 0 {
            return Err(PoolError::InvalidArgument {
                reason: "num_attempts must be >= 1",
            });
        }
        if interval.is_zero() && num_attempts > 1 {
            return Err(PoolError::InvalidArgument {
                reason: "interval must be positive when num_attempts > 1",
            });
        }
        if self.shared.channels.len() >= self.shared.config.max_connections() {
            self.shared
                .fire_pool_event(PoolState::CapacityLimit, source_id, Severity::Critical);
            return Err(PoolError::CapacityLimit {
                limit: self.shared.config.max_connections(),
            });
        }
        let manager = self.shared.allocate_manager().ok_or(PoolError::NotRunning)?;
        match self.shared.connectors.entry(source_id) {
            Entry::Occupied(_) => {
                return Err(PoolError::DuplicateSourceId { source_id });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ConnectorEntry {
                    manager_index: manager.index(),
                });
            }
        }
        manager.register_entity();
        let connector = Connector {
            source_id,
            target: target.into(),
            num_attempts,
            interval,
            options,
        };
        manager.spawn(connect_loop(Arc::clone(&self.shared), connector));
        Ok(())
    }

    /// 收养一个外部建立的套接字（可能已半关）为通道。
    ///
    /// 不经过监听器/连接器逻辑；`source_id` 仅作回调关联，不参与
    /// 唯一性裁决。
    pub fn import(
        &self,
        socket: std::net::TcpStream,
        source_id: u64,
        options: ImportOptions,
    ) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        if self.shared.channels.len() >= self.shared.config.max_connections() {
            self.shared
                .fire_pool_event(PoolState::CapacityLimit, source_id, Severity::Critical);
            return Err(PoolError::CapacityLimit {
                limit: self.shared.config.max_connections(),
            });
        }
        let seed = ChannelSeed {
            origin: ChannelOrigin::Imported { source_id },
            half_open: options.half_open_value(),
            enable_read: options.enable_read_value(),
        };
        self.shared.install_channel(socket, seed)
    }

    // *** 通道操作 ***

    /// 把 `data` 整块追加到通道的写缓存。
    ///
    /// # 契约说明（What）
    /// - 接受条件：`当前缓存 + len <= min(高水位, enqueue_watermark)`；
    ///   拒绝绝不部分入队；
    /// - 软拒绝（[`PoolError::WriteCacheHighWater`] /
    ///   [`PoolError::EnqueueWatermarkExceeded`]）可在缓存排空后重试，
    ///   与硬失败由 [`PoolError::category`] 区分；
    /// - 首次越过高水位时在通道的管理器线程上触发 `WriteCacheHiwat`。
    pub fn write(
        &self,
        channel_id: ChannelId,
        data: Bytes,
        enqueue_watermark: Option<usize>,
    ) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        let channel = self.shared.lookup_channel(channel_id)?;
        let (result, fire_hiwat) = channel.enqueue_write(data, enqueue_watermark);
        if fire_hiwat {
            self.shared
                .dispatch_channel_event(&channel, ChannelState::WriteCacheHiwat);
        }
        result
    }

    /// 关闭通道的指定方向。
    ///
    /// # 契约说明（What）
    /// - [`HalfOpenPolicy::CloseBoth`] 策略下任何方向都整体关闭；
    /// - 保持半开策略下按方向关闭；第二个方向关闭时整体关闭并恰好
    ///   触发一次 `ChannelDown`；
    /// - 对已关闭方向的重复关闭是成功的空操作，不重放事件；
    /// - 对已死 ID 返回 `UnknownChannel`。
    pub fn shutdown(
        &self,
        channel_id: ChannelId,
        direction: ShutdownDirection,
    ) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        let channel = self.shared.lookup_channel(channel_id)?;
        if channel.is_down() {
            // 对端/故障已整体关闭：本次 shutdown 即契约要求的回收调用。
            self.shared.remove_channel(channel_id);
            return Ok(());
        }
        match direction {
            ShutdownDirection::Read => self.shared.on_read_closed(&channel, true),
            ShutdownDirection::Write => self.shared.on_write_closed(&channel, true),
            ShutdownDirection::Both => {
                channel.mark_read_closed();
                channel.mark_write_closed();
                let discarded = channel.discard_pending_writes();
                if discarded {
                    self.shared
                        .dispatch_channel_event(&channel, ChannelState::MessageDiscarded);
                }
                self.shared.finalize_close(&channel, true);
            }
        }
        Ok(())
    }

    /// 恢复通道的读循环；翻转成功后在管理器线程上触发
    /// `AutoReadEnabled`。已启用时为成功的空操作。
    pub fn enable_read(&self, channel_id: ChannelId) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        let channel = self.shared.lookup_channel(channel_id)?;
        if channel.is_read_closed() {
            return Err(PoolError::InvalidArgument {
                reason: "read side of the channel is closed",
            });
        }
        if !channel.read_enabled() {
            channel.set_read_enabled(true);
        }
        Ok(())
    }

    /// 暂停通道的读循环；翻转成功后触发 `AutoReadDisabled`。
    pub fn disable_read(&self, channel_id: ChannelId) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        let channel = self.shared.lookup_channel(channel_id)?;
        if channel.is_read_closed() {
            return Err(PoolError::InvalidArgument {
                reason: "read side of the channel is closed",
            });
        }
        if channel.read_enabled() {
            channel.set_read_enabled(false);
        }
        Ok(())
    }

    /// 设置通道的不透明用户上下文；后续回调原样回传。
    pub fn set_channel_context(
        &self,
        channel_id: ChannelId,
        context: Option<ChannelContext>,
    ) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        let channel = self.shared.lookup_channel(channel_id)?;
        channel.set_context(context);
        Ok(())
    }

    /// 读取通道当前的用户上下文。
    pub fn channel_context(&self, channel_id: ChannelId) -> Result<Option<ChannelContext>, PoolError> {
        self.shared.ensure_running()?;
        Ok(self.shared.lookup_channel(channel_id)?.context())
    }

    /// 同时设置通道的两条水位线（要求 `low <= high`，`high >= 1`）。
    ///
    /// 把高水位调到当前缓存体量之下会立即置闩并触发一次
    /// `WriteCacheHiwat`（若此前未告警）。
    pub fn set_write_cache_watermarks(
        &self,
        channel_id: ChannelId,
        low: usize,
        high: usize,
    ) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        if high == 0 || low > high {
            return Err(PoolError::InvalidArgument {
                reason: "watermarks must satisfy low <= high, high >= 1",
            });
        }
        let channel = self.shared.lookup_channel(channel_id)?;
        if channel.set_watermarks(low, high) {
            self.shared
                .dispatch_channel_event(&channel, ChannelState::WriteCacheHiwat);
        }
        Ok(())
    }

    /// 只调整高水位，低水位保持不变。
    pub fn set_write_cache_hi_watermark(
        &self,
        channel_id: ChannelId,
        high: usize,
    ) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        let channel = self.shared.lookup_channel(channel_id)?;
        let (low, _) = channel.watermarks();
        if high == 0 || low > high {
            return Err(PoolError::InvalidArgument {
                reason: "watermarks must satisfy low <= high, high >= 1",
            });
        }
        if channel.set_watermarks(low, high) {
            self.shared
                .dispatch_channel_event(&channel, ChannelState::WriteCacheHiwat);
        }
        Ok(())
    }

    /// 只调整低水位，高水位保持不变。
    pub fn set_write_cache_low_watermark(
        &self,
        channel_id: ChannelId,
        low: usize,
    ) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        let channel = self.shared.lookup_channel(channel_id)?;
        let (_, high) = channel.watermarks();
        if low > high {
            return Err(PoolError::InvalidArgument {
                reason: "watermarks must satisfy low <= high, high >= 1",
            });
        }
        let _ = channel.set_watermarks(low, high);
        Ok(())
    }

    // *** 观测与统计 ***

    /// 单条通道的字节统计快照。
    pub fn channel_statistics(&self, channel_id: ChannelId) -> Result<ChannelStatistics, PoolError> {
        self.shared.ensure_running()?;
        let channel = self.shared.lookup_channel(channel_id)?;
        Ok(ChannelStatistics {
            bytes_read: channel.bytes_read(),
            bytes_written: channel.bytes_written(),
            bytes_requested: channel.bytes_requested(),
            write_cache_size: channel.write_cache_size(),
        })
    }

    /// 通道建立至今的时长（按池的时间源计）。
    pub fn channel_uptime(&self, channel_id: ChannelId) -> Result<Duration, PoolError> {
        self.shared.ensure_running()?;
        let channel = self.shared.lookup_channel(channel_id)?;
        Ok(self
            .shared
            .clock
            .now()
            .saturating_duration_since(channel.created_at()))
    }

    /// 写缓存的历史峰值。
    pub fn recorded_max_write_cache_size(&self, channel_id: ChannelId) -> Result<usize, PoolError> {
        self.shared.ensure_running()?;
        Ok(self
            .shared
            .lookup_channel(channel_id)?
            .recorded_max_write_cache_size())
    }

    /// 把写缓存峰值重置为当前体量，返回重置前的峰值。
    pub fn reset_recorded_max_write_cache_size(
        &self,
        channel_id: ChannelId,
    ) -> Result<usize, PoolError> {
        self.shared.ensure_running()?;
        Ok(self
            .shared
            .lookup_channel(channel_id)?
            .reset_recorded_max_write_cache_size())
    }

    /// 通道对端地址。
    pub fn peer_address(&self, channel_id: ChannelId) -> Result<SocketAddr, PoolError> {
        self.shared.ensure_running()?;
        Ok(self.shared.lookup_channel(channel_id)?.peer_addr())
    }

    /// 通道本地地址。
    pub fn local_address(&self, channel_id: ChannelId) -> Result<SocketAddr, PoolError> {
        self.shared.ensure_running()?;
        Ok(self.shared.lookup_channel(channel_id)?.local_addr())
    }

    /// 监听器的实际绑定地址。
    pub fn server_address(&self, server_id: u64) -> Result<SocketAddr, PoolError> {
        self.shared.ensure_running()?;
        self.shared
            .acceptors
            .get(&server_id)
            .map(|entry| entry.value().local_addr())
            .ok_or(PoolError::UnknownServer { server_id })
    }

    /// 当前受管的通道数。
    pub fn num_channels(&self) -> usize {
        self.shared.channels.len()
    }

    /// 事件管理器线程数（未启动时为 0）。
    pub fn num_threads(&self) -> usize {
        self.shared.managers.read().expect("managers lock poisoned").len()
    }

    /// 全部管理器最近采样窗口的平均忙碌百分比（0–100）。
    ///
    /// 未开启 `collect_time_metrics` 或尚未完成首个窗口时为 0。
    pub fn busy_metrics(&self) -> u32 {
        let managers = self.shared.managers_snapshot();
        if managers.is_empty() {
            return 0;
        }
        let sum: u32 = managers.iter().map(|m| m.percentage()).sum();
        sum / managers.len() as u32
    }

    /// 池生命周期内读入的总字节数（活跃和 + 调整量）。
    pub fn total_bytes_read(&self) -> i64 {
        self.shared.totals_with(|adj, read, _, _| adj.read + read)
    }

    /// 池生命周期内写出的总字节数。
    pub fn total_bytes_written(&self) -> i64 {
        self.shared
            .totals_with(|adj, _, written, _| adj.written + written)
    }

    /// 池生命周期内请求写出的总字节数。
    pub fn total_bytes_requested_to_be_written(&self) -> i64 {
        self.shared
            .totals_with(|adj, _, _, requested| adj.requested + requested)
    }

    /// 读取并清零读字节总量：返回当前总量，并使后续统计从零重新累计。
    pub fn total_bytes_read_reset(&self) -> i64 {
        self.shared.totals_with(|adj, read, _, _| {
            let result = adj.read + read;
            adj.read = -read;
            result
        })
    }

    /// 读取并清零写字节总量。
    pub fn total_bytes_written_reset(&self) -> i64 {
        self.shared.totals_with(|adj, _, written, _| {
            let result = adj.written + written;
            adj.written = -written;
            result
        })
    }

    /// 读取并清零请求写出字节总量。
    pub fn total_bytes_requested_to_be_written_reset(&self) -> i64 {
        self.shared.totals_with(|adj, _, _, requested| {
            let result = adj.requested + requested;
            adj.requested = -requested;
            result
        })
    }

    // *** 时钟登记 ***

    /// 登记一个一次性或周期性时钟。
    ///
    /// # 契约说明（What）
    /// - `clock_id` 在当前已登记集合内必须唯一，冲突返回
    ///   `DuplicateClockId`；
    /// - 指定 `channel` 时回调钉在该通道的管理器线程上触发；通道不
    ///   存在返回 `UnknownChannel`；未指定时选择最闲的管理器；
    /// - `period` 为 `None` 或零表示一次性时钟，触发后自动摘除。
    pub fn register_clock(
        &self,
        callback: ClockCallback,
        start: Instant,
        period: Option<Duration>,
        clock_id: u64,
        channel: Option<ChannelId>,
    ) -> Result<(), PoolError> {
        self.shared.ensure_running()?;
        let manager = match channel {
            Some(channel_id) => {
                let channel = self.shared.lookup_channel(channel_id)?;
                self.shared
                    .manager_at(channel.manager_index())
                    .ok_or(PoolError::NotRunning)?
            }
            None => self.shared.allocate_manager().ok_or(PoolError::NotRunning)?,
        };
        let entry = Arc::new(TimerEntry::new(manager.index()));
        match self.shared.timers.entry(clock_id) {
            Entry::Occupied(_) => {
                return Err(PoolError::DuplicateClockId { clock_id });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
            }
        }
        manager.register_entity();
        let handle = manager.spawn(clock_task(
            Arc::clone(&self.shared),
            clock_id,
            callback,
            start,
            period,
        ));
        entry.store_handle(handle);
        Ok(())
    }

    /// 注销时钟；对不存在或已触发完毕的 id 是无害的空操作。
    pub fn deregister_clock(&self, clock_id: u64) {
        self.shared.remove_timer_aborting(clock_id);
    }
}

impl Drop for ChannelPool {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::SeqCst) {
            let _ = self.stop();
        }
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("running", &self.shared.running.load(Ordering::SeqCst))
            .field("channels", &self.shared.channels.len())
            .field("acceptors", &self.shared.acceptors.len())
            .field("connectors", &self.shared.connectors.len())
            .field("timers", &self.shared.timers.len())
            .finish()
    }
}
