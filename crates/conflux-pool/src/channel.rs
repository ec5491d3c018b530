//! 通道：单条已建立连接的记录、写缓存状态机与读写循环。
//!
//! ## 核心意图（Why）
//! - 通道记录由池目录独占持有，事件管理器只经 `Arc` 共享只读视图；
//!   销毁是一次集中化的目录移除，杜绝“悬挂句柄”；
//! - 写路径是纯入队：公共 API 绝不阻塞在 I/O 上，排空由管理器线程的
//!   就绪循环机会主义推进；
//! - 水位线事件采用闩锁语义（见 [`WriteCache`]），保证越线与回落各自
//!   至多/恰好一次。
//!
//! ## 行为契约（What）
//! - 读循环把可用字节读入累积缓冲并调用数据回调；回调返回“凑齐下一个
//!   逻辑单元还需要的字节数”，0 表示有新数据即可再次回调；未消费的
//!   字节保留并前缀到下次投递；
//! - 写循环按入队顺序整块排空；单块写完后检查低水位回落；
//! - 半开策略与方向关闭的编排（事件的恰好一次语义）由
//!   `PoolShared` 的 `on_read_closed` / `on_write_closed` /
//!   `finalize_close` 集中实现，本模块只负责状态位与 I/O。
//!
//! ## 风险提示（Trade-offs）
//! - `try_read_buf` 在缓冲无剩余容量时返回 `Ok(0)`，与对端关闭同形；
//!   读循环在每次等待就绪前必须先 `reserve`，这是一条硬性不变量。

use crate::pool::PoolShared;
use bytes::{Bytes, BytesMut};
use conflux_core::{ChannelContext, ChannelId, ChannelState, HalfOpenPolicy, PoolError};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{Notify, watch};

/// 读缓冲的初始容量与每轮读取前保证的剩余空间。
const READ_CHUNK: usize = 8 * 1024;

/// 通道的来源：决定回调中回传的关联 id。
#[derive(Clone, Copy, Debug)]
pub(crate) enum ChannelOrigin {
    /// 经监听器接受。
    Accepted { server_id: u64 },
    /// 经连接器建立。
    Connected { source_id: u64 },
    /// 经 `import` 收养的外部套接字。
    Imported { source_id: u64 },
}

impl ChannelOrigin {
    /// 回调中使用的 server/source id。
    pub(crate) fn endpoint_id(&self) -> u64 {
        match self {
            ChannelOrigin::Accepted { server_id } => *server_id,
            ChannelOrigin::Connected { source_id } | ChannelOrigin::Imported { source_id } => {
                *source_id
            }
        }
    }
}

/// 写缓存的入队裁决。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EnqueueDecision {
    /// 消息已整块入队。
    Enqueued,
    /// 越过高水位且本次是首次越线：拒绝，且需要触发 HIWAT 事件。
    RejectedHiwatSignal,
    /// 越过高水位但此前已告警过：仅拒绝。
    RejectedHiwat,
    /// 超出调用方本次指定的入队水位：仅拒绝，无事件。
    RejectedPerCall,
    /// 写半部已关闭。
    RejectedClosed,
}

/// 写缓存状态机。
///
/// # 教案式注释
/// - **意图 (Why)**：把“容量判定 + 闩锁告警”收敛为一个可独立单测的
///   纯状态机，与套接字就绪彻底解耦；
/// - **契约 (What)**：
///   - 接受写入的充要条件是 `size + len <= min(hi, 本次入队水位)`，
///     高水位判定优先；消息绝不部分入队；
///   - `hiwat_signaled` 闩锁：置位时入队失败不再重复告警；排空使
///     `size <= low` 时复位并指示触发 LOWWAT；
/// - **权衡 (Trade-offs)**：`VecDeque<Bytes>` 持有的都是引用计数分片，
///   入队/排空均为 O(1) 且零拷贝。
#[derive(Debug)]
pub(crate) struct WriteCache {
    queue: VecDeque<Bytes>,
    size: usize,
    low: usize,
    hi: usize,
    hiwat_signaled: bool,
    closed: bool,
    max_recorded: usize,
}

impl WriteCache {
    pub(crate) fn new(low: usize, hi: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            size: 0,
            low,
            hi,
            hiwat_signaled: false,
            closed: false,
            max_recorded: 0,
        }
    }

    /// 入队裁决；只改状态，不做任何 I/O。
    pub(crate) fn enqueue(&mut self, data: Bytes, per_call: Option<usize>) -> EnqueueDecision {
        if self.closed {
            return EnqueueDecision::RejectedClosed;
        }
        let len = data.len();
        if self.size + len > self.hi {
            return if self.hiwat_signaled {
                EnqueueDecision::RejectedHiwat
            } else {
                self.hiwat_signaled = true;
                EnqueueDecision::RejectedHiwatSignal
            };
        }
        if per_call.is_some_and(|watermark| self.size + len > watermark) {
            return EnqueueDecision::RejectedPerCall;
        }
        self.size += len;
        if self.size > self.max_recorded {
            self.max_recorded = self.size;
        }
        self.queue.push_back(data);
        EnqueueDecision::Enqueued
    }

    /// 队首分片（引用计数克隆）。
    pub(crate) fn front(&self) -> Option<Bytes> {
        self.queue.front().cloned()
    }

    /// 弹出已写完的队首分片；返回是否发生低水位回落（需触发 LOWWAT）。
    pub(crate) fn complete_front(&mut self) -> bool {
        if let Some(front) = self.queue.pop_front() {
            self.size -= front.len();
        }
        if self.hiwat_signaled && self.size <= self.low {
            self.hiwat_signaled = false;
            true
        } else {
            false
        }
    }

    /// 关闭并清空缓存；返回是否有数据被丢弃。
    pub(crate) fn discard_and_close(&mut self) -> bool {
        self.closed = true;
        let had_pending = self.size > 0;
        self.queue.clear();
        self.size = 0;
        had_pending
    }

    /// 调整水位线；若当前体量已在新高水位之上且尚未告警，置闩并指示
    /// 触发 HIWAT（对齐“调低高水位立即告警”的原语义）。
    pub(crate) fn set_watermarks(&mut self, low: usize, hi: usize) -> bool {
        self.low = low;
        self.hi = hi;
        if self.size > self.hi && !self.hiwat_signaled {
            self.hiwat_signaled = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn watermarks(&self) -> (usize, usize) {
        (self.low, self.hi)
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn max_recorded(&self) -> usize {
        self.max_recorded
    }

    /// 把历史峰值重置为当前体量，返回重置前的峰值。
    pub(crate) fn reset_max_recorded(&mut self) -> usize {
        let previous = self.max_recorded;
        self.max_recorded = self.size;
        previous
    }
}

/// 单条通道的完整记录。目录（`DashMap`）是唯一所有者。
pub(crate) struct Channel {
    id: ChannelId,
    origin: ChannelOrigin,
    manager_index: usize,
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    half_open: HalfOpenPolicy,
    context: Mutex<Option<ChannelContext>>,
    cache: Mutex<WriteCache>,
    /// 写循环的唤醒器：入队后点亮。
    write_wake: Notify,
    /// 读/写循环的定向退出信号（半开关闭时只打断对应一侧）。
    read_abort: Notify,
    write_abort: Notify,
    /// 整体关闭广播。
    closed_tx: watch::Sender<bool>,
    read_enabled_tx: watch::Sender<bool>,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
    down_fired: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    bytes_requested: AtomicU64,
    created_at: Instant,
}

impl Channel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ChannelId,
        origin: ChannelOrigin,
        manager_index: usize,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        half_open: HalfOpenPolicy,
        low_watermark: usize,
        hi_watermark: usize,
        enable_read: bool,
        created_at: Instant,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let (read_enabled_tx, _) = watch::channel(enable_read);
        Self {
            id,
            origin,
            manager_index,
            stream,
            local_addr,
            peer_addr,
            half_open,
            context: Mutex::new(None),
            cache: Mutex::new(WriteCache::new(low_watermark, hi_watermark)),
            write_wake: Notify::new(),
            read_abort: Notify::new(),
            write_abort: Notify::new(),
            closed_tx,
            read_enabled_tx,
            read_closed: AtomicBool::new(false),
            write_closed: AtomicBool::new(false),
            down_fired: AtomicBool::new(false),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_requested: AtomicU64::new(0),
            created_at,
        }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn origin(&self) -> ChannelOrigin {
        self.origin
    }

    pub(crate) fn manager_index(&self) -> usize {
        self.manager_index
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn half_open(&self) -> HalfOpenPolicy {
        self.half_open
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn context(&self) -> Option<ChannelContext> {
        self.context.lock().expect("channel context poisoned").clone()
    }

    pub(crate) fn set_context(&self, context: Option<ChannelContext>) {
        *self.context.lock().expect("channel context poisoned") = context;
    }

    /// 写入口：入队裁决 + 计数 + 唤醒写循环。
    ///
    /// 返回 `(结果, 是否需要触发 HIWAT 事件)`；事件由调用方派发到通道
    /// 所属的管理器线程执行。
    pub(crate) fn enqueue_write(
        &self,
        data: Bytes,
        per_call: Option<usize>,
    ) -> (Result<(), PoolError>, bool) {
        let len = data.len();
        if len == 0 {
            return (Ok(()), false);
        }
        let decision = self
            .cache
            .lock()
            .expect("write cache poisoned")
            .enqueue(data, per_call);
        match decision {
            EnqueueDecision::Enqueued => {
                self.bytes_requested.fetch_add(len as u64, Ordering::Relaxed);
                self.write_wake.notify_one();
                (Ok(()), false)
            }
            EnqueueDecision::RejectedHiwatSignal => (
                Err(PoolError::WriteCacheHighWater { channel_id: self.id }),
                true,
            ),
            EnqueueDecision::RejectedHiwat => (
                Err(PoolError::WriteCacheHighWater { channel_id: self.id }),
                false,
            ),
            EnqueueDecision::RejectedPerCall => (
                Err(PoolError::EnqueueWatermarkExceeded { channel_id: self.id }),
                false,
            ),
            EnqueueDecision::RejectedClosed => (
                Err(PoolError::WriteSideClosed { channel_id: self.id }),
                false,
            ),
        }
    }

    pub(crate) fn front_chunk(&self) -> Option<Bytes> {
        self.cache.lock().expect("write cache poisoned").front()
    }

    pub(crate) fn complete_front(&self) -> bool {
        self.cache
            .lock()
            .expect("write cache poisoned")
            .complete_front()
    }

    pub(crate) fn discard_pending_writes(&self) -> bool {
        self.cache
            .lock()
            .expect("write cache poisoned")
            .discard_and_close()
    }

    pub(crate) fn set_watermarks(&self, low: usize, hi: usize) -> bool {
        self.cache
            .lock()
            .expect("write cache poisoned")
            .set_watermarks(low, hi)
    }

    pub(crate) fn watermarks(&self) -> (usize, usize) {
        self.cache.lock().expect("write cache poisoned").watermarks()
    }

    pub(crate) fn write_cache_size(&self) -> usize {
        self.cache.lock().expect("write cache poisoned").size()
    }

    pub(crate) fn recorded_max_write_cache_size(&self) -> usize {
        self.cache
            .lock()
            .expect("write cache poisoned")
            .max_recorded()
    }

    pub(crate) fn reset_recorded_max_write_cache_size(&self) -> usize {
        self.cache
            .lock()
            .expect("write cache poisoned")
            .reset_max_recorded()
    }

    pub(crate) fn note_bytes_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn note_bytes_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_requested(&self) -> u64 {
        self.bytes_requested.load(Ordering::Relaxed)
    }

    /// 标记读半部关闭；返回 `true` 表示本次调用完成了状态翻转。
    pub(crate) fn mark_read_closed(&self) -> bool {
        !self.read_closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_write_closed(&self) -> bool {
        !self.write_closed.swap(true, Ordering::SeqCst)
    }

    /// 标记整体关闭；返回 `true` 表示 CHANNEL_DOWN 应由本次调用触发。
    pub(crate) fn mark_down(&self) -> bool {
        !self.down_fired.swap(true, Ordering::SeqCst)
    }

    /// 通道是否已整体关闭（可能仍在目录中等待回收）。
    pub(crate) fn is_down(&self) -> bool {
        self.down_fired.load(Ordering::SeqCst)
    }

    pub(crate) fn is_read_closed(&self) -> bool {
        self.read_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_write_closed(&self) -> bool {
        self.write_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn abort_read_loop(&self) {
        self.read_abort.notify_one();
    }

    pub(crate) fn abort_write_loop(&self) {
        self.write_abort.notify_one();
    }

    pub(crate) fn broadcast_closed(&self) {
        let _ = self.closed_tx.send_replace(true);
    }

    pub(crate) fn closed_rx(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub(crate) fn read_enabled_rx(&self) -> watch::Receiver<bool> {
        self.read_enabled_tx.subscribe()
    }

    pub(crate) fn read_enabled(&self) -> bool {
        *self.read_enabled_tx.borrow()
    }

    pub(crate) fn set_read_enabled(&self, enabled: bool) {
        let _ = self.read_enabled_tx.send_replace(enabled);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer_addr)
            .field("manager", &self.manager_index)
            .finish()
    }
}

/// 读循环：驻留在通道所属管理器的运行时上。
pub(crate) async fn read_loop(shared: Arc<PoolShared>, channel: Arc<Channel>) {
    let mut enabled_rx = channel.read_enabled_rx();
    let mut closed_rx = channel.closed_rx();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    // 数据回调的投递阈值：缓冲至少达到该长度才再次回调。
    let mut threshold: usize = 1;
    let mut enabled = *enabled_rx.borrow();
    let read_timeout = shared.config.read_timeout();

    loop {
        if channel.is_read_closed() || *closed_rx.borrow() {
            break;
        }
        if !enabled {
            tokio::select! {
                changed = enabled_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *enabled_rx.borrow() {
                        enabled = true;
                        shared.fire_channel_event(&channel, ChannelState::AutoReadEnabled);
                    }
                }
                _ = closed_rx.changed() => break,
                _ = channel.read_abort.notified() => break,
            }
            continue;
        }
        // 不变量：try_read_buf 无剩余容量时返回 Ok(0)，与 EOF 同形。
        buf.reserve(READ_CHUNK);
        tokio::select! {
            ready = channel.stream.readable() => {
                if let Err(err) = ready {
                    shared.on_io_error(&channel, "await readability", err);
                    break;
                }
                match channel.stream.try_read_buf(&mut buf) {
                    Ok(0) => {
                        // 对端 EOF：目录记录保留，等待调用方以 shutdown 回收。
                        shared.on_read_closed(&channel, false);
                        break;
                    }
                    Ok(n) => {
                        channel.note_bytes_read(n);
                        if buf.len() >= threshold {
                            let context = channel.context();
                            let needed = (shared.data_cb)(&mut buf, channel.id(), context);
                            threshold = buf.len() + if needed == 0 { 1 } else { needed };
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        shared.on_io_error(&channel, "read", err);
                        break;
                    }
                }
            }
            changed = enabled_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if !*enabled_rx.borrow() {
                    enabled = false;
                    shared.fire_channel_event(&channel, ChannelState::AutoReadDisabled);
                }
            }
            _ = closed_rx.changed() => break,
            _ = channel.read_abort.notified() => break,
            _ = crate::util::optional_sleep(shared.clock.as_ref(), read_timeout) => {
                shared.fire_channel_event(&channel, ChannelState::ReadTimeout);
            }
        }
    }
}

/// 写循环：按入队顺序整块排空写缓存。
pub(crate) async fn write_loop(shared: Arc<PoolShared>, channel: Arc<Channel>) {
    let mut closed_rx = channel.closed_rx();
    loop {
        if channel.is_write_closed() || *closed_rx.borrow() {
            break;
        }
        let Some(chunk) = channel.front_chunk() else {
            tokio::select! {
                _ = channel.write_wake.notified() => {}
                _ = channel.write_abort.notified() => break,
                _ = closed_rx.changed() => break,
            }
            continue;
        };
        let mut offset = 0usize;
        while offset < chunk.len() {
            tokio::select! {
                ready = channel.stream.writable() => {
                    if let Err(err) = ready {
                        shared.on_io_error(&channel, "await writability", err);
                        return;
                    }
                    match channel.stream.try_write(&chunk[offset..]) {
                        Ok(n) => {
                            offset += n;
                            channel.note_bytes_written(n);
                        }
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                        Err(err) => {
                            shared.on_io_error(&channel, "write", err);
                            return;
                        }
                    }
                }
                _ = channel.write_abort.notified() => return,
                _ = closed_rx.changed() => return,
            }
        }
        if channel.complete_front() {
            shared.fire_channel_event(&channel, ChannelState::WriteCacheLowwat);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(low: usize, hi: usize) -> WriteCache {
        WriteCache::new(low, hi)
    }

    #[test]
    fn hiwat_fires_once_per_crossing() {
        let mut cache = cache(2, 8);
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"123456"), None),
            EnqueueDecision::Enqueued
        );
        // 首次越线：拒绝并指示触发 HIWAT。
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"xxxx"), None),
            EnqueueDecision::RejectedHiwatSignal
        );
        // 仍然饱和：仅拒绝，不得重复告警。
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"xxxx"), None),
            EnqueueDecision::RejectedHiwat
        );
    }

    #[test]
    fn lowwat_fires_once_after_drain() {
        let mut cache = cache(2, 8);
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"123456"), None),
            EnqueueDecision::Enqueued
        );
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"xxxx"), None),
            EnqueueDecision::RejectedHiwatSignal
        );
        // 排空至 0 <= low：闩锁复位，指示触发 LOWWAT。
        assert!(cache.complete_front());
        // 再次排空（空队列）不得重复告警。
        assert!(!cache.complete_front());
        // 闩锁复位后可再次入队、再次越线。
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"123456"), None),
            EnqueueDecision::Enqueued
        );
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"xxxx"), None),
            EnqueueDecision::RejectedHiwatSignal
        );
    }

    #[test]
    fn drain_without_prior_hiwat_is_silent() {
        let mut cache = cache(0, 64);
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"hello"), None),
            EnqueueDecision::Enqueued
        );
        assert!(!cache.complete_front());
    }

    #[test]
    fn per_call_watermark_rejects_without_event() {
        let mut cache = cache(0, 64);
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"0123456789"), None),
            EnqueueDecision::Enqueued
        );
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"abcdef"), Some(12)),
            EnqueueDecision::RejectedPerCall
        );
        // 高水位判定优先于本次入队水位。
        let mut tight = WriteCache::new(0, 4);
        assert_eq!(
            tight.enqueue(Bytes::from_static(b"abcdef"), Some(2)),
            EnqueueDecision::RejectedHiwatSignal
        );
    }

    #[test]
    fn closed_cache_rejects_everything() {
        let mut cache = cache(0, 64);
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"pending"), None),
            EnqueueDecision::Enqueued
        );
        assert!(cache.discard_and_close());
        assert_eq!(cache.size(), 0);
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"late"), None),
            EnqueueDecision::RejectedClosed
        );
    }

    #[test]
    fn lowering_hi_watermark_below_size_latches_hiwat() {
        let mut cache = cache(0, 64);
        assert_eq!(
            cache.enqueue(Bytes::from_static(b"0123456789"), None),
            EnqueueDecision::Enqueued
        );
        assert!(cache.set_watermarks(0, 4), "调低高水位应立即告警");
        assert!(!cache.set_watermarks(0, 2), "闩锁置位期间不得重复告警");
    }

    #[test]
    fn max_recorded_tracks_peak_and_resets_to_current() {
        let mut cache = cache(0, 64);
        let _ = cache.enqueue(Bytes::from_static(b"0123456789"), None);
        let _ = cache.enqueue(Bytes::from_static(b"abcd"), None);
        assert_eq!(cache.max_recorded(), 14);
        assert!(!cache.complete_front());
        assert_eq!(cache.size(), 4);
        assert_eq!(cache.reset_max_recorded(), 14);
        assert_eq!(cache.max_recorded(), 4);
    }
}
