//! 集成测试公共设施：事件记录器与轮询等待。
//!
//! # 设计意图（Why）
//! - 回调是池的事实来源，测试以记录器把事件流固化为可断言的序列；
//! - 对端一律使用阻塞的 `std::net` 套接字，由测试线程直接驱动，避免在
//!   测试里再叠一个异步运行时。

#![allow(dead_code)]

use bytes::BytesMut;
use conflux_pool::{
    ChannelId, ChannelState, ChannelStateCallback, DataReadCallback, PoolState, PoolStateCallback,
    Severity,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// 回调事件的集中记录器。
#[derive(Default)]
pub struct EventLog {
    pub channel_events: Mutex<Vec<(ChannelId, u64, ChannelState)>>,
    pub pool_events: Mutex<Vec<(PoolState, u64, Severity)>>,
    pub data: Mutex<Vec<u8>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn channel_event_count(&self, state: ChannelState) -> usize {
        self.channel_events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, s)| *s == state)
            .count()
    }

    pub fn pool_event_count(&self, state: PoolState) -> usize {
        self.pool_events
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| *s == state)
            .count()
    }

    /// 按发生顺序返回全部 `ChannelUp` 的 (通道, 关联 id)。
    pub fn channel_ups(&self) -> Vec<(ChannelId, u64)> {
        self.channel_events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, s)| *s == ChannelState::ChannelUp)
            .map(|(id, endpoint, _)| (*id, *endpoint))
            .collect()
    }

    pub fn first_channel_up(&self) -> Option<(ChannelId, u64)> {
        self.channel_ups().first().copied()
    }

    pub fn data_len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn data_snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

/// 通道状态回调：原样落账。
pub fn channel_cb(log: &Arc<EventLog>) -> ChannelStateCallback {
    let log = Arc::clone(log);
    Arc::new(move |id, endpoint, state, _context| {
        log.channel_events.lock().unwrap().push((id, endpoint, state));
    })
}

/// 数据回调：消费全部字节并落账，返回 0（有新数据即可再次回调）。
pub fn consume_all_data_cb(log: &Arc<EventLog>) -> DataReadCallback {
    let log = Arc::clone(log);
    Arc::new(move |buf: &mut BytesMut, _id, _context| {
        let bytes = buf.split_to(buf.len());
        log.data.lock().unwrap().extend_from_slice(&bytes);
        0
    })
}

/// 池状态回调：原样落账。
pub fn pool_cb(log: &Arc<EventLog>) -> PoolStateCallback {
    let log = Arc::clone(log);
    Arc::new(move |state, endpoint, severity| {
        log.pool_events.lock().unwrap().push((state, endpoint, severity));
    })
}

/// 以 10ms 步长轮询断言条件，超时后返回最后一次判定结果。
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

/// 给异步路径一个追平的窗口（用于“不应再有事件”类断言前的静置）。
pub fn settle(duration: Duration) {
    std::thread::sleep(duration);
}
