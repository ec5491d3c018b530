//! 连接器语义的集成测试：尝试耗尽、重复 source id、顺序复用与
//! 虚拟时钟下的间隔节律。

mod common;

use common::{EventLog, channel_cb, consume_all_data_cb, pool_cb, settle, wait_until};
use conflux_pool::{
    ChannelPool, ChannelPoolConfig, ChannelState, ConnectOptions, MockClock, PoolError, PoolState,
};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

fn make_pool(log: &Arc<EventLog>, config: ChannelPoolConfig) -> ChannelPool {
    ChannelPool::new(
        config,
        channel_cb(log),
        consume_all_data_cb(log),
        pool_cb(log),
    )
}

/// 占一个端口并立即释放：得到一个大概率无人监听的回环地址。
fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[test]
fn connect_validates_preconditions_without_side_effects() {
    let log = EventLog::new();
    let pool = make_pool(&log, ChannelPoolConfig::default());
    pool.start().unwrap();

    let addr = refused_addr();
    assert!(matches!(
        pool.connect(addr, 0, Duration::from_millis(10), 1, ConnectOptions::new()),
        Err(PoolError::InvalidArgument { .. })
    ));
    assert!(matches!(
        pool.connect(addr, 2, Duration::ZERO, 1, ConnectOptions::new()),
        Err(PoolError::InvalidArgument { .. })
    ));
    settle(Duration::from_millis(100));
    // 前置条件违例：无副作用、无回调。
    assert_eq!(log.pool_events.lock().unwrap().len(), 0);
    assert_eq!(log.channel_events.lock().unwrap().len(), 0);

    pool.stop().unwrap();
}

#[test]
fn exhausted_attempts_fire_one_alert_each_and_no_channel_up() {
    let log = EventLog::new();
    let pool = make_pool(&log, ChannelPoolConfig::default());
    pool.start().unwrap();

    let addr = refused_addr();
    pool.connect(addr, 3, Duration::from_millis(100), 9, ConnectOptions::new())
        .expect("connect accepted");

    // 3 次尝试，每次一条 ERROR_CONNECTING，时间与 3*interval 同量级。
    assert!(
        wait_until(Duration::from_secs(5), || {
            log.pool_event_count(PoolState::ErrorConnecting) == 3
        }),
        "尝试耗尽应产生恰好 3 条 ErrorConnecting"
    );
    settle(Duration::from_millis(300));
    assert_eq!(log.pool_event_count(PoolState::ErrorConnecting), 3);
    assert_eq!(log.channel_event_count(ChannelState::ChannelUp), 0);
    assert!(
        log.pool_events
            .lock()
            .unwrap()
            .iter()
            .filter(|(state, _, _)| *state == PoolState::ErrorConnecting)
            .all(|(_, endpoint, severity)| *endpoint == 9
                && *severity == conflux_pool::Severity::Alert),
        "告警应携带 source id 与 ALERT 级别"
    );

    pool.stop().unwrap();
}

#[test]
fn duplicate_source_id_is_a_retryable_conflict() {
    let log = EventLog::new();
    let pool = make_pool(&log, ChannelPoolConfig::default());
    pool.start().unwrap();

    let addr = refused_addr();
    pool.connect(addr, 20, Duration::from_millis(200), 5, ConnectOptions::new())
        .expect("first connect accepted");

    // 在途冲突：返回可重试错误，不产生新状态、不产生回调。
    let events_before = log.pool_events.lock().unwrap().len();
    let err = pool
        .connect(addr, 3, Duration::from_millis(100), 5, ConnectOptions::new())
        .unwrap_err();
    assert!(matches!(err, PoolError::DuplicateSourceId { source_id: 5 }));
    assert!(err.is_retryable());
    settle(Duration::from_millis(50));
    // 冲突调用本身不追加任何池事件（在途序列照常推进）。
    assert!(log.pool_events.lock().unwrap().len() >= events_before);

    // 不同 source id 不受影响。
    pool.connect(addr, 1, Duration::from_millis(100), 6, ConnectOptions::new())
        .expect("other source id accepted");

    pool.stop().unwrap();
}

#[test]
fn source_id_is_reusable_after_sequence_completes() {
    let log = EventLog::new();
    let pool = make_pool(&log, ChannelPoolConfig::default());
    pool.start().unwrap();

    let addr = refused_addr();
    pool.connect(addr, 2, Duration::from_millis(80), 12, ConnectOptions::new())
        .expect("first sequence");
    assert!(wait_until(Duration::from_secs(5), || {
        log.pool_event_count(PoolState::ErrorConnecting) == 2
    }));

    // 序列耗尽后，同一 source id 的新序列被受理，并能成功建连。
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let live_addr = listener.local_addr().unwrap();
    pool.connect(live_addr, 1, Duration::ZERO, 12, ConnectOptions::new())
        .expect("source id reusable after exhaustion");
    let (_peer, _) = listener.accept().expect("pool dials in");
    assert!(
        wait_until(Duration::from_secs(5), || {
            log.channel_ups().iter().any(|(_, endpoint)| *endpoint == 12)
        }),
        "第二个序列应以 ChannelUp 收场"
    );

    pool.stop().unwrap();
}

#[test]
fn attempt_interval_is_paced_by_the_injected_clock() {
    let log = EventLog::new();
    let clock = Arc::new(MockClock::new());
    let pool = ChannelPool::with_clock(
        ChannelPoolConfig::default(),
        channel_cb(&log),
        consume_all_data_cb(&log),
        pool_cb(&log),
        clock.clone(),
    );
    pool.start().unwrap();

    let addr = refused_addr();
    pool.connect(addr, 3, Duration::from_secs(60), 33, ConnectOptions::new())
        .expect("connect accepted");

    // 第 1 次尝试失败后，序列睡在虚拟时钟上。
    assert!(wait_until(Duration::from_secs(5), || {
        log.pool_event_count(PoolState::ErrorConnecting) == 1
    }));
    assert!(
        wait_until(Duration::from_secs(5), || clock.pending_sleepers() >= 1),
        "重试间隔应登记在注入的时钟上"
    );
    settle(Duration::from_millis(200));
    assert_eq!(
        log.pool_event_count(PoolState::ErrorConnecting),
        1,
        "虚拟时间未推进前不得开始下一次尝试"
    );

    // 推进一个间隔：恰好多一次尝试。
    clock.advance(Duration::from_secs(60));
    assert!(wait_until(Duration::from_secs(5), || {
        log.pool_event_count(PoolState::ErrorConnecting) == 2
    }));

    assert!(wait_until(Duration::from_secs(5), || clock.pending_sleepers() >= 1));
    clock.advance(Duration::from_secs(60));
    assert!(wait_until(Duration::from_secs(5), || {
        log.pool_event_count(PoolState::ErrorConnecting) == 3
    }));
    settle(Duration::from_millis(200));
    assert_eq!(log.pool_event_count(PoolState::ErrorConnecting), 3);

    pool.stop().unwrap();
}
