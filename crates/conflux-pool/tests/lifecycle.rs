//! 生命周期与目录语义的集成测试：启动/停止、监听与关闭、ID 唯一性、
//! 对已死 ID 的引用语义。

mod common;

use common::{EventLog, channel_cb, consume_all_data_cb, pool_cb, wait_until};
use conflux_pool::{
    ChannelId, ChannelPool, ChannelPoolConfig, ChannelState, ListenOptions, PoolError,
};
use std::collections::HashSet;
use std::io::Write as _;
use std::net::TcpStream;
use std::time::Duration;

fn make_pool(log: &std::sync::Arc<EventLog>, config: ChannelPoolConfig) -> ChannelPool {
    ChannelPool::new(
        config,
        channel_cb(log),
        consume_all_data_cb(log),
        pool_cb(log),
    )
}

#[test]
fn start_is_exclusive_and_stop_is_terminal() {
    let log = EventLog::new();
    let pool = make_pool(&log, ChannelPoolConfig::default());

    // 未启动时操作被拒绝。
    assert!(matches!(
        pool.listen("127.0.0.1:0".parse().unwrap(), 1, ListenOptions::new()),
        Err(PoolError::NotRunning)
    ));

    pool.start().expect("first start succeeds");
    assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted)));
    assert_eq!(pool.num_threads(), 1);

    pool.stop().expect("stop succeeds");
    assert!(matches!(pool.stop(), Err(PoolError::NotRunning)));
    assert_eq!(pool.num_threads(), 0);
}

#[test]
fn listener_ids_conflict_while_active_and_are_reusable_after_close() {
    let log = EventLog::new();
    let pool = make_pool(&log, ChannelPoolConfig::default());
    pool.start().unwrap();

    let addr = pool
        .listen("127.0.0.1:0".parse().unwrap(), 7, ListenOptions::new())
        .expect("listen");
    assert_ne!(addr.port(), 0, "应返回内核实际分配的端口");
    assert_eq!(pool.server_address(7).unwrap(), addr);

    // 在途冲突：同一 server id 被拒绝，且属于可重试类别。
    let err = pool
        .listen("127.0.0.1:0".parse().unwrap(), 7, ListenOptions::new())
        .unwrap_err();
    assert!(matches!(err, PoolError::DuplicateServerId { server_id: 7 }));
    assert!(err.is_retryable());

    assert!(matches!(
        pool.close(8),
        Err(PoolError::UnknownServer { server_id: 8 })
    ));
    pool.close(7).expect("close listener");

    // 顺序复用：操作完结后同一 id 可再次使用。
    pool.listen("127.0.0.1:0".parse().unwrap(), 7, ListenOptions::new())
        .expect("server id reusable after close");

    pool.stop().unwrap();
}

#[test]
fn channel_ids_are_unique_and_dead_ids_are_errors() {
    let log = EventLog::new();
    let pool = make_pool(&log, ChannelPoolConfig::default());
    pool.start().unwrap();

    let addr = pool
        .listen("127.0.0.1:0".parse().unwrap(), 40, ListenOptions::new())
        .unwrap();

    // 从未存在过的 ID 也是错误，而非静默忽略。
    assert!(matches!(
        pool.write(ChannelId::from_raw(9_999), bytes::Bytes::from_static(b"x"), None),
        Err(PoolError::UnknownChannel { .. })
    ));

    let mut peers = Vec::new();
    for _ in 0..4 {
        let mut peer = TcpStream::connect(addr).expect("peer connect");
        peer.write_all(b"ping").unwrap();
        peers.push(peer);
    }
    assert!(
        wait_until(Duration::from_secs(5), || log.channel_ups().len() == 4),
        "四条入站连接都应触发 ChannelUp"
    );

    let ups = log.channel_ups();
    let distinct: HashSet<u64> = ups.iter().map(|(id, _)| id.as_u64()).collect();
    assert_eq!(distinct.len(), 4, "通道 ID 两两不同");
    assert!(ups.iter().all(|(_, endpoint)| *endpoint == 40));
    assert_eq!(pool.num_channels(), 4);

    // 关闭其中一条后，对已死 ID 的任何引用都是 UnknownChannel。
    let (victim, _) = ups[0];
    pool.shutdown(victim, conflux_pool::ShutdownDirection::Both)
        .expect("shutdown accepted channel");
    assert!(
        wait_until(Duration::from_secs(5), || pool.num_channels() == 3),
        "目录应移除已关闭的通道"
    );
    assert!(wait_until(Duration::from_secs(5), || {
        log.channel_event_count(ChannelState::ChannelDown) == 1
    }));
    assert!(matches!(
        pool.shutdown(victim, conflux_pool::ShutdownDirection::Both),
        Err(PoolError::UnknownChannel { .. })
    ));
    assert!(matches!(
        pool.write(victim, bytes::Bytes::from_static(b"late"), None),
        Err(PoolError::UnknownChannel { .. })
    ));

    pool.stop().unwrap();
}

#[test]
fn stop_and_remove_all_channels_keeps_pool_running() {
    let log = EventLog::new();
    let pool = make_pool(&log, ChannelPoolConfig::default());
    pool.start().unwrap();

    let addr = pool
        .listen("127.0.0.1:0".parse().unwrap(), 3, ListenOptions::new())
        .unwrap();
    let _peer = TcpStream::connect(addr).expect("peer connect");
    assert!(wait_until(Duration::from_secs(5), || pool.num_channels() == 1));

    pool.stop_and_remove_all_channels()
        .expect("mass removal while running");
    assert_eq!(pool.num_channels(), 0);
    // 静默移除：不产生 ChannelDown。
    assert_eq!(log.channel_event_count(ChannelState::ChannelDown), 0);

    // 池仍在运行：监听器保留，新连接继续被接受。
    let _peer2 = TcpStream::connect(addr).expect("listener survives");
    assert!(
        wait_until(Duration::from_secs(5), || pool.num_channels() == 1),
        "移除后池仍应接受新连接"
    );

    pool.stop().unwrap();
}
