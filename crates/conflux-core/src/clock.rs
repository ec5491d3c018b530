//! 可注入时钟：统一“取当前时间”与“等待一段时间”两种能力。
//!
//! # 设计背景（Why）
//! - 接受退避、连接间隔、空闲/读超时与注册时钟全部依赖时间源；若实现层
//!   直接调用运行时的 sleep，这些策略在 CI 中将无法确定性复现；
//! - 通过 `Arc<dyn Clock>` 注入，生产环境走真实时间（实现层提供基于
//!   Tokio 的时钟），测试注入 [`MockClock`] 手动推进。
//!
//! # 接口约束（What）
//! - `now` 单调递增；`sleep` 返回的 Future 完成前至少等待所给时长；
//! - `sleep` Future 若在完成前被丢弃，必须从调度队列中摘除，不得唤醒
//!   已经释放的 waker。
//!
//! # 使用指引（How）
//! - 测试中以 [`MockClock::advance`] 推进虚拟时间；到期的睡眠 Future 按
//!   登记顺序被唤醒，保证断言序列可复现。

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// 时钟接口统一返回的睡眠 Future 形态。
///
/// 以 `Pin<Box<dyn Future>>` 抹平具体实现，满足对象安全与跨任务存活。
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 可注入的时间源。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;

    /// 返回一个在指定时长后完成的睡眠 Future。
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// 虚拟时钟：手动推进时间，在测试中复现确定性的唤醒序列。
///
/// # 教案式注释
/// - **意图 (Why)**：退避序列、尝试间隔等属性必须在 CI 中 100% 可复现，
///   真实时间的抖动会使这类断言永远处于“偶发红”的状态；
/// - **逻辑 (How)**：内部维护自构造起的虚拟偏移量与待触发的睡眠登记表；
///   `advance` 增加偏移量并按登记顺序唤醒所有到期条目；
/// - **契约 (What)**：`sleep` 返回的 Future 未到期前返回 `Poll::Pending`
///   并登记最新 waker；提前丢弃则从登记表中摘除；
/// - **权衡 (Trade-offs)**：登记表用 `Vec` 线性扫描，测试规模下足够；
///   不适合作为生产时钟使用。
#[derive(Clone, Debug, Default)]
pub struct MockClock {
    inner: Arc<MockInner>,
}

#[derive(Debug)]
struct MockInner {
    state: Mutex<MockState>,
}

impl Default for MockInner {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                sleepers: Vec::new(),
                next_token: 0,
            }),
        }
    }
}

#[derive(Debug)]
struct MockState {
    origin: Instant,
    elapsed: Duration,
    sleepers: Vec<Arc<Sleeper>>,
    next_token: u64,
}

#[derive(Debug)]
struct Sleeper {
    token: u64,
    due: Duration,
    done: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl MockClock {
    /// 创建偏移量为零的虚拟时钟。
    pub fn new() -> Self {
        Self::default()
    }

    /// 推进虚拟时间，唤醒所有到期的睡眠 Future。
    ///
    /// # 契约说明（What）
    /// - 偏移量单调增加，`delta` 为零时直接返回；
    /// - 唤醒顺序与睡眠登记顺序一致，保证测试序列稳定。
    pub fn advance(&self, delta: Duration) {
        if delta.is_zero() {
            return;
        }
        let wakers = {
            let mut state = self.inner.state.lock().expect("mock clock state poisoned");
            state.elapsed = state.elapsed.saturating_add(delta);
            let elapsed = state.elapsed;
            let mut due = Vec::new();
            state.sleepers.retain(|sleeper| {
                if elapsed >= sleeper.due {
                    sleeper.done.store(true, Ordering::Release);
                    if let Some(waker) = sleeper.waker.lock().expect("sleeper waker").take() {
                        due.push(waker);
                    }
                    false
                } else {
                    true
                }
            });
            due
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// 返回自构造以来累计的虚拟时间。
    pub fn elapsed(&self) -> Duration {
        self.inner
            .state
            .lock()
            .expect("mock clock state poisoned")
            .elapsed
    }

    /// 当前尚未到期的睡眠登记数，供测试观察调度规模。
    pub fn pending_sleepers(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("mock clock state poisoned")
            .sleepers
            .len()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let state = self.inner.state.lock().expect("mock clock state poisoned");
        state.origin + state.elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let sleeper = {
            let mut state = self.inner.state.lock().expect("mock clock state poisoned");
            let due = state.elapsed.saturating_add(duration);
            let token = state.next_token;
            state.next_token += 1;
            let sleeper = Arc::new(Sleeper {
                token,
                due,
                done: AtomicBool::new(duration.is_zero()),
                waker: Mutex::new(None),
            });
            if !duration.is_zero() {
                state.sleepers.push(Arc::clone(&sleeper));
            }
            sleeper
        };
        Box::pin(MockSleep {
            inner: Arc::clone(&self.inner),
            sleeper,
        })
    }
}

struct MockSleep {
    inner: Arc<MockInner>,
    sleeper: Arc<Sleeper>,
}

impl Future for MockSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.sleeper.done.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        {
            let mut slot = self.sleeper.waker.lock().expect("sleeper waker");
            match slot.as_ref() {
                Some(existing) if existing.will_wake(cx.waker()) => {}
                _ => *slot = Some(cx.waker().clone()),
            }
        }
        // 登记 waker 与 advance 并发时可能正好跨过到期点，补查一次。
        if self.sleeper.done.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for MockSleep {
    fn drop(&mut self) {
        if !self.sleeper.done.load(Ordering::Acquire)
            && let Ok(mut state) = self.inner.state.lock()
        {
            let token = self.sleeper.token;
            state.sleepers.retain(|entry| entry.token != token);
        }
    }
}
