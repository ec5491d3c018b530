//! 事件管理器：一条 OS 线程 + 一个 current_thread Tokio 运行时。
//!
//! ## 核心意图（Why）
//! - 池的并发模型是“N 条相互独立的就绪多路复用循环”，通道一经指派便
//!   终生钉在同一条循环上；current_thread 运行时恰好给出这种形态——
//!   reactor、定时器与任务队列都归属单一线程，跨线程仅暴露 `Handle`
//!   用于投递任务；
//! - 回调因此天然地在产生事件的管理器线程上同步执行，库不再需要任何
//!   跨线程的回调串行化设施。
//!
//! ## 行为契约（What）
//! - [`EventManager::start`]：派生线程并阻塞等待运行时句柄就绪；
//! - [`EventManager::spawn`]：从任意线程向该管理器投递任务；启用时间
//!   指标时任务会经 [`Instrumented`](crate::metrics::Instrumented) 包装
//!   记账；
//! - [`EventManager::stop`]：要求线程退出并在宽限期内等待汇合；超时
//!   返回 `false`，线程被弃管（其运行时与任务随线程终止被取消）。
//!
//! ## 风险提示（Trade-offs）
//! - 用户回调若长期阻塞，将拖住该管理器的整个就绪循环，也会使 `stop`
//!   的汇合超时；这是回调契约中明示的调用方义务。

use crate::metrics::{Instrumented, TimeMetrics};
use conflux_core::PoolError;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 单个事件管理器线程的句柄与账目。
pub(crate) struct EventManager {
    index: usize,
    handle: Handle,
    shutdown: Arc<Notify>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    exited: Mutex<Option<mpsc::Receiver<()>>>,
    time_metrics: Arc<TimeMetrics>,
    collect_time_metrics: bool,
    load: AtomicUsize,
}

impl EventManager {
    /// 派生管理器线程并等待其运行时句柄就绪。
    ///
    /// # 执行步骤（How）
    /// 1. 线程内构建 `current_thread` 运行时（启用 IO 与定时器驱动）；
    /// 2. 把 `Handle` 经同步通道送回调用方；
    /// 3. `block_on` 停机信号；收到后丢弃运行时（取消剩余任务）并上报
    ///    线程退出。
    pub(crate) fn start(index: usize, collect_time_metrics: bool) -> Result<Self, PoolError> {
        let shutdown = Arc::new(Notify::new());
        let (handle_tx, handle_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();

        let thread_shutdown = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name(format!("conflux-manager-{index}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .enable_time()
                    .build();
                let runtime = match runtime {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = handle_tx.send(Err(err));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    thread_shutdown.notified().await;
                });
                debug!(manager = index, "event manager loop exited");
                // 运行时在此处析构，尚未完成的任务一并取消。
                drop(runtime);
                let _ = exit_tx.send(());
            })
            .map_err(|err| PoolError::Io {
                op: "spawn event manager thread",
                source: err,
            })?;

        let handle = match handle_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(PoolError::Io {
                    op: "build event manager runtime",
                    source: err,
                });
            }
            Err(_) => {
                let _ = thread.join();
                return Err(PoolError::Io {
                    op: "build event manager runtime",
                    source: std::io::Error::other("manager thread exited before handshake"),
                });
            }
        };

        Ok(Self {
            index,
            handle,
            shutdown,
            thread: Mutex::new(Some(thread)),
            exited: Mutex::new(Some(exit_rx)),
            time_metrics: Arc::new(TimeMetrics::new()),
            collect_time_metrics,
            load: AtomicUsize::new(0),
        })
    }

    /// 管理器序号，用于日志与通道记录。
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// 向本管理器投递任务。可从任意线程调用。
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let metrics = self
            .collect_time_metrics
            .then(|| Arc::clone(&self.time_metrics));
        self.handle.spawn(Instrumented::new(future, metrics))
    }

    /// 忙闲采样状态，由池级采样任务定期结算。
    pub(crate) fn time_metrics(&self) -> Arc<TimeMetrics> {
        Arc::clone(&self.time_metrics)
    }

    /// 最近完成窗口的忙碌百分比。
    pub(crate) fn percentage(&self) -> u32 {
        self.time_metrics.percentage()
    }

    /// 登记一个归属本管理器的实体（通道/监听器/连接器/时钟）。
    pub(crate) fn register_entity(&self) {
        self.load.fetch_add(1, Ordering::Relaxed);
    }

    /// 注销一个实体。
    pub(crate) fn unregister_entity(&self) {
        // saturating：目录清空路径与任务自清理可能竞争，计数不得下穿。
        let _ = self
            .load
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                v.checked_sub(1)
            });
    }

    /// 当前登记的实体数，时间指标关闭时的指派依据。
    pub(crate) fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// 请求停机并在宽限期内等待线程汇合。
    ///
    /// # 契约说明（What）
    /// - 返回 `true` 表示线程已退出并完成汇合；
    /// - 返回 `false` 表示宽限期耗尽，线程被弃管——其任务已随停机信号
    ///   进入取消流程，但无法保证何时真正终止；
    /// - 幂等：重复调用直接返回上一次的汇合结果语义（线程已不在则视为
    ///   已汇合）。
    pub(crate) fn stop(&self, grace: Duration) -> bool {
        self.shutdown.notify_one();
        let receiver = self.exited.lock().expect("manager exit slot").take();
        if let Some(receiver) = receiver
            && receiver.recv_timeout(grace).is_err()
        {
            warn!(
                manager = self.index,
                "event manager failed to exit within grace period"
            );
            // 弃管：丢弃 JoinHandle，后续调用不得再阻塞在 join 上。
            drop(self.thread.lock().expect("manager thread slot").take());
            return false;
        }
        if let Some(thread) = self.thread.lock().expect("manager thread slot").take() {
            // 线程已经上报退出（或从未上报但句柄已取走），join 不会久等。
            let _ = thread.join();
        }
        true
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("index", &self.index)
            .field("load", &self.load())
            .field("percentage", &self.percentage())
            .finish()
    }
}
