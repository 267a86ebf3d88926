//! 任务执行器：并发槽位 + 按队列键串行的 lane
//!
//! - 所有动作处理器共用一个 Semaphore 限定的槽位池
//! - 同一队列键的任务进入同一条 lane，严格按提交顺序逐个执行
//! - 不同队列键并发执行，直到槽位用尽
//! - 重试按次数上限、指数退避；重试只重新调用同一个闭包，不会再走准入
//! - 取消是协作式的：首次尝试前与两次尝试之间检查；处理器标记不可撤销后忽略取消

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::{RetrySection, RunnerSection};
use crate::core::AgentError;

/// 未给出队列键的任务共用的 lane
pub const GLOBAL_LANE: &str = "__global__";

/// 重试策略（max_attempts 含首次尝试）
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay_ms: section.base_delay_ms,
            max_delay_ms: section.max_delay_ms,
            multiplier: section.multiplier,
        }
    }
}

impl RetryPolicy {
    /// 只跑一次
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    pub fn attempts(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: base_delay_ms.saturating_mul(16),
            multiplier: 2.0,
        }
    }

    /// 第 attempt 次失败之后的等待时间
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32 - 1);
        let delay = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }
}

/// 单个任务的取消作用域：轮次取消令牌 + 不可撤销标记
#[derive(Debug, Clone)]
pub struct CancelScope {
    token: CancellationToken,
    irrevocable: Arc<AtomicBool>,
}

impl CancelScope {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            irrevocable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn mark_irrevocable(&self) {
        self.irrevocable.store(true, Ordering::SeqCst);
    }

    pub fn is_irrevocable(&self) -> bool {
        self.irrevocable.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn checkpoint(&self) -> Result<(), AgentError> {
        if self.is_cancelled() && !self.is_irrevocable() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }
}

/// 入队参数
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// 为空时使用执行器的默认策略
    pub retry: Option<RetryPolicy>,
    pub cancel: CancellationToken,
    /// 为空时进入全局 lane
    pub queue_key: Option<String>,
    /// 日志用标签（通常是动作名）
    pub label: String,
}

/// 任务终态：结果、实际尝试次数、耗时（含排队）
#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub result: Result<T, AgentError>,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// 入队后拿到的句柄
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<TaskOutcome<T>>,
    enqueued_at: Instant,
}

impl<T> TaskHandle<T> {
    /// 等待任务结束；worker 异常退出时也返回错误而不是悬挂
    pub async fn join(self) -> TaskOutcome<T> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome {
                result: Err(AgentError::TaskRunner {
                    attempts: 0,
                    message: "task dropped before completion".to_string(),
                }),
                attempts: 0,
                elapsed: self.enqueued_at.elapsed(),
            },
        }
    }
}

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// 任务执行器；clone 共享同一组槽位与 lane
#[derive(Clone)]
pub struct TaskRunner {
    slots: Arc<Semaphore>,
    lanes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>>,
    lane_idle: Duration,
    default_retry: RetryPolicy,
}

impl TaskRunner {
    pub fn new(max_concurrency: usize, lane_idle: Duration, default_retry: RetryPolicy) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrency.max(1))),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            lane_idle,
            default_retry,
        }
    }

    pub fn from_config(section: &RunnerSection) -> Self {
        Self::new(
            section.max_concurrency,
            Duration::from_secs(section.lane_idle_secs),
            RetryPolicy::from(&section.retry),
        )
    }

    /// 当前存活的 lane 数
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// 提交任务。`attempt_fn(attempt, scope)` 每次尝试调用一次，attempt 从 1 开始。
    ///
    /// 提交本身是同步的：返回时任务已在 lane 中排好队，
    /// 因此同一队列键下的执行顺序就是调用 enqueue 的顺序。
    pub fn enqueue<T, F, Fut>(&self, options: EnqueueOptions, attempt_fn: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnMut(u32, CancelScope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, AgentError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let enqueued_at = Instant::now();
        let policy = options
            .retry
            .clone()
            .unwrap_or_else(|| self.default_retry.clone());
        let scope = CancelScope::new(options.cancel.clone());
        let label = options.label.clone();
        let lane = options
            .queue_key
            .clone()
            .unwrap_or_else(|| GLOBAL_LANE.to_string());

        let job: Job = Box::new(move || {
            let fut = async move {
                let (result, attempts) = run_with_retry(&policy, &scope, &label, attempt_fn).await;
                let _ = tx.send(TaskOutcome {
                    result,
                    attempts,
                    elapsed: enqueued_at.elapsed(),
                });
            };
            Box::pin(fut) as Pin<Box<dyn Future<Output = ()> + Send>>
        });

        self.dispatch(lane, job);
        TaskHandle { rx, enqueued_at }
    }

    /// 在 lane 表锁内投递，保证不会投进一条正在回收的 lane
    fn dispatch(&self, key: String, job: Job) {
        let mut lanes = self.lanes.lock();
        let job = match lanes.get(&key) {
            Some(sender) => match sender.send(job) {
                Ok(()) => return,
                // worker 已异常退出，换一条新 lane
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(job);
        lanes.insert(key.clone(), sender);
        drop(lanes);

        tracing::debug!(lane = %key, "Lane opened");
        tokio::spawn(lane_worker(
            key,
            receiver,
            self.slots.clone(),
            self.lanes.clone(),
            self.lane_idle,
        ));
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::from_config(&RunnerSection::default())
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("available_slots", &self.slots.available_permits())
            .field("lanes", &self.lane_count())
            .field("lane_idle", &self.lane_idle)
            .finish()
    }
}

async fn lane_worker(
    key: String,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    slots: Arc<Semaphore>,
    lanes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>>,
    idle: Duration,
) {
    loop {
        let job = match tokio::time::timeout(idle, receiver.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => match retire_if_idle(&lanes, &key, &mut receiver) {
                Some(job) => job,
                None => break,
            },
        };

        let Ok(_permit) = slots.clone().acquire_owned().await else {
            tracing::warn!(lane = %key, "Slot pool closed; lane stopping");
            break;
        };
        job().await;
    }
}

/// 空闲超时：锁住 lane 表后再确认一次队列为空，然后摘除自己
fn retire_if_idle(
    lanes: &Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    key: &str,
    receiver: &mut mpsc::UnboundedReceiver<Job>,
) -> Option<Job> {
    let mut lanes = lanes.lock();
    match receiver.try_recv() {
        Ok(job) => Some(job),
        Err(_) => {
            lanes.remove(key);
            tracing::debug!(lane = %key, "Idle lane retired");
            None
        }
    }
}

async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    scope: &CancelScope,
    label: &str,
    mut attempt_fn: F,
) -> (Result<T, AgentError>, u32)
where
    F: FnMut(u32, CancelScope) -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if let Err(e) = scope.checkpoint() {
            tracing::info!(task = %label, attempt, "Task cancelled before attempt");
            return (Err(e), attempt);
        }
        attempt += 1;

        let err = match attempt_fn(attempt, scope.clone()).await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) => e,
        };

        if !err.is_retryable() {
            return (Err(err), attempt);
        }
        if attempt >= max_attempts {
            let message = match err {
                AgentError::ActionFailed(message) => message,
                other => other.to_string(),
            };
            tracing::warn!(task = %label, attempts = attempt, error = %message, "Retries exhausted");
            return (
                Err(AgentError::TaskRunner {
                    attempts: attempt,
                    message,
                }),
                attempt,
            );
        }

        let delay = policy.delay_for_attempt(attempt);
        tracing::warn!(task = %label, attempt, ?delay, error = %err, "Attempt failed; retrying");
        if scope.is_irrevocable() {
            tokio::time::sleep(delay).await;
        } else {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = scope.token().cancelled() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn runner(max_concurrency: usize) -> TaskRunner {
        TaskRunner::new(max_concurrency, Duration::from_secs(5), RetryPolicy::none())
    }

    fn keyed(key: &str) -> EnqueueOptions {
        EnqueueOptions {
            queue_key: Some(key.to_string()),
            label: "test".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_delay_for_attempt_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 300,
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(0));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_same_key_runs_in_submission_order() {
        let runner = runner(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5u64 {
            let log = log.clone();
            handles.push(runner.enqueue(keyed("userA"), move |_, _| {
                let log = log.clone();
                async move {
                    log.lock().push(format!("start {i}"));
                    // 先提交的睡得更久，串行时顺序也不会变
                    tokio::time::sleep(Duration::from_millis(25 - i * 5)).await;
                    log.lock().push(format!("end {i}"));
                    Ok(i)
                }
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().await.result.unwrap(), i as u64);
        }
        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start {i}"), format!("end {i}")])
            .collect();
        assert_eq!(*log.lock(), expected);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_concurrently() {
        let runner = runner(2);
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let a = {
            let barrier = barrier.clone();
            runner.enqueue(keyed("a"), move |_, _| {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    Ok(())
                }
            })
        };
        let b = runner.enqueue(keyed("b"), move |_, _| {
            let barrier = barrier.clone();
            async move {
                barrier.wait().await;
                Ok(())
            }
        });
        let both = async { (a.join().await, b.join().await) };
        let (a, b) = tokio::time::timeout(Duration::from_secs(2), both)
            .await
            .expect("lanes should not serialize each other");
        assert!(a.result.is_ok() && b.result.is_ok());
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let runner = runner(1);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handle = runner.enqueue(
            EnqueueOptions {
                retry: Some(RetryPolicy::attempts(3, 1)),
                ..keyed("k")
            },
            move |attempt, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(AgentError::ActionFailed("timeout".to_string()))
                    } else {
                        Ok("done")
                    }
                }
            },
        );
        let outcome = handle.join().await;
        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_attempts() {
        let runner = runner(1);
        let handle = runner.enqueue(
            EnqueueOptions {
                retry: Some(RetryPolicy::attempts(2, 1)),
                ..keyed("k")
            },
            |_, _| async { Err::<(), _>(AgentError::ActionFailed("boom".to_string())) },
        );
        match handle.join().await.result {
            Err(AgentError::TaskRunner { attempts, message }) => {
                assert_eq!(attempts, 2);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let runner = runner(1);
        let handle = runner.enqueue(
            EnqueueOptions {
                retry: Some(RetryPolicy::attempts(5, 1)),
                ..keyed("k")
            },
            |_, _| async {
                Err::<(), _>(AgentError::Store(crate::memory::StoreError::Io(
                    "disk".to_string(),
                )))
            },
        );
        let outcome = handle.join().await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(AgentError::Store(_))));
    }

    #[tokio::test]
    async fn test_cancel_before_start_never_runs() {
        let runner = runner(1);
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handle = runner.enqueue(
            EnqueueOptions {
                cancel: token,
                ..keyed("k")
            },
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        );
        let outcome = handle.join().await;
        assert!(matches!(outcome.result, Err(AgentError::Cancelled)));
        assert_eq!(outcome.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_irrevocable_runs_to_completion() {
        let runner = runner(1);
        let token = CancellationToken::new();
        let inner = token.clone();
        let handle = runner.enqueue(
            EnqueueOptions {
                cancel: token,
                retry: Some(RetryPolicy::attempts(2, 1)),
                ..keyed("k")
            },
            move |attempt, scope| {
                let inner = inner.clone();
                async move {
                    scope.mark_irrevocable();
                    inner.cancel();
                    scope.checkpoint()?;
                    if attempt == 1 {
                        return Err(AgentError::ActionFailed("flaky".to_string()));
                    }
                    Ok(attempt)
                }
            },
        );
        let outcome = handle.join().await;
        assert_eq!(outcome.result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_between_attempts_stops_retry() {
        let runner = runner(1);
        let token = CancellationToken::new();
        let inner = token.clone();
        let handle = runner.enqueue(
            EnqueueOptions {
                cancel: token,
                retry: Some(RetryPolicy::attempts(5, 50)),
                ..keyed("k")
            },
            move |_, _| {
                let inner = inner.clone();
                async move {
                    inner.cancel();
                    Err::<(), _>(AgentError::ActionFailed("x".to_string()))
                }
            },
        );
        let outcome = handle.join().await;
        assert!(matches!(outcome.result, Err(AgentError::Cancelled)));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_idle_lane_is_retired() {
        let runner = TaskRunner::new(1, Duration::from_millis(20), RetryPolicy::none());
        let handle = runner.enqueue(keyed("short-lived"), |_, _| async { Ok(()) });
        handle.join().await.result.unwrap();
        assert_eq!(runner.lane_count(), 1);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runner.lane_count(), 0);

        // 回收后再提交会重新开 lane
        let handle = runner.enqueue(keyed("short-lived"), |_, _| async { Ok(7) });
        assert_eq!(handle.join().await.result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_unkeyed_tasks_share_global_lane() {
        let runner = runner(4);
        let handle = runner.enqueue(EnqueueOptions::default(), |_, _| async { Ok(1) });
        assert_eq!(handle.join().await.result.unwrap(), 1);
        assert!(runner.lanes.lock().contains_key(GLOBAL_LANE));
    }
}
