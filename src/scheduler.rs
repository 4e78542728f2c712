// scheduler.rs — 抗漂移的周期调度器
// 每 10 秒醒来对比墙钟与下次运行时间；运行前先重新锚定，休眠/改时间后只补跑一次

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 轮询间隔
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// 墙钟与单调时钟的偏差超过该值时视为休眠唤醒或系统改时间
pub const CLOCK_JUMP_THRESHOLD: Duration = Duration::from_secs(30);

pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// 墙钟来源，测试中可替换
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 来自系统的电源/时间通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    Resumed,
    TimeChanged,
}

/// 本次运行的触发原因，只用于日志和任务内部判断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Misfire(SystemEvent),
    Manual,
}

/// 调度器驱动的唯一任务
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    async fn run(&self, trigger: Trigger, cancel: CancellationToken) -> Result<(), JobError>;
}

#[derive(Debug, Clone, Copy)]
struct State {
    interval: Duration,
    next_run: Option<DateTime<Utc>>,
    running: bool,
    poll_interval: Duration,
}

struct Inner {
    job: Arc<dyn ScheduledJob>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    /// 串行化 检查-锚定-执行，同一时间最多一次运行
    run_guard: tokio::sync::Mutex<()>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SystemEvent>>,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    events_tx: mpsc::UnboundedSender<SystemEvent>,
    /// 所有运行令牌的上级，取消它等同于关停
    shutdown: CancellationToken,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

fn after(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(interval)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// 比较两次轮询之间墙钟与单调时钟各自走过的时间
///
/// 墙钟明显快于单调时钟说明机器睡过一段时间（单调时钟在挂起时不走）；
/// 反方向或者墙钟倒退则是有人改了系统时间。
pub fn detect_clock_jump(wall_elapsed: TimeDelta, mono_elapsed: Duration) -> Option<SystemEvent> {
    let mono = TimeDelta::from_std(mono_elapsed).unwrap_or(TimeDelta::MAX);
    let threshold = TimeDelta::from_std(CLOCK_JUMP_THRESHOLD).unwrap_or(TimeDelta::MAX);
    let drift = wall_elapsed - mono;

    if drift > threshold {
        Some(SystemEvent::Resumed)
    } else if drift < -threshold {
        Some(SystemEvent::TimeChanged)
    } else {
        None
    }
}

impl Inner {
    /// 到点就运行一次；返回是否真的运行了任务
    async fn evaluate(&self, trigger: Trigger, cancel: &CancellationToken) -> bool {
        let _guard = self.run_guard.lock().await;

        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            let due = state.next_run.is_some_and(|next| now >= next);
            if !state.running || !due {
                return false;
            }
            if let Trigger::Misfire(event) = trigger {
                tracing::info!(
                    ?event,
                    missed = ?state.next_run,
                    "missed run detected, firing once to catch up"
                );
            } else {
                tracing::info!("scheduled time reached, executing");
            }
            // 先锚定再执行，慢任务不会导致紧接着再跑一次
            state.next_run = Some(after(now, state.interval));
        }

        self.execute(trigger, cancel).await;
        true
    }

    async fn execute(&self, trigger: Trigger, cancel: &CancellationToken) {
        if let Err(e) = self.job.run(trigger, cancel.child_token()).await {
            tracing::error!(?trigger, error = %e, "background execution failed");
        }
        if let Some(next) = self.state.lock().next_run {
            tracing::info!(next_run = %next.with_timezone(&chrono::Local).format("%H:%M:%S"), "next run");
        }
    }
}

impl Scheduler {
    pub fn new(job: Arc<dyn ScheduledJob>, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                job,
                clock,
                state: Mutex::new(State {
                    interval,
                    next_run: None,
                    running: false,
                    poll_interval: POLL_INTERVAL,
                }),
                run_guard: tokio::sync::Mutex::new(()),
                events_rx: tokio::sync::Mutex::new(events_rx),
            }),
            events_tx,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// 挂到进程级的关停令牌下：`parent` 被取消时后台循环和正在进行的运行一起取消
    pub fn with_shutdown(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    #[cfg(test)]
    fn with_poll_interval(self, poll: Duration) -> Self {
        self.inner.state.lock().poll_interval = poll;
        self
    }

    /// Stopped → Running；必须在 tokio 运行时内调用
    pub fn start(&self) {
        let mut task = self.task.lock();
        {
            let mut state = self.inner.state.lock();
            if state.running {
                return;
            }
            state.running = true;
            let next = after(self.inner.clock.now(), state.interval);
            state.next_run = Some(next);
            tracing::info!(next_run = %next, "scheduler started");
        }

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(run_loop(Arc::clone(&self.inner), cancel.clone()));
        *task = Some((cancel, handle));
    }

    /// Running → Stopped：取消循环（连同正在运行的任务）并等待其退出
    pub async fn stop(&self) {
        self.inner.state.lock().running = false;

        let task = self.task.lock().take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "scheduler loop ended abnormally");
            }
            tracing::info!("scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().next_run
    }

    pub fn interval(&self) -> Duration {
        self.inner.state.lock().interval
    }

    /// 修改间隔并立即以当前时间重新锚定
    pub fn update_interval(&self, interval: Duration) {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        state.interval = interval;
        let next = after(now, interval);
        state.next_run = Some(next);
        tracing::info!(minutes = interval.as_secs() / 60, next_run = %next, "interval updated");
    }

    /// 手动换图后把下一次后台运行推迟一个完整间隔
    pub fn manual_trigger(&self) {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        let next = after(now, state.interval);
        state.next_run = Some(next);
        tracing::info!(next_run = %next, "manual run, background schedule pushed back");
    }

    /// 立即运行一次（与后台运行互斥），并推迟下一次后台运行
    pub async fn run_now(&self) {
        let _guard = self.inner.run_guard.lock().await;
        self.manual_trigger();

        let cancel = self.loop_token();
        self.inner.execute(Trigger::Manual, &cancel).await;
    }

    /// 一次常规检查
    pub async fn tick(&self) -> bool {
        self.inner.evaluate(Trigger::Scheduled, &self.loop_token()).await
    }

    /// 唤醒/改时间通知：已错过则立即补跑一次，积压的次数全部丢弃
    pub async fn on_system_event(&self, event: SystemEvent) -> bool {
        tracing::info!(?event, "system event, re-evaluating schedule");
        self.inner.evaluate(Trigger::Misfire(event), &self.loop_token()).await
    }

    /// 外部通知源（比如 logind 监听）通过它投递事件给后台循环
    pub fn event_sender(&self) -> mpsc::UnboundedSender<SystemEvent> {
        self.events_tx.clone()
    }

    fn loop_token(&self) -> CancellationToken {
        self.task
            .lock()
            .as_ref()
            .map(|(cancel, _)| cancel.clone())
            .unwrap_or_else(|| self.shutdown.child_token())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.task.get_mut().take() {
            cancel.cancel();
        }
    }
}

async fn run_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut events = inner.events_rx.lock().await;

    let mut last_wall = inner.clock.now();
    let mut last_mono = tokio::time::Instant::now();
    let mut trigger = Trigger::Scheduled;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        inner.evaluate(trigger, &cancel).await;

        let poll = inner.state.lock().poll_interval;
        trigger = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(event) = events.recv() => {
                tracing::info!(?event, "system event received");
                Trigger::Misfire(event)
            }
            _ = tokio::time::sleep(poll) => Trigger::Scheduled,
        };

        let wall = inner.clock.now();
        let mono = tokio::time::Instant::now();
        if trigger == Trigger::Scheduled {
            if let Some(event) = detect_clock_jump(wall - last_wall, mono - last_mono) {
                tracing::info!(?event, "clock jump detected");
                trigger = Trigger::Misfire(event);
            }
        }
        last_wall = wall;
        last_mono = mono;
    }

    tracing::debug!("scheduler loop exited");
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// 手动拨动的时钟
    pub struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self(Mutex::new(start))
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.0.lock();
            *now = after(*now, by);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOUR: Duration = Duration::from_secs(3600);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    /// 记录运行次数，可模拟耗时或失败
    struct CountingJob {
        runs: AtomicUsize,
        triggers: Mutex<Vec<Trigger>>,
        clock: Arc<ManualClock>,
        advance_during_run: Duration,
        delay: Duration,
        fail: bool,
    }

    impl CountingJob {
        fn new(clock: Arc<ManualClock>) -> Self {
            Self {
                runs: AtomicUsize::new(0),
                triggers: Mutex::new(Vec::new()),
                clock,
                advance_during_run: Duration::ZERO,
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        async fn run(&self, trigger: Trigger, _cancel: CancellationToken) -> Result<(), JobError> {
            self.triggers.lock().push(trigger);
            self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.clock.advance(self.advance_during_run);
            if self.fail {
                return Err("provider exploded".into());
            }
            Ok(())
        }
    }

    fn scheduler(job: CountingJob, clock: Arc<ManualClock>) -> (Arc<CountingJob>, Scheduler) {
        let job = Arc::new(job);
        let scheduler = Scheduler::new(job.clone(), HOUR, clock);
        (job, scheduler)
    }

    async fn wait_for_runs(job: &CountingJob, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while job.runs() < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not run in time");
    }

    #[tokio::test]
    async fn start_anchors_first_run_one_interval_out() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (job, scheduler) = scheduler(CountingJob::new(clock.clone()), clock.clone());

        scheduler.start();
        assert!(scheduler.is_running());
        assert_eq!(scheduler.next_run(), Some(t0() + TimeDelta::hours(1)));

        assert!(!scheduler.tick().await);
        assert_eq!(job.runs(), 0);
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn next_run_is_anchored_before_a_slow_job() {
        let clock = Arc::new(ManualClock::new(t0()));
        let mut job = CountingJob::new(clock.clone());
        // 任务跑了 5 小时
        job.advance_during_run = 5 * HOUR;
        let (job, scheduler) = scheduler(job, clock.clone());
        scheduler.start();

        clock.advance(HOUR);
        let started_at = clock.now();
        assert!(scheduler.tick().await);

        assert_eq!(job.runs(), 1);
        assert_eq!(scheduler.next_run(), Some(started_at + TimeDelta::hours(1)));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn wake_after_long_sleep_runs_exactly_once() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (job, scheduler) = scheduler(CountingJob::new(clock.clone()), clock.clone());
        scheduler.start();

        // 睡过了三个间隔
        clock.advance(3 * HOUR + Duration::from_secs(1800));
        let woke_at = clock.now();

        assert!(scheduler.on_system_event(SystemEvent::Resumed).await);
        assert!(!scheduler.on_system_event(SystemEvent::TimeChanged).await);
        assert!(!scheduler.tick().await);

        assert_eq!(job.runs(), 1);
        assert_eq!(scheduler.next_run(), Some(woke_at + TimeDelta::hours(1)));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn event_before_due_time_does_nothing() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (job, scheduler) = scheduler(CountingJob::new(clock.clone()), clock.clone());
        scheduler.start();

        clock.advance(HOUR / 2);
        assert!(!scheduler.on_system_event(SystemEvent::Resumed).await);
        assert_eq!(job.runs(), 0);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn simultaneous_triggers_run_once() {
        let clock = Arc::new(ManualClock::new(t0()));
        let mut job = CountingJob::new(clock.clone());
        job.delay = Duration::from_millis(50);
        let (job, scheduler) = scheduler(job, clock.clone());
        scheduler.start();

        clock.advance(2 * HOUR);
        let (a, b, c) = tokio::join!(
            scheduler.tick(),
            scheduler.on_system_event(SystemEvent::Resumed),
            scheduler.on_system_event(SystemEvent::TimeChanged),
        );

        assert_eq!([a, b, c].iter().filter(|ran| **ran).count(), 1);
        assert_eq!(job.runs(), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stopped_scheduler_never_runs() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (job, scheduler) = scheduler(CountingJob::new(clock.clone()), clock.clone());

        clock.advance(10 * HOUR);
        assert!(!scheduler.tick().await);
        assert!(!scheduler.on_system_event(SystemEvent::Resumed).await);

        scheduler.start();
        scheduler.stop().await;
        clock.advance(10 * HOUR);
        assert!(!scheduler.tick().await);
        assert_eq!(job.runs(), 0);
    }

    #[tokio::test]
    async fn interval_change_and_manual_trigger_reanchor() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (_job, scheduler) = scheduler(CountingJob::new(clock.clone()), clock.clone());
        scheduler.start();

        clock.advance(Duration::from_secs(600));
        scheduler.update_interval(6 * HOUR);
        assert_eq!(scheduler.interval(), 6 * HOUR);
        assert_eq!(scheduler.next_run(), Some(clock.now() + TimeDelta::hours(6)));

        clock.advance(HOUR);
        scheduler.manual_trigger();
        assert_eq!(scheduler.next_run(), Some(clock.now() + TimeDelta::hours(6)));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn run_now_executes_and_pushes_schedule() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (job, scheduler) = scheduler(CountingJob::new(clock.clone()), clock.clone());
        scheduler.start();

        clock.advance(HOUR / 2);
        scheduler.run_now().await;
        assert_eq!(job.runs(), 1);
        assert_eq!(scheduler.next_run(), Some(clock.now() + TimeDelta::hours(1)));
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn loop_handles_pushed_events_and_survives_failures() {
        let clock = Arc::new(ManualClock::new(t0()));
        let mut job = CountingJob::new(clock.clone());
        job.fail = true;
        let (job, scheduler) = scheduler(job, clock.clone());
        scheduler.start();
        let events = scheduler.event_sender();

        clock.advance(2 * HOUR);
        events.send(SystemEvent::Resumed).unwrap();
        wait_for_runs(&job, 1).await;

        clock.advance(2 * HOUR);
        events.send(SystemEvent::TimeChanged).unwrap();
        wait_for_runs(&job, 2).await;

        assert!(scheduler.is_running());
        scheduler.stop().await;
        assert_eq!(job.runs(), 2);
    }

    #[tokio::test]
    async fn loop_catches_up_once_after_wall_clock_jump() {
        let clock = Arc::new(ManualClock::new(t0()));
        let (job, scheduler) = scheduler(CountingJob::new(clock.clone()), clock.clone());
        let poll = Duration::from_millis(20);
        let scheduler = scheduler.with_poll_interval(poll);
        scheduler.start();

        // 让循环先完成第一次检查并进入休眠
        tokio::time::sleep(Duration::from_millis(5)).await;
        // 机器睡了三个多小时，单调时钟只走了一个轮询周期
        clock.advance(3 * HOUR + Duration::from_secs(1800));

        wait_for_runs(&job, 1).await;
        tokio::time::sleep(poll * 10).await;

        assert_eq!(job.runs(), 1);
        assert_eq!(
            *job.triggers.lock(),
            vec![Trigger::Misfire(SystemEvent::Resumed)]
        );
        assert_eq!(scheduler.next_run().map(|n| n > clock.now()), Some(true));
        scheduler.stop().await;
    }

    /// 一直等到被取消的任务
    struct HangingJob {
        cancelled: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ScheduledJob for HangingJob {
        async fn run(&self, _trigger: Trigger, cancel: CancellationToken) -> Result<(), JobError> {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancelled.store(true, Ordering::SeqCst);
                    Err("cancelled".into())
                }
                _ = tokio::time::sleep(24 * HOUR) => Ok(()),
            }
        }
    }

    fn hanging_job() -> Arc<HangingJob> {
        Arc::new(HangingJob {
            cancelled: std::sync::atomic::AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn shutdown_cancels_an_in_flight_run_now() {
        let clock = Arc::new(ManualClock::new(t0()));
        let job = hanging_job();
        let shutdown = CancellationToken::new();
        let scheduler = Scheduler::new(job.clone(), HOUR, clock).with_shutdown(&shutdown);
        scheduler.start();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), scheduler.run_now())
            .await
            .expect("run kept going after shutdown");
        assert!(job.cancelled.load(Ordering::SeqCst));

        tokio::time::timeout(Duration::from_secs(5), scheduler.stop())
            .await
            .expect("stop hung");
    }

    #[tokio::test]
    async fn stop_interrupts_a_slow_run_now() {
        let clock = Arc::new(ManualClock::new(t0()));
        let job = hanging_job();
        let scheduler = Scheduler::new(job.clone(), HOUR, clock);
        scheduler.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(scheduler.run_now(), async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                scheduler.stop().await;
            })
        })
        .await
        .expect("stop did not interrupt the run");

        assert!(job.cancelled.load(Ordering::SeqCst));
        assert!(!scheduler.is_running());
    }

    #[test]
    fn clock_jumps_are_classified() {
        let poll = POLL_INTERVAL;
        assert_eq!(detect_clock_jump(TimeDelta::seconds(10), poll), None);
        assert_eq!(detect_clock_jump(TimeDelta::seconds(35), poll), None);
        assert_eq!(
            detect_clock_jump(TimeDelta::hours(3), poll),
            Some(SystemEvent::Resumed)
        );
        assert_eq!(
            detect_clock_jump(TimeDelta::seconds(-600), poll),
            Some(SystemEvent::TimeChanged)
        );
    }
}
