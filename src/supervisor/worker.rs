//! Worker-side plumbing: the module contract, shared control state, and
//! the tick loop that runs a module until it stops, fails, or is
//! interrupted.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

use crate::models::{ModuleKind, ThreadEntry, UrlList, Website};
use crate::repository::{Db, LogRepository, StorageError, ThreadRepository};

/// Seconds to sleep after a storage connection error before retrying.
pub const SLEEP_ON_CONNECTION_ERROR: Duration = Duration::from_secs(10);
/// Consecutive connection errors tolerated before giving up.
const MAX_CONNECTION_ERRORS: u32 = 30;
/// How often accumulated runtime and pausetime are flushed.
const TIMING_FLUSH_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkerError {
    /// Connection-class errors are retried by the supervisor loop instead
    /// of terminating the worker.
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Storage(e) => matches!(e, StorageError::Connection(_)),
            Self::Network(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// The contract every module implements.
#[async_trait]
pub trait WorkerModule: Send {
    async fn on_init(&mut self, resumed: bool) -> WorkerResult<()>;
    /// One unit of work. Modules idle by sleeping through
    /// [`WorkerEnv::sleep`] inside their tick.
    async fn on_tick(&mut self) -> WorkerResult<()>;
    async fn on_pause(&mut self);
    async fn on_unpause(&mut self);
    async fn on_clear(&mut self, interrupted: bool);
}

/// Shared control flags, owned jointly by the supervisor and the worker.
#[derive(Default)]
pub struct WorkerControl {
    running: AtomicBool,
    paused: AtomicBool,
    pausable: AtomicBool,
    interrupted: AtomicBool,
    notify: Notify,
}

impl WorkerControl {
    pub fn new() -> Arc<Self> {
        let control = Self::default();
        control.running.store(true, Ordering::SeqCst);
        control.pausable.store(true, Ordering::SeqCst);
        Arc::new(control)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Request a pause; refused while the module disallows it.
    pub fn pause(&self) -> bool {
        if !self.pausable.load(Ordering::SeqCst) {
            return false;
        }
        self.paused.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        true
    }

    /// Idempotent.
    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Stop, flagging the worker as resumable after restart.
    pub fn send_interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.stop();
    }

    pub fn set_pausable(&self, pausable: bool) {
        self.pausable.store(pausable, Ordering::SeqCst);
    }

    /// Sleep that wakes early on any control change.
    pub async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.notify.notified() => {}
        }
    }

    async fn wait_while_paused(&self) {
        // The periodic timeout covers a notify slipping in between the
        // flag check and the wait registration.
        while self.is_paused() && self.is_running() {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }
}

/// Everything a module needs from its surroundings: identity, targets,
/// storage handles, and status reporting.
pub struct WorkerEnv {
    pub thread_id: i64,
    pub module: ModuleKind,
    pub website: Website,
    pub list: UrlList,
    pub config_json: String,
    pub db: Arc<Db>,
    pub control: Arc<WorkerControl>,
    threads: ThreadRepository,
    log: LogRepository,
    last: AtomicI64,
}

impl WorkerEnv {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entry: &ThreadEntry,
        website: Website,
        list: UrlList,
        config_json: String,
        db: Arc<Db>,
        control: Arc<WorkerControl>,
    ) -> Self {
        Self {
            thread_id: entry.id,
            module: entry.module,
            website,
            list,
            config_json,
            threads: ThreadRepository::new(db.clone()),
            log: LogRepository::new(db.clone()),
            last: AtomicI64::new(entry.last),
            db,
            control,
        }
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Persist a status message, prefixed while paused.
    pub fn set_status(&self, message: &str) {
        let paused = self.control.is_paused();
        let full = if paused {
            format!("{{PAUSED}} {message}")
        } else {
            message.to_string()
        };
        if let Err(e) = self.threads.set_status(self.thread_id, paused, &full) {
            tracing::warn!("thread {}: failed to persist status: {e}", self.thread_id);
        }
    }

    pub fn set_progress(&self, fraction: f32) {
        if let Err(e) = self
            .threads
            .set_progress(self.thread_id, fraction.clamp(0.0, 1.0) as f64)
        {
            tracing::warn!("thread {}: failed to persist progress: {e}", self.thread_id);
        }
    }

    /// Log to the operator-visible log table and the process log.
    pub fn log(&self, message: &str) {
        tracing::info!("[{}#{}] {message}", self.module.as_str(), self.thread_id);
        if let Err(e) = self
            .log
            .insert(self.module.as_str(), &format!("[#{}] {message}", self.thread_id))
        {
            tracing::warn!("thread {}: failed to persist log entry: {e}", self.thread_id);
        }
    }

    pub fn last(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Advance the progress cursor. Monotone within a run; call only after
    /// the work for this id is durable.
    pub fn set_last(&self, value: i64) -> WorkerResult<()> {
        let previous = self.last.swap(value, Ordering::SeqCst);
        debug_assert!(value >= previous, "last cursor must not move backwards");
        self.threads.set_last(self.thread_id, value)?;
        Ok(())
    }

    pub fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + '_ {
        self.control.sleep(duration)
    }

    pub fn set_pausable(&self, pausable: bool) {
        self.control.set_pausable(pausable);
    }
}

/// Accumulates runtime and pausetime across a worker's life.
struct TimingTracker {
    threads: ThreadRepository,
    thread_id: i64,
    runtime: u64,
    pausetime: u64,
    mark: Instant,
    paused: bool,
    flushed: Instant,
}

impl TimingTracker {
    fn new(threads: ThreadRepository, entry: &ThreadEntry) -> Self {
        Self {
            threads,
            thread_id: entry.id,
            runtime: entry.runtime,
            pausetime: entry.pausetime,
            mark: Instant::now(),
            paused: false,
            flushed: Instant::now(),
        }
    }

    fn roll(&mut self) {
        let elapsed = self.mark.elapsed().as_secs();
        if self.paused {
            self.pausetime += elapsed;
        } else {
            self.runtime += elapsed;
        }
        self.mark = Instant::now();
    }

    fn switch(&mut self, paused: bool) {
        self.roll();
        self.paused = paused;
        self.flush();
    }

    fn maybe_flush(&mut self) {
        if self.flushed.elapsed() >= TIMING_FLUSH_INTERVAL {
            self.roll();
            self.flush();
        }
    }

    fn flush(&mut self) {
        self.flushed = Instant::now();
        let _ = self.threads.set_runtime(self.thread_id, self.runtime);
        let _ = self.threads.set_pausetime(self.thread_id, self.pausetime);
    }
}

/// Drive a module until it stops, fails, or is interrupted.
pub async fn run_worker(mut module: Box<dyn WorkerModule>, env: Arc<WorkerEnv>, resumed: bool) {
    let control = env.control.clone();
    let threads = ThreadRepository::new(env.db.clone());
    let entry = match threads.get(env.thread_id) {
        Ok(entry) => entry,
        Err(e) => {
            tracing::error!("thread {}: cannot load thread row: {e}", env.thread_id);
            return;
        }
    };
    let mut timing = TimingTracker::new(ThreadRepository::new(env.db.clone()), &entry);

    // Modules may not be paused while initializing.
    control.set_pausable(false);
    if let Err(e) = module.on_init(resumed).await {
        let message = format!("failed to initialize: {e}");
        env.log(&message);
        env.set_status(&message);
        control.stop();
        module.on_clear(false).await;
        return;
    }
    control.set_pausable(true);

    let mut connection_errors: u32 = 0;

    while control.is_running() {
        if control.is_paused() {
            timing.switch(true);
            module.on_pause().await;
            env.set_status("paused");
            control.wait_while_paused().await;
            timing.switch(false);
            if control.is_running() {
                module.on_unpause().await;
            }
            continue;
        }

        match module.on_tick().await {
            Ok(()) => {
                connection_errors = 0;
            }
            Err(e) if e.is_connection() => {
                connection_errors += 1;
                if connection_errors > MAX_CONNECTION_ERRORS {
                    let message = format!("giving up after repeated connection errors: {e}");
                    env.log(&message);
                    env.set_status(&message);
                    break;
                }
                tracing::warn!(
                    "thread {}: connection error ({connection_errors}/{MAX_CONNECTION_ERRORS}): {e}",
                    env.thread_id
                );
                control.sleep(SLEEP_ON_CONNECTION_ERROR).await;
            }
            Err(e) => {
                let message = format!("terminated: {e}");
                env.log(&message);
                env.set_status(&message);
                break;
            }
        }

        timing.maybe_flush();
    }

    timing.roll();
    timing.flush();

    let interrupted = control.is_interrupted();
    module.on_clear(interrupted).await;

    if !interrupted {
        tracing::info!("thread {} stopped", env.thread_id);
    }
}
