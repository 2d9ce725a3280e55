//! Worker supervision: registration, lifecycle control, and restart
//! recovery.
//!
//! Every worker is a spawned task bound to one {module, website, list,
//! config} and owns its own store connection. The supervisor holds the
//! control handles; pause, unpause, stop, and interrupt are cooperative
//! flags the worker observes at its suspension points. Workers found in
//! the thread table at startup were interrupted by a shutdown and are
//! resumed with `on_init(resumed = true)`.

mod worker;

pub use worker::{
    run_worker, WorkerControl, WorkerEnv, WorkerError, WorkerModule, WorkerResult,
    SLEEP_ON_CONNECTION_ERROR,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::models::{ModuleKind, ThreadEntry, ThreadProps};
use crate::repository::{
    ConfigRepository, Db, Result, StorageError, ThreadRepository, UrlListRepository,
    WebsiteRepository,
};

/// A registered worker and its control handle.
struct WorkerHandle {
    module: ModuleKind,
    control: Arc<WorkerControl>,
    join: tokio::task::JoinHandle<()>,
}

pub struct Supervisor {
    db: Arc<Db>,
    workers: Mutex<HashMap<i64, WorkerHandle>>,
}

impl Supervisor {
    pub fn new(db: Arc<Db>) -> Arc<Self> {
        Arc::new(Self {
            db,
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Register and start a new worker. Returns its thread id.
    pub fn start(&self, props: ThreadProps) -> Result<i64> {
        // Validate the targets up front so a bad command leaves no row.
        WebsiteRepository::new(self.db.clone()).get(props.website)?;
        UrlListRepository::new(self.db.clone()).get(props.urllist)?;
        ConfigRepository::new(self.db.clone()).get_json(props.config)?;

        let threads = ThreadRepository::new(self.db.clone());
        let id = threads.add(&props)?;
        let entry = threads.get(id)?;
        if let Err(e) = self.spawn(entry, false) {
            let _ = threads.delete(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Restart a stopped worker from its persisted row.
    pub fn restart(&self, thread_id: i64) -> Result<()> {
        {
            let workers = self.workers.lock().unwrap();
            if let Some(handle) = workers.get(&thread_id) {
                if handle.control.is_running() {
                    return Err(StorageError::Invalid(format!(
                        "thread {thread_id} is already running"
                    )));
                }
            }
        }
        let entry = ThreadRepository::new(self.db.clone()).get(thread_id)?;
        self.spawn(entry, true)
    }

    /// Re-instantiate every worker found in the thread table. Called once
    /// at startup; these workers were interrupted by the previous
    /// shutdown.
    pub fn resume_interrupted(&self) -> Result<usize> {
        let entries = ThreadRepository::new(self.db.clone()).list()?;
        let mut resumed = 0;
        for entry in entries {
            let id = entry.id;
            match self.spawn(entry, true) {
                Ok(()) => resumed += 1,
                Err(e) => tracing::error!("thread {id}: resume failed: {e}"),
            }
        }
        Ok(resumed)
    }

    fn spawn(&self, entry: ThreadEntry, resumed: bool) -> Result<()> {
        // The worker gets its own connection; repositories built from this
        // handle never share statements with another worker.
        let worker_db = self.db.reopen();

        let website = WebsiteRepository::new(worker_db.clone()).get(entry.website)?;
        let list = UrlListRepository::new(worker_db.clone()).get(entry.urllist)?;
        let config_json = ConfigRepository::new(worker_db.clone()).get_json(entry.config)?;

        let control = WorkerControl::new();
        if entry.paused {
            control.pause();
        }

        let env = Arc::new(WorkerEnv::new(
            &entry,
            website,
            list,
            config_json,
            worker_db,
            control.clone(),
        ));

        let module = crate::modules::build_module(&entry, env.clone())?;
        let join = tokio::spawn(run_worker(module, env, resumed));

        self.workers.lock().unwrap().insert(
            entry.id,
            WorkerHandle {
                module: entry.module,
                control,
                join,
            },
        );
        Ok(())
    }

    fn with_handle<T>(
        &self,
        thread_id: i64,
        expect_module: Option<ModuleKind>,
        f: impl FnOnce(&WorkerHandle) -> T,
    ) -> Result<T> {
        let workers = self.workers.lock().unwrap();
        let handle = workers
            .get(&thread_id)
            .ok_or_else(|| StorageError::NotFound(format!("thread {thread_id}")))?;
        if let Some(expected) = expect_module {
            if handle.module != expected {
                return Err(StorageError::Invalid(format!(
                    "thread {thread_id} is a {}, not a {}",
                    handle.module.as_str(),
                    expected.as_str()
                )));
            }
        }
        Ok(f(handle))
    }

    /// Request a pause; false when the module currently disallows it.
    pub fn pause(&self, thread_id: i64, module: Option<ModuleKind>) -> Result<bool> {
        self.with_handle(thread_id, module, |handle| handle.control.pause())
    }

    /// Idempotent unpause.
    pub fn unpause(&self, thread_id: i64, module: Option<ModuleKind>) -> Result<()> {
        self.with_handle(thread_id, module, |handle| handle.control.unpause())
    }

    /// Cooperative stop. The thread row stays and can be restarted.
    pub fn stop(&self, thread_id: i64, module: Option<ModuleKind>) -> Result<()> {
        self.with_handle(thread_id, module, |handle| handle.control.stop())
    }

    /// Flag the worker interrupt-recoverable and stop it; its row resumes
    /// on the next server start.
    pub fn send_interrupt(&self, thread_id: i64) -> Result<()> {
        self.with_handle(thread_id, None, |handle| handle.control.send_interrupt())
    }

    /// Wait for an interrupted worker to finish its current tick.
    pub async fn finish_interrupt(&self, thread_id: i64) -> Result<()> {
        let join = {
            let mut workers = self.workers.lock().unwrap();
            workers.remove(&thread_id).map(|handle| handle.join)
        };
        match join {
            Some(join) => {
                let _ = join.await;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("thread {thread_id}"))),
        }
    }

    /// Interrupt every worker and wait for them; used at shutdown.
    pub async fn interrupt_all(&self) {
        let handles: Vec<(i64, tokio::task::JoinHandle<()>)> = {
            let mut workers = self.workers.lock().unwrap();
            workers
                .drain()
                .map(|(id, handle)| {
                    handle.control.send_interrupt();
                    (id, handle.join)
                })
                .collect()
        };
        for (id, join) in handles {
            if join.await.is_err() {
                tracing::error!("thread {id}: worker task panicked during shutdown");
            }
        }
    }

    /// Stop workers bound to a website or list (before cascade deletes).
    pub fn stop_matching(&self, website: Option<i64>, urllist: Option<i64>) -> Result<Vec<i64>> {
        let entries = ThreadRepository::new(self.db.clone()).list()?;
        let mut stopped = Vec::new();
        let workers = self.workers.lock().unwrap();
        for entry in entries {
            let matches = website.is_some_and(|w| w == entry.website)
                || urllist.is_some_and(|l| l == entry.urllist);
            if matches {
                if let Some(handle) = workers.get(&entry.id) {
                    handle.control.stop();
                }
                stopped.push(entry.id);
            }
        }
        Ok(stopped)
    }

    /// Remove a thread registration entirely (worker stopped first).
    pub fn remove(&self, thread_id: i64) -> Result<()> {
        if let Some(handle) = self.workers.lock().unwrap().remove(&thread_id) {
            handle.control.stop();
        }
        ThreadRepository::new(self.db.clone()).delete(thread_id)
    }

    pub fn is_registered(&self, thread_id: i64) -> bool {
        self.workers.lock().unwrap().contains_key(&thread_id)
    }

    /// Whether the worker's task is still running (a stopped worker stays
    /// registered until removed or restarted).
    pub fn is_active(&self, thread_id: i64) -> bool {
        self.workers
            .lock()
            .unwrap()
            .get(&thread_id)
            .is_some_and(|handle| handle.control.is_running())
    }
}
