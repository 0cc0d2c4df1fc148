use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use log::{error, info, warn};
use ltfsdm_lib::{write_key, DmError, DmResult, ServerConfig};
use req_queue::QueueStore;
use tape_inventory::{Inventory, SimLibrary, TapeLibrary};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::dispatcher;
use crate::recall::{self, RecallEvent};
use crate::scheduler::Scheduler;
use crate::worker_pool::WorkerPool;

/// Termination levels. `terminate` refuses new work, `forced` makes
/// workers abandon their current job, `finish` keeps the scheduler
/// going until the queue is drained.
pub struct TermFlags {
    terminate: AtomicBool,
    forced: AtomicBool,
    finish: AtomicBool,
}

impl TermFlags {
    fn new() -> TermFlags {
        TermFlags {
            terminate: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            finish: AtomicBool::new(false),
        }
    }

    pub fn terminate(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    pub fn forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    pub fn finish(&self) -> bool {
        self.finish.load(Ordering::SeqCst)
    }

    pub fn set_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn set_forced(&self) {
        self.forced.store(true, Ordering::SeqCst);
    }

    pub fn set_finish(&self) {
        self.finish.store(true, Ordering::SeqCst);
    }
}

/// Shared server state handed to the scheduler, the dispatcher and
/// every worker.
pub struct Ctx {
    pub key: i64,
    pub queue: QueueStore,
    pub inv: Inventory,
    pub attrs: ltfsdm_lib::AttrStore,
    pub library: Arc<dyn TapeLibrary>,
    pub term: TermFlags,
    /// Held by a connection handler until its first non-stop message;
    /// serializes session startup against the stop path.
    pub term_lock: tokio::sync::Mutex<()>,
    /// The scheduler condition: new request, tape move done, or
    /// request complete all funnel into this one notify.
    pub sched: Notify,
    /// Wakes the accept loop for shutdown (stands in for SIGUSR1).
    pub shutdown: Notify,
    pub worker_pool: WorkerPool,
    pub recall_tx: mpsc::Sender<RecallEvent>,
    /// Transparent-recall upcalls waiting for their file, keyed by
    /// request and file name.
    pub recall_waiters: Mutex<HashMap<(i64, String), oneshot::Sender<i32>>>,
    req_counter: AtomicI64,
}

impl Ctx {
    pub async fn build(
        config: ServerConfig,
        key: i64,
    ) -> DmResult<(Arc<Ctx>, mpsc::Receiver<RecallEvent>)> {
        let queue = QueueStore::open(&config.db_path)?;
        let attrs = ltfsdm_lib::AttrStore::open(config.attr_store_path.clone())?;
        let library: Arc<dyn TapeLibrary> = Arc::new(SimLibrary::new(&config.library));
        let inv = Inventory::build(library.clone(), config.pool_conf_path.clone()).await?;
        let (recall_tx, recall_rx) = mpsc::channel(64);

        let ctx = Arc::new(Ctx {
            key,
            queue,
            inv,
            attrs,
            library,
            term: TermFlags::new(),
            term_lock: tokio::sync::Mutex::new(()),
            sched: Notify::new(),
            shutdown: Notify::new(),
            worker_pool: WorkerPool::new(),
            recall_tx,
            recall_waiters: Mutex::new(HashMap::new()),
            req_counter: AtomicI64::new(0),
        });
        Ok((ctx, recall_rx))
    }

    pub fn next_req_num(&self) -> i64 {
        self.req_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Answer a waiting transparent-recall upcall, if one is parked on
    /// this file.
    pub fn answer_recall_waiter(&self, req_num: i64, file_name: &str, code: i32) {
        let waiter = {
            let mut waiters = self.recall_waiters.lock().unwrap();
            waiters.remove(&(req_num, file_name.to_string()))
        };
        if let Some(tx) = waiter {
            let _ = tx.send(code);
        }
    }
}

fn acquire_lock_file(path: &Path) -> DmResult<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    file.try_lock_exclusive().map_err(|_| {
        DmError::Internal(format!(
            "another instance is running (lock {} held)",
            path.display()
        ))
    })?;
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}

/// Server main: lock, key, recovery, scheduler, accept loop.
pub async fn run(config: ServerConfig) -> DmResult<()> {
    let lock_file = acquire_lock_file(&config.lock_file_path)?;

    let key = rand::random::<i64>();
    write_key(&config.key_file_path, key)?;

    let socket_path = config.socket_path.clone();
    let key_file_path = config.key_file_path.clone();

    let (ctx, recall_rx) = Ctx::build(config, key).await?;

    let recovered = ctx.queue.reset_in_progress()?;
    if recovered > 0 {
        info!("rescheduling {} interrupted requests", recovered);
    }

    let sched_handle = tokio::spawn(Scheduler::new(ctx.clone()).run());
    let recall_handle = tokio::spawn(recall::event_loop(ctx.clone(), recall_rx));

    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&socket_path)
        .map_err(|e| DmError::Comm(format!("bind {} failed: {}", socket_path.display(), e)))?;
    info!("listening on {}", socket_path.display());

    // requests recovered from the previous run may already be schedulable
    ctx.sched.notify_one();

    let mut sigusr1 =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
            .map_err(|e| DmError::Internal(format!("signal handler failed: {}", e)))?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(dispatcher::handle_connection(ctx, stream));
                    }
                    Err(e) => {
                        error!("accept failed: {}", e);
                    }
                }
            }
            _ = ctx.shutdown.notified() => {
                info!("shutdown requested");
                break;
            }
            _ = sigusr1.recv() => {
                info!("SIGUSR1 received");
                ctx.term.set_terminate();
                break;
            }
        }
    }

    // the scheduler drains all workers before returning
    ctx.sched.notify_one();
    if sched_handle.await.is_err() {
        error!("scheduler task panicked");
    }
    recall_handle.abort();

    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!("removing {} failed: {}", socket_path.display(), e);
    }
    if let Err(e) = std::fs::remove_file(&key_file_path) {
        warn!("removing {} failed: {}", key_file_path.display(), e);
    }
    drop(lock_file);
    info!("backend terminated");
    Ok(())
}
