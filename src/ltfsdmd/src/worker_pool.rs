use std::future::Future;
use std::sync::Mutex;

use log::debug;
use tokio::task::JoinHandle;

/// Tracks every dispatched worker task so the scheduler can join them
/// all at drain time. Workers may spawn further workers (a migration
/// enqueues tape moves), so the drain loops until nothing is left.
pub struct WorkerPool {
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl WorkerPool {
    pub fn new() -> WorkerPool {
        WorkerPool {
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn<F>(&self, name: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!("dispatching worker {}", name);
        let handle = tokio::spawn(fut);
        let mut handles = self.handles.lock().unwrap();
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((name.to_string(), handle));
    }

    pub async fn wait_all(&self) {
        loop {
            let batch: Vec<(String, JoinHandle<()>)> = {
                let mut handles = self.handles.lock().unwrap();
                handles.drain(..).collect()
            };
            if batch.is_empty() {
                return;
            }
            for (name, handle) in batch {
                if handle.await.is_err() {
                    log::error!("worker {} panicked", name);
                }
            }
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
