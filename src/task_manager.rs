//! Tracks the long-running tasks of the exporter so shutdown can wait on them.
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

type Handles = Vec<(&'static str, JoinHandle<()>)>;

/// Named task handles plus the shutdown signal they all watch.
#[derive(Clone, Debug)]
pub struct TaskManager {
    handles: Arc<Mutex<Handles>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskManager {
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_rx,
        }
    }

    fn handles(&self) -> MutexGuard<'_, Handles> {
        // A panic while holding the lock leaves the list itself intact.
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task_name = name, "Spawning task");
        let handle = tokio::spawn(future);
        self.handles().push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Waits for every task, logging the ones that panicked.
    pub async fn shutdown(self) {
        let handles: Handles = self.handles().drain(..).collect();
        info!(
            "Waiting for {} tasks to complete...",
            handles.len()
        );

        let (names, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let results = join_all(handles).await;

        let mut panicked = 0;
        for (task_name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => debug!(task_name, "Task shut down gracefully."),
                Err(e) => {
                    error!(task_name, "Task failed during shutdown: {}", e);
                    panicked += 1;
                }
            }
        }

        if panicked > 0 {
            error!("{} tasks failed during shutdown", panicked);
        } else {
            info!("All tasks shut down gracefully.");
        }
    }
}
