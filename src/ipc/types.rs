use std::path::PathBuf;
use std::thread::JoinHandle;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub workers: Vec<JoinHandle<()>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            workers: Vec::new(),
        }
    }

    /// Tracks a new background worker, releasing handles of workers that
    /// have already exited.
    pub fn push_worker(&mut self, handle: JoinHandle<()>) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(|h| h.is_finished());
        for h in finished {
            if h.join().is_err() {
                tracing::error!("computation worker panicked");
            }
        }
        self.workers = running;
        self.workers.push(handle);
    }

    /// Waits for background computation batches to finish.
    pub fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("computation worker panicked");
            }
        }
    }
}
