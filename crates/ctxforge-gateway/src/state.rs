use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use ctxforge_core::config::GatewayConfig;
use ctxforge_core::event::EventBus;
use ctxforge_core::traits::{GraphLookup, RunStore};
use ctxforge_engine::{ComparisonCoordinator, SessionRunner};

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub runner: Arc<SessionRunner>,
    pub comparisons: Arc<ComparisonCoordinator>,
    pub event_bus: Arc<EventBus>,
    pub graphs: Arc<dyn GraphLookup>,
    pub store: Arc<dyn RunStore>,
    /// JSONL run log directory and level, when enabled.
    pub run_log: Option<(PathBuf, u8)>,
    /// Parent of every background run; cancelled on shutdown.
    pub shutdown: CancellationToken,
    /// Channel keys of runs started here and not yet finished.
    pub active_runs: Mutex<HashSet<String>>,
}

impl AppState {
    /// Reserve `id` as the channel of a new run.
    ///
    /// Returns `None` when a run with that id is in flight or already stored,
    /// since a channel has exactly one writer.
    pub async fn claim_run(self: &Arc<Self>, id: &str) -> Option<RunClaim> {
        let stored = matches!(self.store.load_session(id).await, Ok(Some(_)))
            || matches!(self.store.load_comparison(id).await, Ok(Some(_)));
        if stored {
            return None;
        }
        let mut active = self.active_runs.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(id.to_string()) {
            return None;
        }
        Some(RunClaim {
            state: self.clone(),
            id: id.to_string(),
        })
    }
}

/// Holds a run id reserved until dropped.
pub struct RunClaim {
    state: Arc<AppState>,
    id: String,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        let mut active = self
            .state
            .active_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        active.remove(&self.id);
    }
}
