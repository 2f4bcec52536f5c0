//! Cancelable ad-hoc query runner

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::models::{DataFrame, FieldType, QueryDefinition};

use super::transport::{EvalResponse, EvalTransport};

const CHANNEL_CAPACITY: usize = 64;

/// Progress of one query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingState {
    /// Request in flight
    Loading,
    /// Finished, possibly without data
    Done,
    /// Finished with an error
    Error,
}

/// Latest known result of one query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPanel {
    /// Query reference id
    pub ref_id: String,
    /// Progress
    pub state: LoadingState,
    /// Frames of the last completed run
    pub frames: Vec<DataFrame>,
    /// Error of the last completed run
    pub error: Option<String>,
    /// Bumped whenever the shape of successful results changes
    pub structure_rev: u64,
}

/// State of every query of the current batch, keyed by ref id
pub type RunnerSnapshot = BTreeMap<String, QueryPanel>;

type Shape = Vec<Vec<(String, FieldType)>>;

#[derive(Default)]
struct RunnerState {
    panels: RunnerSnapshot,
    shapes: BTreeMap<String, Shape>,
    in_flight: Option<(u64, CancellationToken)>,
    next_run: u64,
}

/// Runs query batches for interactive rule editing.
///
/// Each emission on [`subscribe`](Self::subscribe) is a full snapshot. A run
/// emits once with every query `Loading` and once more when the batch
/// completes. Starting a run cancels the previous one.
pub struct LiveQueryRunner {
    transport: Arc<dyn EvalTransport>,
    state: Arc<Mutex<RunnerState>>,
    tx: broadcast::Sender<RunnerSnapshot>,
}

impl LiveQueryRunner {
    /// Create a new runner
    pub fn new(transport: Arc<dyn EvalTransport>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            transport,
            state: Arc::new(Mutex::new(RunnerState::default())),
            tx,
        }
    }

    /// Receive every snapshot emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerSnapshot> {
        self.tx.subscribe()
    }

    /// Current state of every query
    pub fn snapshot(&self) -> RunnerSnapshot {
        self.state.lock().panels.clone()
    }

    /// Whether a batch is in flight
    pub fn is_running(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    /// Start evaluating `queries`, superseding any batch in flight
    pub fn run(&self, queries: Vec<QueryDefinition>) -> JoinHandle<()> {
        let token = CancellationToken::new();
        let run_id = {
            let mut state = self.state.lock();
            if let Some((_, previous)) = state.in_flight.take() {
                previous.cancel();
            }

            state.panels.retain(|ref_id, _| queries.iter().any(|q| &q.ref_id == ref_id));
            for query in &queries {
                let panel = state
                    .panels
                    .entry(query.ref_id.clone())
                    .or_insert_with(|| QueryPanel {
                        ref_id: query.ref_id.clone(),
                        state: LoadingState::Loading,
                        frames: Vec::new(),
                        error: None,
                        structure_rev: 0,
                    });
                panel.state = LoadingState::Loading;
                panel.error = None;
            }

            state.next_run += 1;
            let run_id = state.next_run;
            state.in_flight = Some((run_id, token.clone()));
            let _ = self.tx.send(state.panels.clone());
            run_id
        };

        let transport = self.transport.clone();
        let state = self.state.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let outcome = transport.evaluate(&queries, token).await;

            let mut state = state.lock();
            match state.in_flight {
                Some((current, _)) if current == run_id => state.in_flight = None,
                // Superseded or cancelled
                _ => return,
            }

            match outcome {
                Ok(response) => apply_response(&mut state, &queries, response),
                Err(Error::Cancelled) => return,
                Err(e) => {
                    warn!(error = %e, "Live query batch failed");
                    for panel in state.panels.values_mut() {
                        panel.state = LoadingState::Error;
                        panel.error = Some(e.to_string());
                        panel.frames.clear();
                    }
                }
            }

            let _ = tx.send(state.panels.clone());
        })
    }

    /// Abort the batch in flight; queries still loading become `Done` without data.
    /// Does nothing, and emits nothing, when no batch is in flight.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        let Some((run_id, token)) = state.in_flight.take() else {
            return;
        };
        token.cancel();
        debug!(run_id, "Live query batch cancelled");

        for panel in state.panels.values_mut() {
            if panel.state == LoadingState::Loading {
                panel.state = LoadingState::Done;
                panel.frames.clear();
            }
        }
        let _ = self.tx.send(state.panels.clone());
    }
}

fn apply_response(state: &mut RunnerState, queries: &[QueryDefinition], mut response: EvalResponse) {
    for query in queries {
        let result = response.results.remove(&query.ref_id).unwrap_or_default();
        let RunnerState { panels, shapes, .. } = &mut *state;
        let Some(panel) = panels.get_mut(&query.ref_id) else {
            continue;
        };

        if let Some(error) = result.error {
            panel.state = LoadingState::Error;
            panel.error = Some(error);
            panel.frames.clear();
            continue;
        }

        let shape: Shape = result.frames.iter().map(DataFrame::shape).collect();
        if shapes.get(&query.ref_id) != Some(&shape) {
            panel.structure_rev += 1;
            shapes.insert(query.ref_id.clone(), shape);
        }

        panel.state = LoadingState::Done;
        panel.frames = result.frames;
    }
}
