//! Live query runner for interactive rule editing

mod runner;
mod transport;

pub use runner::{LiveQueryRunner, LoadingState, QueryPanel, RunnerSnapshot};
pub use transport::{
    EvalRequest, EvalResponse, EvalTransport, HttpEvalTransport, LocalEvalTransport, EVAL_PATH,
};
