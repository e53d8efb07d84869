//! The capability to execute an activation without blocking the dispatcher.

use futures::future::BoxFuture;

/// Starts a prepared activation future and returns immediately.
///
/// The executor assumes nothing about the implementation beyond "eventually
/// runs and eventually returns"; panics inside the job are already contained
/// by the future handed over.
pub trait Runner: Send + Sync {
    fn run(&self, task: BoxFuture<'static, ()>);
}

/// The default runner: one detached Tokio task per activation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRunner;

impl Runner for TokioRunner {
    fn run(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}
