//! Fan-out/fan-in task group
//!
//! [`ParallelExecutor`] runs named operations concurrently on the tokio
//! runtime. A failing operation never cancels its siblings: every operation
//! is allowed to finish, and failures surface only when results are
//! consumed.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, warn};

/// Handle identifying one spawned operation, ordered by spawn time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(usize);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why an operation did not produce a value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError<E> {
    /// The operation returned an error
    #[error("{0}")]
    Failed(E),

    /// The operation panicked
    #[error("operation panicked: {0}")]
    Panicked(String),

    /// The runtime cancelled the operation
    #[error("operation was cancelled")]
    Cancelled,
}

impl<E> OperationError<E> {
    /// The operation's own error, if it returned one
    pub fn into_failed(self) -> Option<E> {
        match self {
            OperationError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// A completed operation
#[derive(Debug)]
pub struct Outcome<T, E> {
    pub id: OperationId,
    pub name: String,
    pub result: Result<T, OperationError<E>>,
}

impl<T, E> Outcome<T, E> {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// First failure of a joined group
#[derive(Error, Debug)]
#[error("{name} failed ({failed} of {total} operations failed): {error}")]
pub struct GroupError<E> {
    pub name: String,
    pub error: OperationError<E>,
    pub failed: usize,
    pub total: usize,
}

/// Every outcome of a joined group
#[derive(Debug)]
pub struct JoinReport<T, E> {
    /// Outcomes in spawn order
    outcomes: Vec<Outcome<T, E>>,
    /// First failure in completion order
    first_error: Option<OperationId>,
}

impl<T, E> JoinReport<T, E> {
    /// Outcomes in spawn order
    #[must_use]
    pub fn outcomes(&self) -> &[Outcome<T, E>] {
        &self.outcomes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.first_error.is_none()
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_ok()).count()
    }

    /// The failure that completed first
    #[must_use]
    pub fn first_error(&self) -> Option<&Outcome<T, E>> {
        self.first_error
            .and_then(|id| self.outcomes.iter().find(|o| o.id == id))
    }

    /// Values of the operations that succeeded, by name
    pub fn succeeded(&self) -> impl Iterator<Item = (&str, &T)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|v| (o.name.as_str(), v)))
    }

    pub fn into_outcomes(self) -> Vec<Outcome<T, E>> {
        self.outcomes
    }

    /// All values in spawn order, or the first failure
    ///
    /// # Errors
    /// Returns the first failure in completion order
    pub fn into_result(self) -> Result<Vec<(String, T)>, GroupError<E>> {
        let total = self.outcomes.len();
        let failed = self.failed_count();

        let position = self
            .first_error
            .and_then(|id| self.outcomes.iter().position(|o| o.id == id));
        let mut outcomes = self.outcomes;

        if let Some(position) = position {
            let outcome = outcomes.swap_remove(position);
            if let Err(error) = outcome.result {
                return Err(GroupError {
                    name: outcome.name,
                    error,
                    failed,
                    total,
                });
            }
        }

        Ok(outcomes
            .into_iter()
            .filter_map(|o| o.result.ok().map(|v| (o.name, v)))
            .collect())
    }
}

/// A group of concurrently running operations.
///
/// Each operation runs on its own tokio task. By default there is no cap on
/// how many run at once; [`ParallelExecutor::with_parallelism`] adds one.
///
/// Dropping a group before [`ParallelExecutor::join`] detaches the
/// outstanding operations. They keep running but their results are lost.
pub struct ParallelExecutor<T: 'static, E: 'static> {
    semaphore: Option<Arc<Semaphore>>,
    set: JoinSet<Result<T, E>>,
    names: Vec<String>,
    ids: HashMap<task::Id, OperationId>,
}

impl<T, E> Default for ParallelExecutor<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> ParallelExecutor<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates a group with no concurrency cap
    #[must_use]
    pub fn new() -> Self {
        Self {
            semaphore: None,
            set: JoinSet::new(),
            names: Vec::new(),
            ids: HashMap::new(),
        }
    }

    /// Creates a group running at most `max_parallelism` operations at once
    #[must_use]
    pub fn with_parallelism(max_parallelism: usize) -> Self {
        Self {
            semaphore: Some(Arc::new(Semaphore::new(max_parallelism.max(1)))),
            set: JoinSet::new(),
            names: Vec::new(),
            ids: HashMap::new(),
        }
    }

    /// Number of operations not yet consumed
    #[must_use]
    pub fn pending(&self) -> usize {
        self.set.len()
    }

    /// Schedule `operation` without waiting for it
    pub fn spawn<F>(&mut self, name: impl Into<String>, operation: F) -> OperationId
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let id = OperationId(self.names.len());
        let name = name.into();
        let semaphore = self.semaphore.clone();

        let handle = self.set.spawn(async move {
            // Hold onto the permit until the operation finishes
            let _permit = match semaphore {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            operation.await
        });

        debug!(operation = %name, id = %id, "spawned operation");
        self.ids.insert(handle.id(), id);
        self.names.push(name);
        id
    }

    /// Wait for the next operation to complete, in completion order
    pub async fn next(&mut self) -> Option<Outcome<T, E>> {
        let (id, result) = loop {
            let joined = self.set.join_next_with_id().await?;

            let (task_id, result) = match joined {
                Ok((task_id, Ok(value))) => (task_id, Ok(value)),
                Ok((task_id, Err(e))) => (task_id, Err(OperationError::Failed(e))),
                Err(join_error) => (join_error.id(), Err(join_error_reason(join_error))),
            };

            let Some(id) = self.ids.remove(&task_id) else {
                warn!(task = %task_id, "joined a task that was never registered, skipping");
                continue;
            };
            break (id, result);
        };
        let name = self.names[id.0].clone();

        match &result {
            Ok(_) => debug!(operation = %name, id = %id, "operation completed"),
            Err(e) => warn!(operation = %name, id = %id, error = %DisplayKind(e), "operation failed"),
        }

        Some(Outcome { id, name, result })
    }

    /// Wait for every remaining operation.
    ///
    /// Outcomes already consumed through [`ParallelExecutor::next`] are not
    /// part of the report.
    pub async fn join(mut self) -> JoinReport<T, E> {
        let mut outcomes = Vec::with_capacity(self.set.len());
        let mut first_error = None;

        while let Some(outcome) = self.next().await {
            if first_error.is_none() && !outcome.is_ok() {
                first_error = Some(outcome.id);
            }
            outcomes.push(outcome);
        }

        outcomes.sort_by_key(|o| o.id);
        JoinReport {
            outcomes,
            first_error,
        }
    }
}

impl<T: 'static, E: 'static> Drop for ParallelExecutor<T, E> {
    fn drop(&mut self) {
        if !self.set.is_empty() {
            warn!(
                outstanding = self.set.len(),
                "parallel group dropped before join, detaching operations"
            );
            self.set.detach_all();
        }
    }
}

fn join_error_reason<E>(join_error: JoinError) -> OperationError<E> {
    if join_error.is_cancelled() {
        return OperationError::Cancelled;
    }
    OperationError::Panicked(panic_message(join_error.into_panic()))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Describes an operation error without requiring `E: Display`
struct DisplayKind<'a, E>(&'a OperationError<E>);

impl<E> fmt::Display for DisplayKind<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            OperationError::Failed(_) => f.write_str("returned an error"),
            OperationError::Panicked(msg) => write!(f, "panicked: {msg}"),
            OperationError::Cancelled => f.write_str("cancelled"),
        }
    }
}
