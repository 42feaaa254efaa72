//! Registry of in-flight operations keyed by logical resource.
//!
//! The first caller for a key runs the work. Callers arriving with the same
//! request arguments before the result is published wait for the same
//! outcome instead of issuing a second provider call, and push the run's
//! deadline out to their own. Callers with different arguments wait for the
//! run to settle and then start their own. The record is dropped in the same
//! critical section that publishes the result, once the work and every
//! provider call it dispatched have finished.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::time::timeout_at;
use tracing::{Instrument, debug, info_span};

use crate::error::VolumeError;
use crate::retry::WorkDeadline;
use crate::volume::CallContext;

/// Kind of operation guarded by the registry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OperationKind {
    /// Volume creation, keyed by name.
    Create,
    /// Volume deletion, keyed by id.
    Delete,
    /// Volume attachment, keyed by volume id.
    Attach,
    /// Volume detachment, keyed by volume id.
    Detach,
    /// Volume expansion, keyed by volume id.
    Resize,
}

impl OperationKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Attach => "attach",
            Self::Detach => "detach",
            Self::Resize => "resize",
        }
    }
}

/// Identifies one logical operation across retries.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct OperationKey {
    /// Operation kind.
    pub kind: OperationKind,
    /// Volume name or id the operation targets.
    pub resource: String,
}

impl OperationKey {
    /// Creates a key for `kind` on `resource`.
    #[must_use]
    pub fn new(kind: OperationKind, resource: impl ToString) -> Self {
        Self {
            kind,
            resource: resource.to_string(),
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.resource)
    }
}

type Outcome<T> = Option<Result<T, VolumeError>>;

struct Record<A, T> {
    args: A,
    outcome: watch::Receiver<Outcome<T>>,
    deadline: WorkDeadline,
}

type Records<A, T> = HashMap<OperationKey, Record<A, T>>;

enum Claim<T> {
    /// This caller leads or joined a run with matching arguments.
    Shared(watch::Receiver<Outcome<T>>),
    /// A run with different arguments holds the key.
    Busy(watch::Receiver<Outcome<T>>),
}

/// Shared registry of in-flight records keyed by [`OperationKey`].
///
/// `A` holds the request arguments compared on join and `T` the value the
/// work produces.
pub struct InFlightRegistry<A, T> {
    records: Arc<Mutex<Records<A, T>>>,
}

impl<A, T> Default for InFlightRegistry<A, T> {
    fn default() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<A, T> Clone for InFlightRegistry<A, T> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}

impl<A, T> fmt::Debug for InFlightRegistry<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("in_flight", &self.lock().len())
            .finish()
    }
}

impl<A, T> InFlightRegistry<A, T> {
    fn lock(&self) -> MutexGuard<'_, Records<A, T>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A, T> InFlightRegistry<A, T>
where
    A: Clone + PartialEq + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `work` for `key` with `args`, or joins the run already in flight.
    ///
    /// `work` is only invoked when this caller becomes the leader; it receives
    /// the run's deadline, which joiners with matching `args` extend. The work
    /// runs on its own task so the shared outcome is published even when every
    /// caller stops waiting. Every caller bounds its own wait by
    /// `ctx.deadline`.
    ///
    /// # Errors
    ///
    /// Returns the error produced by the shared work, or
    /// [`VolumeError::DeadlineExceeded`] when this caller's deadline passes
    /// first.
    pub async fn run<W, F>(
        &self,
        ctx: &CallContext,
        key: &OperationKey,
        args: &A,
        work: W,
    ) -> Result<T, VolumeError>
    where
        W: FnOnce(WorkDeadline) -> F,
        F: Future<Output = Result<T, VolumeError>> + Send + 'static,
    {
        let mut pending = Some(work);
        loop {
            match self.claim(ctx, key, args, &mut pending)? {
                Claim::Shared(receiver) => return Self::wait(ctx, key, receiver).await,
                Claim::Busy(receiver) => {
                    debug!(
                        request_id = %ctx.request_id,
                        operation = %key,
                        "operation in flight with other arguments, waiting for it to settle"
                    );
                    Self::wait_settled(ctx, key, receiver).await?;
                }
            }
        }
    }

    fn claim<W, F>(
        &self,
        ctx: &CallContext,
        key: &OperationKey,
        args: &A,
        pending: &mut Option<W>,
    ) -> Result<Claim<T>, VolumeError>
    where
        W: FnOnce(WorkDeadline) -> F,
        F: Future<Output = Result<T, VolumeError>> + Send + 'static,
    {
        let mut records = self.lock();
        if let Some(existing) = records.get(key) {
            if existing.args != *args {
                return Ok(Claim::Busy(existing.outcome.clone()));
            }
            existing.deadline.extend_to(ctx.deadline);
            debug!(request_id = %ctx.request_id, operation = %key, "joining in-flight operation");
            return Ok(Claim::Shared(existing.outcome.clone()));
        }

        let work = pending
            .take()
            .ok_or_else(|| VolumeError::Internal(format!("{key} was already started")))?;
        let deadline = WorkDeadline::new(ctx.deadline);
        let (sender, receiver) = watch::channel(None);
        records.insert(
            key.clone(),
            Record {
                args: args.clone(),
                outcome: receiver.clone(),
                deadline: deadline.clone(),
            },
        );
        drop(records);

        debug!(request_id = %ctx.request_id, operation = %key, "starting operation");
        let span = info_span!("operation", request_id = %ctx.request_id, key = %key);
        let job = work(deadline).instrument(span);
        let registry = self.clone();
        let owned_key = key.clone();
        tokio::spawn(async move {
            let outcome = tokio::spawn(job).await.unwrap_or_else(|err| {
                Err(VolumeError::Internal(format!("{owned_key} aborted: {err}")))
            });
            registry.publish(&owned_key, &sender, outcome);
        });
        Ok(Claim::Shared(receiver))
    }

    async fn wait(
        ctx: &CallContext,
        key: &OperationKey,
        mut receiver: watch::Receiver<Outcome<T>>,
    ) -> Result<T, VolumeError> {
        let waited = timeout_at(ctx.deadline, receiver.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(outcome)) => outcome.clone().unwrap_or_else(|| {
                Err(VolumeError::Internal(format!("{key} published no outcome")))
            }),
            Ok(Err(_closed)) => Err(VolumeError::Internal(format!(
                "{key} ended without publishing an outcome"
            ))),
            Err(_elapsed) => Err(VolumeError::DeadlineExceeded {
                operation: key.to_string(),
            }),
        }
    }

    async fn wait_settled(
        ctx: &CallContext,
        key: &OperationKey,
        mut receiver: watch::Receiver<Outcome<T>>,
    ) -> Result<(), VolumeError> {
        let waited = timeout_at(ctx.deadline, receiver.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(_settled)) => Ok(()),
            Ok(Err(_closed)) => Err(VolumeError::Internal(format!(
                "{key} ended without publishing an outcome"
            ))),
            Err(_elapsed) => Err(VolumeError::DeadlineExceeded {
                operation: key.to_string(),
            }),
        }
    }

    fn publish(
        &self,
        key: &OperationKey,
        sender: &watch::Sender<Outcome<T>>,
        outcome: Result<T, VolumeError>,
    ) {
        let mut records = self.lock();
        records.remove(key);
        sender.send_replace(Some(outcome));
    }
}
