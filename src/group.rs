//! Bounded concurrency groups for fanning out sends.
//!
//! [`WaitGroup`] starts units as soon as they are submitted and collects every
//! error. [`RunGroup`] holds units until [`RunGroup::run_and_wait`] and stops
//! starting new ones after the first failure. Both run one tokio task per unit
//! and admit at most `limit` of them at a time.

use std::future::Future;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Sender;
use crate::error::{Error, combine_errors};
use crate::request::Request;
use crate::util::{lock_unpoisoned, panic_message};

pub const DEFAULT_WAIT_GROUP_LIMIT: usize = 8;
pub const DEFAULT_RUN_GROUP_LIMIT: usize = 32;

/// A unit of work a group can run: a single request or a composite call.
pub trait Sendable<S>: Send + 'static {
    fn send_via(
        self,
        sender: S,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

impl<S, T> Sendable<S> for Request<T>
where
    S: Sender + 'static,
    T: Send + 'static,
{
    /// Sends and runs completion listeners; the outcome is the error left
    /// after the listeners ran.
    fn send_via(
        self,
        sender: S,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            let mut response = self.send(&sender, &cancel).await;
            match response.take_error() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }
}

pub struct FnUnit<F>(F);

/// Wraps a closure as a unit, for calls made of several requests or with
/// logic before and after them.
pub fn unit_fn<S, F, Fut>(call: F) -> FnUnit<F>
where
    F: FnOnce(S, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    FnUnit(call)
}

impl<S, F, Fut> Sendable<S> for FnUnit<F>
where
    F: FnOnce(S, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn send_via(
        self,
        sender: S,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        (self.0)(sender, cancel)
    }
}

// Cancellation wins over a free permit: a canceled group never starts a unit.
async fn acquire_permit(
    permits: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, Error> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::ContextCanceled),
        permit = Arc::clone(permits).acquire_owned() => {
            permit.map_err(|_| Error::ConcurrencyLimitClosed)
        }
    }
}

async fn run_guarded<F>(unit: F) -> Result<(), Error>
where
    F: Future<Output = Result<(), Error>>,
{
    match AssertUnwindSafe(unit).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(Error::UnitPanicked {
            message: panic_message(payload.as_ref()),
        }),
    }
}

struct WaitState {
    outstanding: usize,
    errors: Vec<Error>,
}

struct WaitShared<S> {
    sender: S,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    state: Mutex<WaitState>,
    idle: Notify,
}

impl<S> WaitShared<S> {
    fn finish(&self, outcome: Result<(), Error>) {
        let mut state = lock_unpoisoned(&self.state);
        if let Err(error) = outcome {
            state.errors.push(error);
        }
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.idle.notify_waiters();
        }
    }
}

/// Eager group: every submitted unit starts right away and every error is kept.
pub struct WaitGroup<S> {
    shared: Arc<WaitShared<S>>,
}

impl<S> Clone for WaitGroup<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> WaitGroup<S>
where
    S: Sender + Clone + 'static,
{
    pub fn new(sender: S, cancel: CancellationToken) -> Self {
        Self::with_limit(sender, cancel, DEFAULT_WAIT_GROUP_LIMIT)
    }

    pub fn with_limit(sender: S, cancel: CancellationToken, limit: usize) -> Self {
        Self {
            shared: Arc::new(WaitShared {
                sender,
                cancel,
                permits: Arc::new(Semaphore::new(limit.max(1))),
                state: Mutex::new(WaitState {
                    outstanding: 0,
                    errors: Vec::new(),
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Counts the unit, then spawns it. Safe to call from a completion
    /// listener of another unit in this group.
    pub fn send<U: Sendable<S>>(&self, unit: U) {
        lock_unpoisoned(&self.shared.state).outstanding += 1;
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            match acquire_permit(&shared.permits, &shared.cancel).await {
                Ok(_permit) => {
                    let sender = shared.sender.clone();
                    let cancel = shared.cancel.clone();
                    let outcome =
                        run_guarded(async move { unit.send_via(sender, cancel).await }).await;
                    shared.finish(outcome);
                }
                Err(error) => shared.finish(Err(error)),
            }
        });
    }

    pub fn outstanding(&self) -> usize {
        lock_unpoisoned(&self.shared.state).outstanding
    }

    /// Waits until no unit is outstanding. Returns the single error as-is, or
    /// [`Error::Multiple`] when several units failed. Errors are drained, so
    /// the group can be reused.
    pub async fn wait(&self) -> Result<(), Error> {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = lock_unpoisoned(&self.shared.state);
                if state.outstanding == 0 {
                    let errors = mem::take(&mut state.errors);
                    return combine_errors(errors);
                }
            }
            notified.await;
        }
    }
}

struct RunState {
    started: bool,
    halted: bool,
    outstanding: usize,
    pending: Vec<BoxFuture<'static, Result<(), Error>>>,
    first_error: Option<Error>,
}

struct RunShared<S> {
    sender: S,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    state: Mutex<RunState>,
    idle: Notify,
}

impl<S> RunShared<S> {
    fn is_halted(&self) -> bool {
        lock_unpoisoned(&self.state).halted
    }

    fn finish(&self, outcome: Result<(), Error>) {
        let mut state = lock_unpoisoned(&self.state);
        if let Err(error) = outcome {
            if state.first_error.is_none() {
                debug!(error = %error, "run group halted by first error");
                state.first_error = Some(error);
            }
            state.halted = true;
        }
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.idle.notify_waiters();
        }
    }
}

/// Deferred, fail-fast group: units wait for [`RunGroup::run_and_wait`], and
/// after the first failure no further unit starts.
pub struct RunGroup<S> {
    shared: Arc<RunShared<S>>,
}

impl<S> Clone for RunGroup<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> RunGroup<S>
where
    S: Sender + Clone + 'static,
{
    pub fn new(sender: S, cancel: CancellationToken) -> Self {
        Self::with_limit(sender, cancel, DEFAULT_RUN_GROUP_LIMIT)
    }

    pub fn with_limit(sender: S, cancel: CancellationToken, limit: usize) -> Self {
        Self {
            shared: Arc::new(RunShared {
                sender,
                cancel,
                permits: Arc::new(Semaphore::new(limit.max(1))),
                state: Mutex::new(RunState {
                    started: false,
                    halted: false,
                    outstanding: 0,
                    pending: Vec::new(),
                    first_error: None,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Registers a unit. Before [`RunGroup::run_and_wait`] it is held back;
    /// afterwards it starts immediately. Ignored once the group has halted.
    pub fn add<U: Sendable<S>>(&self, unit: U) {
        let sender = self.shared.sender.clone();
        let cancel = self.shared.cancel.clone();
        let job: BoxFuture<'static, Result<(), Error>> =
            Box::pin(async move { unit.send_via(sender, cancel).await });
        let start_now = {
            let mut state = lock_unpoisoned(&self.shared.state);
            if state.halted {
                return;
            }
            state.outstanding += 1;
            if !state.started {
                state.pending.push(job);
                return;
            }
            job
        };
        self.spawn(start_now);
    }

    fn spawn(&self, job: BoxFuture<'static, Result<(), Error>>) {
        let shared = Arc::clone(&self.shared);
        // The permit is held through `finish` so a queued unit observes the
        // halt before it can start.
        tokio::spawn(async move {
            match acquire_permit(&shared.permits, &shared.cancel).await {
                Ok(_permit) if shared.is_halted() => shared.finish(Ok(())),
                Ok(_permit) => {
                    let outcome = run_guarded(job).await;
                    shared.finish(outcome);
                }
                Err(error) => shared.finish(Err(error)),
            }
        });
    }

    /// Starts every held unit and waits for all started units to settle.
    /// Returns the first error, if any.
    pub async fn run_and_wait(&self) -> Result<(), Error> {
        let pending = {
            let mut state = lock_unpoisoned(&self.shared.state);
            state.started = true;
            mem::take(&mut state.pending)
        };
        for job in pending {
            self.spawn(job);
        }

        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = lock_unpoisoned(&self.shared.state);
                if state.outstanding == 0 {
                    return match state.first_error.take() {
                        Some(error) => Err(error),
                        None => Ok(()),
                    };
                }
            }
            notified.await;
        }
    }
}
