//! Worker-pool lifecycle management.
//!
//! The orchestrator hosts connection services on a fixed-size pool of
//! worker threads, one io runtime per thread. It is built from three
//! pieces:
//!
//! - [`Receiver`]: owns the pool. Spawns workers, broadcasts
//!   [`ServiceCommand`]s to them, supervises their liveness and replaces
//!   workers that die, and drains the pool on shutdown.
//! - [`WorkerExecutor`]: runs inside each worker thread, processing
//!   commands and owning the per-site accept loops.
//! - [`serve`]: the accept/handle loop bound to one listener inside one
//!   worker. Connections are handled one at a time; parallelism comes from
//!   the pool, not from per-connection task spawning.
//!
//! Deployments follow the two-stage model: a service is precommitted
//! (optionally transferring state from the one it replaces), then either
//! committed with a fresh listener or swapped into the running accept loop.
//! [`ServiceCommand::PrepareAndCommit`] collapses both stages for initial
//! deployment.
//!
//! Failure policy: an error on one connection is logged and never affects
//! the accept loop; a fatal listener error marks only that worker dead, and
//! the receiver restores the pool on its next monitor cycle.

use std::{
    fmt::Debug,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
};

use futures_channel::oneshot::Sender as OSender;
use monoio::io::stream::Stream;
use service_async::Service;
use tracing::{debug, error, info, warn};

mod receiver;
mod runtime;
mod worker;

pub use receiver::Receiver;
pub use worker::{
    CommandError, Execute, ServiceCommand, ServiceCommandTask, ServiceSlot, WorkerExecutor,
};

/// A collection of results from broadcasting one command to every worker.
pub struct ResultGroup<T, E>(Vec<Result<T, E>>);

impl<T, E> From<Vec<Result<T, E>>> for ResultGroup<T, E> {
    fn from(value: Vec<Result<T, E>>) -> Self {
        Self(value)
    }
}

impl<T, E> From<ResultGroup<T, E>> for Vec<Result<T, E>> {
    fn from(value: ResultGroup<T, E>) -> Self {
        value.0
    }
}

impl<E> ResultGroup<(), E> {
    pub fn err(self) -> Result<(), E> {
        for r in self.0.into_iter() {
            r?;
        }
        Ok(())
    }
}

/// Observable worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No site deployed, or the worker is winding down.
    Idle,
    /// Parked on accept, waiting for a connection.
    Accepting,
    /// A connection is being handled.
    Handling,
    /// The worker hit a fatal resource error and stopped its loop.
    Dead,
}

const ACTIVITY_IDLE: u8 = 0;
const ACTIVITY_ACCEPTING: u8 = 1;
const ACTIVITY_HANDLING: u8 = 2;

/// Status cell shared between a worker thread and the owning receiver.
/// The dead flag is sticky: once a worker reports its own death only a
/// replacement clears it (by being a new cell).
#[derive(Clone, Default)]
pub struct WorkerStatus(Arc<StatusCell>);

#[derive(Default)]
struct StatusCell {
    activity: AtomicU8,
    dead: AtomicBool,
}

impl WorkerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkerState {
        if self.is_dead() {
            return WorkerState::Dead;
        }
        match self.0.activity.load(Ordering::Acquire) {
            ACTIVITY_IDLE => WorkerState::Idle,
            ACTIVITY_ACCEPTING => WorkerState::Accepting,
            _ => WorkerState::Handling,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.0.dead.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        !self.is_dead()
    }

    fn set_activity(&self, activity: u8) {
        self.0.activity.store(activity, Ordering::Release);
    }

    fn set_dead(&self) {
        self.0.dead.store(true, Ordering::Release);
    }
}

// Accept errors that refer to the connection being accepted rather than to
// the listener itself; the loop survives these.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Accept/handle loop bound to one listener.
///
/// Runs until the stop channel is cancelled or the listener fails fatally.
/// One connection is in flight at a time: the service call completes before
/// the next accept, so stopping a worker lets the current connection finish.
/// An accepted connection is never abandoned silently; a handler error is
/// reported per connection.
///
/// A fatal listener error (or listener exhaustion) marks the worker dead
/// and ends the loop; recovery is the owning receiver's decision.
pub async fn serve<S, Svc, A>(
    mut listener: S,
    handler: ServiceSlot<Svc>,
    status: WorkerStatus,
    mut stop: OSender<()>,
    done: OSender<()>,
) where
    S: Stream<Item = io::Result<A>> + 'static,
    Svc: Service<A> + 'static,
    Svc::Error: Debug,
    A: 'static,
{
    let mut cancellation = stop.cancellation();
    loop {
        status.set_activity(ACTIVITY_ACCEPTING);
        monoio::select! {
            _ = &mut cancellation => {
                info!("server is notified to stop");
                break;
            }
            accept_opt = listener.next() => {
                match accept_opt {
                    None => {
                        error!("listener closed, worker marked dead");
                        status.set_dead();
                        break;
                    }
                    Some(Err(e)) if is_transient_accept_error(&e) => {
                        warn!("accept connection failed: {e:?}");
                    }
                    Some(Err(e)) => {
                        error!("listener error: {e:?}, worker marked dead");
                        status.set_dead();
                        break;
                    }
                    Some(Ok(accept)) => {
                        status.set_activity(ACTIVITY_HANDLING);
                        let svc = handler.get_svc();
                        match svc.call(accept).await {
                            Ok(_) => {
                                debug!("connection complete");
                            }
                            Err(e) => {
                                error!("connection error: {e:?}");
                            }
                        }
                    }
                }
            }
        }
    }
    status.set_activity(ACTIVITY_IDLE);
    let _ = done.send(());
}
