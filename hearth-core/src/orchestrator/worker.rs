//! Worker-side command processing and per-site service deployment.
//!
//! A [`WorkerExecutor`] lives on one worker thread and keeps a
//! [`SiteContainer`] per deployed site. Each container holds the committed
//! service feeding the running accept loop plus an optional precommitted
//! service waiting to be promoted. The two-stage deployment lets a new
//! service version take over while state (connection pools, caches) is
//! transferred from the old one through
//! [`AsyncMakeService::make_via_ref`].

use std::{
    cell::UnsafeCell, collections::HashMap, fmt::Debug, io, rc::Rc, sync::Arc, time::Duration,
};

use futures_channel::{
    mpsc::Receiver as TaskReceiver,
    oneshot::{channel as ochannel, Receiver as OReceiver, Sender as OSender},
};
use futures_util::{future::join_all, stream::StreamExt};
use monoio::io::stream::Stream;
use service_async::{AsyncMakeService, Service};
use tracing::{debug, error, warn};

use super::{serve, WorkerStatus};
use crate::AnyError;

/// Manages the services deployed on one worker thread.
pub struct WorkerExecutor<S> {
    status: WorkerStatus,
    sites: Rc<UnsafeCell<HashMap<Arc<String>, SiteContainer<S>>>>,
}

impl<S> WorkerExecutor<S> {
    pub fn new(status: WorkerStatus) -> Self {
        Self {
            status,
            sites: Rc::new(UnsafeCell::new(HashMap::new())),
        }
    }

    pub fn status(&self) -> &WorkerStatus {
        &self.status
    }
}

enum SiteError {
    SiteLookupFailed,
    ServiceNotStaged,
    ServiceNotDeployed,
}

impl<S> WorkerExecutor<S> {
    // Lookup and clone the committed service.
    fn get_svc(&self, name: &Arc<String>) -> Option<Rc<S>> {
        let sites = unsafe { &*self.sites.get() };
        sites.get(name).and_then(|s| s.get_svc())
    }

    // Stage a service for the site, replacing any previous staging.
    fn precommit_svc(&self, name: Arc<String>, svc: S) {
        let sites = unsafe { &mut *self.sites.get() };
        let sh = sites.entry(name).or_insert_with(SiteContainer::new);
        let staged_slot = unsafe { &mut *sh.staged_service.get() };
        *staged_slot = Some(svc);
    }

    // Swap the staged service into the running accept loop.
    fn update_with_staged_svc(&self, name: &Arc<String>) -> Result<(), SiteError> {
        let sites = unsafe { &mut *self.sites.get() };
        let sh = sites.get_mut(name).ok_or(SiteError::SiteLookupFailed)?;

        let committed = sh
            .committed_service
            .as_mut()
            .ok_or(SiteError::ServiceNotDeployed)?;
        let staged_slot = unsafe { &mut *sh.staged_service.get() };
        let staged = staged_slot.take().ok_or(SiteError::ServiceNotStaged)?;

        committed.slot.update_svc(Rc::new(staged));
        Ok(())
    }

    // Promote the staged service into a fresh accept loop (site must not be
    // serving yet).
    fn deploy_staged_service(
        &self,
        name: &Arc<String>,
    ) -> Result<(ServiceSlot<S>, OSender<()>, OSender<()>), SiteError> {
        let sites = unsafe { &mut *self.sites.get() };
        let sh = sites.get_mut(name).ok_or(SiteError::SiteLookupFailed)?;
        let staged_slot = unsafe { &mut *sh.staged_service.get() };
        let staged = staged_slot.take().ok_or(SiteError::ServiceNotStaged)?;

        let (active, stop, done) = ActiveSite::create(staged);
        let slot = active.slot.clone();
        sh.committed_service = Some(active);
        Ok((slot, stop, done))
    }

    fn remove(&self, name: &Arc<String>) -> Result<(), SiteError> {
        let sites = unsafe { &mut *self.sites.get() };
        if sites.remove(name).is_none() {
            Err(SiteError::SiteLookupFailed)
        } else {
            Ok(())
        }
    }

    fn abort(&self, name: &Arc<String>) -> Result<(), SiteError> {
        let sites = unsafe { &mut *self.sites.get() };
        let sh = sites.get_mut(name).ok_or(SiteError::SiteLookupFailed)?;
        let staged_slot = unsafe { &mut *sh.staged_service.get() };
        *staged_slot = None;
        Ok(())
    }

    // Drop every site, which cancels the accept loops, then wait up to the
    // grace period for in-flight connections to finish.
    async fn drain(&self, grace: Duration) {
        let sites = unsafe { &mut *self.sites.get() };
        let mut done = Vec::new();
        for (_, site) in sites.drain() {
            if let Some(active) = site.committed_service {
                done.push(active.done);
            }
        }
        if done.is_empty() {
            return;
        }
        // the dropped stop receivers above already refuse further accepts
        if monoio::time::timeout(grace, join_all(done)).await.is_err() {
            warn!("grace period elapsed, abandoning in-flight connections");
        }
    }
}

/// Deployment state of one site on one worker.
pub struct SiteContainer<S> {
    committed_service: Option<ActiveSite<S>>,
    staged_service: UnsafeCell<Option<S>>,
}

struct ActiveSite<S> {
    slot: ServiceSlot<S>,
    // Dropping this cancels the site's accept loop.
    _stop: OReceiver<()>,
    // Resolves when the accept loop has fully wound down.
    done: OReceiver<()>,
}

impl<S> SiteContainer<S> {
    const fn new() -> Self {
        Self {
            committed_service: None,
            staged_service: UnsafeCell::new(None),
        }
    }

    fn get_svc(&self) -> Option<Rc<S>> {
        self.committed_service.as_ref().map(|h| h.slot.get_svc())
    }
}

impl<S> ActiveSite<S> {
    fn create(service: S) -> (Self, OSender<()>, OSender<()>) {
        let (stop_tx, stop_rx) = ochannel();
        let (done_tx, done_rx) = ochannel();
        (
            Self {
                slot: ServiceSlot::from(Rc::new(service)),
                _stop: stop_rx,
                done: done_rx,
            },
            stop_tx,
            done_tx,
        )
    }
}

/// Holds the deployed service; the accept loop reads through it, so
/// swapping the inner value hot-updates the site for subsequent
/// connections.
pub struct ServiceSlot<S>(Rc<UnsafeCell<Rc<S>>>);

impl<S> Clone for ServiceSlot<S> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<S> From<Rc<S>> for ServiceSlot<S> {
    fn from(value: Rc<S>) -> Self {
        Self(Rc::new(UnsafeCell::new(value)))
    }
}

impl<S> ServiceSlot<S> {
    pub fn update_svc(&self, shared_svc: Rc<S>) {
        unsafe { *self.0.get() = shared_svc };
    }

    pub fn get_svc(&self) -> Rc<S> {
        unsafe { &*self.0.get() }.clone()
    }
}

/// Deployment actions broadcast to workers. Cheap to clone.
#[derive(Clone)]
pub enum ServiceCommand<F, LF> {
    /// Stage a service for the site, transferring state from the running
    /// instance when there is one.
    Precommit(Arc<String>, F),
    /// Swap the staged service into the running accept loop.
    Update(Arc<String>),
    /// Promote the staged service and start serving it on a listener built
    /// from the factory.
    Commit(Arc<String>, LF),
    /// Stage, promote and serve in one step (initial deployment).
    PrepareAndCommit(Arc<String>, F, LF),
    /// Throw away a staged service.
    Abort(Arc<String>),
    /// Tear the site down entirely.
    Remove(Arc<String>),
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError<SE, LE> {
    #[error("build service error: {0:?}")]
    BuildService(SE),
    #[error("build listener error: {0:?}")]
    BuildListener(LE),
    #[error("site not exist")]
    SiteNotExist,
    #[error("preparation not exist")]
    PreparationNotExist,
    #[error("previous handler not exist")]
    PreviousHandlerNotExist,
}

impl<SE, LE> From<SiteError> for CommandError<SE, LE> {
    fn from(value: SiteError) -> Self {
        match value {
            SiteError::SiteLookupFailed => Self::SiteNotExist,
            SiteError::ServiceNotStaged => Self::PreparationNotExist,
            SiteError::ServiceNotDeployed => Self::PreviousHandlerNotExist,
        }
    }
}

/// A [`ServiceCommand`] paired with the channel carrying its result back to
/// the receiver.
pub struct ServiceCommandTask<F, LF> {
    cmd: ServiceCommand<F, LF>,
    result: OSender<Result<(), AnyError>>,
}

impl<F, LF> ServiceCommandTask<F, LF> {
    pub fn new(cmd: ServiceCommand<F, LF>) -> (Self, OReceiver<Result<(), AnyError>>) {
        let (tx, rx) = ochannel();
        (Self { cmd, result: tx }, rx)
    }
}

/// Execution of a command against one worker's executor.
pub trait Execute<A, S> {
    type Error: Into<AnyError>;
    fn execute(
        self,
        executor: &WorkerExecutor<S>,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>>;
}

impl<F, LF, A, S> Execute<A, S> for ServiceCommand<F, LF>
where
    F: AsyncMakeService<Service = S>,
    F::Error: Debug + Send + Sync + 'static,
    LF: AsyncMakeService,
    LF::Service: Stream<Item = io::Result<A>> + 'static,
    LF::Error: Debug + Send + Sync + 'static,
    S: Service<A> + 'static,
    S::Error: Debug,
    A: 'static,
{
    type Error = CommandError<F::Error, LF::Error>;
    async fn execute(self, executor: &WorkerExecutor<S>) -> Result<(), Self::Error> {
        match self {
            ServiceCommand::Precommit(name, factory) => {
                let current_svc = executor.get_svc(&name);
                let svc = factory
                    .make_via_ref(current_svc.as_deref())
                    .await
                    .map_err(CommandError::BuildService)?;
                executor.precommit_svc(name, svc);
                Ok(())
            }
            ServiceCommand::Update(name) => {
                executor.update_with_staged_svc(&name)?;
                Ok(())
            }
            ServiceCommand::Commit(name, listener_factory) => {
                let listener = listener_factory
                    .make()
                    .await
                    .map_err(CommandError::BuildListener)?;
                let (slot, stop, done) = executor.deploy_staged_service(&name)?;
                monoio::spawn(serve(listener, slot, executor.status.clone(), stop, done));
                Ok(())
            }
            ServiceCommand::PrepareAndCommit(name, factory, listener_factory) => {
                let svc = factory.make().await.map_err(CommandError::BuildService)?;
                let listener = listener_factory
                    .make()
                    .await
                    .map_err(CommandError::BuildListener)?;
                executor.precommit_svc(name.clone(), svc);
                let (slot, stop, done) = executor.deploy_staged_service(&name)?;
                monoio::spawn(serve(listener, slot, executor.status.clone(), stop, done));
                Ok(())
            }
            ServiceCommand::Abort(name) => {
                executor.abort(&name)?;
                Ok(())
            }
            ServiceCommand::Remove(name) => {
                executor.remove(&name)?;
                Ok(())
            }
        }
    }
}

impl<S> WorkerExecutor<S> {
    /// Main loop of a worker thread: process commands until the receiver
    /// closes the channel, then drain the deployed sites within the grace
    /// period.
    pub async fn run<F, LF, A>(
        &self,
        mut rx: TaskReceiver<ServiceCommandTask<F, LF>>,
        grace: Duration,
    ) where
        ServiceCommand<F, LF>: Execute<A, S>,
    {
        while let Some(task) = rx.next().await {
            if let Err(e) = task
                .result
                .send(task.cmd.execute(self).await.map_err(Into::into))
            {
                error!("unable to send back result: {e:?}");
            }
        }
        debug!("command channel closed, worker draining");
        self.drain(grace).await;
    }
}
