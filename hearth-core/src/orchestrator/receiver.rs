//! Pool supervision.
//!
//! The [`Receiver`] is held by the main thread. It spawns the worker
//! threads, broadcasts deployment commands to them, and keeps the pool at
//! its configured size: a worker that reports itself dead (or whose thread
//! finished) is torn down and replaced on the next monitor cycle, and the
//! replacement is re-deployed with every site the receiver has on record.

use std::{
    cell::RefCell,
    collections::HashMap,
    num::NonZeroUsize,
    rc::Rc,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use futures_channel::mpsc::{channel, Sender};
use futures_util::sink::SinkExt;
use monoio::utils::bind_to_cpu_set;
use service_async::AsyncMakeService;
use tracing::{error, info, warn};

use super::{
    runtime::RuntimeWrapper,
    worker::{Execute, ServiceCommand, ServiceCommandTask, WorkerExecutor},
    ResultGroup, WorkerState, WorkerStatus,
};
use crate::{config::RuntimeConfig, AnyError, AnyResult};

/// Supervisor owning a fixed-size pool of workers.
///
/// Clones share the same pool, so one clone can drive the monitor loop
/// while another dispatches deployment commands. All clones live on the
/// main thread.
pub struct Receiver<F, LF> {
    runtime_config: Arc<RuntimeConfig>,
    shared: Rc<RefCell<Pool<F, LF>>>,
}

impl<F, LF> Clone for Receiver<F, LF> {
    fn clone(&self) -> Self {
        Self {
            runtime_config: self.runtime_config.clone(),
            shared: self.shared.clone(),
        }
    }
}

struct Pool<F, LF> {
    slots: Vec<WorkerSlot<F, LF>>,
    deployments: HashMap<Arc<String>, SiteDeployment<F, LF>>,
    next_worker_id: usize,
}

struct WorkerSlot<F, LF> {
    id: usize,
    tx: Sender<ServiceCommandTask<F, LF>>,
    status: WorkerStatus,
    join: JoinHandle<()>,
}

/// What the receiver knows about one site, kept so replacement workers can
/// be brought up to date.
struct SiteDeployment<F, LF> {
    staged: Option<F>,
    service: Option<F>,
    listener: Option<LF>,
}

impl<F, LF> SiteDeployment<F, LF> {
    fn empty() -> Self {
        Self {
            staged: None,
            service: None,
            listener: None,
        }
    }
}

impl<F, LF> Receiver<F, LF> {
    pub fn new(runtime_config: RuntimeConfig) -> Self {
        Self {
            runtime_config: Arc::new(runtime_config),
            shared: Rc::new(RefCell::new(Pool {
                slots: Vec::new(),
                deployments: HashMap::new(),
                next_worker_id: 0,
            })),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.runtime_config
    }

    pub fn worker_count(&self) -> usize {
        self.shared.borrow().slots.len()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared
            .borrow()
            .slots
            .iter()
            .map(|slot| slot.status.state())
            .collect()
    }

    fn cores(&self) -> Option<NonZeroUsize> {
        if self.runtime_config.cpu_affinity {
            std::thread::available_parallelism().ok()
        } else {
            None
        }
    }

    /// Close every command channel and wait for the workers to drain their
    /// in-flight connections, bounded by the grace period.
    pub async fn stop(&self) {
        info!("receiver stopping, draining {} workers", self.worker_count());
        let slots = {
            let mut pool = self.shared.borrow_mut();
            pool.deployments.clear();
            std::mem::take(&mut pool.slots)
        };
        let mut joins = Vec::with_capacity(slots.len());
        for slot in slots {
            // closing the command channel makes the worker drain itself
            drop(slot.tx);
            joins.push(slot.join);
        }
        let deadline =
            Instant::now() + self.runtime_config.graceful_shutdown() + Duration::from_secs(1);
        while !joins.iter().all(|join| join.is_finished()) {
            if Instant::now() >= deadline {
                warn!("workers did not finish within the grace period, detaching");
                return;
            }
            monoio::time::sleep(Duration::from_millis(50)).await;
        }
        for join in joins {
            let _ = join.join();
        }
        info!("receiver stopped");
    }
}

impl<F, LF> Receiver<F, LF>
where
    F: AsyncMakeService + Send + 'static,
    LF: Send + 'static,
{
    /// Bring the pool up to its configured size. Idempotent only in the
    /// sense that a non-empty pool is left alone.
    pub fn start<A>(&self)
    where
        ServiceCommand<F, LF>: Execute<A, F::Service>,
    {
        let cores = self.cores();
        let mut pool = self.shared.borrow_mut();
        if !pool.slots.is_empty() {
            warn!("receiver already started, ignoring");
            return;
        }
        let count = self.runtime_config.worker_threads;
        for _ in 0..count {
            let id = pool.next_worker_id;
            pool.next_worker_id += 1;
            let slot = Self::spawn_worker::<A>(&self.runtime_config, id, cores);
            pool.slots.push(slot);
        }
        info!("{count} workers started");
    }

    fn spawn_worker<A>(
        runtime_config: &Arc<RuntimeConfig>,
        worker_id: usize,
        cores: Option<NonZeroUsize>,
    ) -> WorkerSlot<F, LF>
    where
        ServiceCommand<F, LF>: Execute<A, F::Service>,
    {
        let (tx, rx) = channel(128);
        let status = WorkerStatus::new();
        let thread_status = status.clone();
        let runtime_config = runtime_config.clone();
        let grace = runtime_config.graceful_shutdown();
        let join = std::thread::Builder::new()
            .name(format!("hearth-worker-{worker_id}"))
            .spawn(move || {
                // bind thread to cpu core
                if let Some(cores) = cores {
                    let core = worker_id % cores;
                    if let Err(e) = bind_to_cpu_set([core]) {
                        warn!("bind thread {worker_id} to core {core} failed: {e}");
                    }
                }
                let mut runtime = RuntimeWrapper::from(runtime_config.as_ref());
                let executor = WorkerExecutor::<F::Service>::new(thread_status);
                runtime.block_on(executor.run::<F, LF, A>(rx, grace));
            })
            .expect("start worker thread {worker_id} failed");
        WorkerSlot {
            id: worker_id,
            tx,
            status,
            join,
        }
    }

    /// Broadcast a command to every worker and collect the per-worker
    /// results. On full success the receiver's deployment record is
    /// updated so future replacement workers see the same sites.
    pub async fn dispatch(&self, cmd: ServiceCommand<F, LF>) -> ResultGroup<(), AnyError>
    where
        F: Clone,
        LF: Clone,
    {
        let txs: Vec<_> = {
            let pool = self.shared.borrow();
            pool.slots.iter().map(|slot| slot.tx.clone()).collect()
        };
        let mut results = Vec::with_capacity(txs.len());
        for mut tx in txs {
            let (task, rx) = ServiceCommandTask::new(cmd.clone());
            match tx.feed(task).await {
                Ok(_) => match rx.await {
                    Ok(r) => results.push(r),
                    Err(e) => results.push(Err(e.into())),
                },
                Err(e) => results.push(Err(e.into())),
            }
        }
        if results.iter().all(|r| r.is_ok()) {
            self.record(&cmd);
        }
        results.into()
    }

    // Mirror the workers' site bookkeeping at pool level.
    fn record(&self, cmd: &ServiceCommand<F, LF>)
    where
        F: Clone,
        LF: Clone,
    {
        let mut pool = self.shared.borrow_mut();
        let deployments = &mut pool.deployments;
        match cmd {
            ServiceCommand::Precommit(name, factory) => {
                deployments
                    .entry(name.clone())
                    .or_insert_with(SiteDeployment::empty)
                    .staged = Some(factory.clone());
            }
            ServiceCommand::Update(name) => {
                if let Some(deployment) = deployments.get_mut(name) {
                    if let Some(staged) = deployment.staged.take() {
                        deployment.service = Some(staged);
                    }
                }
            }
            ServiceCommand::Commit(name, listener_factory) => {
                if let Some(deployment) = deployments.get_mut(name) {
                    if let Some(staged) = deployment.staged.take() {
                        deployment.service = Some(staged);
                    }
                    deployment.listener = Some(listener_factory.clone());
                }
            }
            ServiceCommand::PrepareAndCommit(name, factory, listener_factory) => {
                let deployment = deployments
                    .entry(name.clone())
                    .or_insert_with(SiteDeployment::empty);
                deployment.staged = None;
                deployment.service = Some(factory.clone());
                deployment.listener = Some(listener_factory.clone());
            }
            ServiceCommand::Abort(name) => {
                if let Some(deployment) = deployments.get_mut(name) {
                    deployment.staged = None;
                }
            }
            ServiceCommand::Remove(name) => {
                deployments.remove(name);
            }
        }
    }

    /// One liveness pass over the pool. Every dead worker is replaced by a
    /// freshly spawned one carrying the currently recorded deployments, so
    /// the pool size is restored within a single cycle.
    pub async fn monitor_once<A>(&self)
    where
        F: Clone,
        LF: Clone,
        ServiceCommand<F, LF>: Execute<A, F::Service>,
    {
        let dead: Vec<usize> = {
            let pool = self.shared.borrow();
            pool.slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.status.is_dead() || slot.join.is_finished())
                .map(|(index, _)| index)
                .collect()
        };
        if dead.is_empty() {
            return;
        }
        let cores = self.cores();
        for index in dead {
            let (old_id, new_id, tx, redeploys) = {
                let mut pool = self.shared.borrow_mut();
                let id = pool.next_worker_id;
                pool.next_worker_id += 1;
                let slot = Self::spawn_worker::<A>(&self.runtime_config, id, cores);
                let tx = slot.tx.clone();
                let old = std::mem::replace(&mut pool.slots[index], slot);
                let redeploys: Vec<(Arc<String>, F, LF)> = pool
                    .deployments
                    .iter()
                    .filter_map(|(name, deployment)| {
                        match (&deployment.service, &deployment.listener) {
                            (Some(factory), Some(listener)) => {
                                Some((name.clone(), factory.clone(), listener.clone()))
                            }
                            _ => None,
                        }
                    })
                    .collect();
                // dropping the old slot closes its command channel; the dead
                // worker's runtime winds down and releases its resources
                (old.id, id, tx, redeploys)
            };
            warn!("worker {old_id} found dead, replaced by worker {new_id}");
            for (name, factory, listener_factory) in redeploys {
                if let Err(e) = Self::deploy_to(
                    tx.clone(),
                    ServiceCommand::PrepareAndCommit(name.clone(), factory, listener_factory),
                )
                .await
                {
                    error!("re-deploying {name} to worker {new_id} failed: {e:?}");
                }
            }
        }
    }

    async fn deploy_to(
        mut tx: Sender<ServiceCommandTask<F, LF>>,
        cmd: ServiceCommand<F, LF>,
    ) -> AnyResult<()> {
        let (task, rx) = ServiceCommandTask::new(cmd);
        tx.feed(task).await?;
        rx.await??;
        Ok(())
    }

    /// Timer-driven monitor loop, independent of connection handling.
    pub async fn supervise<A>(&self)
    where
        F: Clone,
        LF: Clone,
        ServiceCommand<F, LF>: Execute<A, F::Service>,
    {
        let interval = self.runtime_config.monitor_interval();
        loop {
            monoio::time::sleep(interval).await;
            self.monitor_once::<A>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use monoio::io::stream::Stream;
    use service_async::{AsyncMakeService, Service};

    use super::Receiver;
    use crate::{
        config::RuntimeConfig,
        orchestrator::{ServiceCommand, WorkerState},
    };

    struct MockConnection;

    // Yields a scripted number of connections, then either fails fatally or
    // parks forever.
    struct MockListener {
        remaining: usize,
        fail_after: bool,
    }

    impl Stream for MockListener {
        type Item = io::Result<MockConnection>;

        async fn next(&mut self) -> Option<Self::Item> {
            if self.remaining > 0 {
                self.remaining -= 1;
                return Some(Ok(MockConnection));
            }
            if self.fail_after {
                self.fail_after = false;
                return Some(Err(io::Error::new(io::ErrorKind::Other, "listener wrecked")));
            }
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[derive(Clone)]
    struct MockListenerFactory {
        connections: usize,
        // the first N built listeners fail fatally after their connections
        failing_builds: Arc<AtomicUsize>,
    }

    impl MockListenerFactory {
        fn new(connections: usize, failing_builds: usize) -> Self {
            Self {
                connections,
                failing_builds: Arc::new(AtomicUsize::new(failing_builds)),
            }
        }
    }

    impl AsyncMakeService for MockListenerFactory {
        type Service = MockListener;
        type Error = io::Error;

        async fn make_via_ref(
            &self,
            _old: Option<&Self::Service>,
        ) -> Result<Self::Service, Self::Error> {
            let fail_after = self
                .failing_builds
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Ok(MockListener {
                remaining: self.connections,
                fail_after,
            })
        }
    }

    // Listener factory whose build always fails, standing in for an
    // unavailable address.
    #[derive(Clone)]
    struct UnbindableListenerFactory;

    impl AsyncMakeService for UnbindableListenerFactory {
        type Service = MockListener;
        type Error = io::Error;

        async fn make_via_ref(
            &self,
            _old: Option<&Self::Service>,
        ) -> Result<Self::Service, Self::Error> {
            Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "address already in use",
            ))
        }
    }

    struct CountingService {
        hits: Arc<AtomicUsize>,
    }

    impl Service<MockConnection> for CountingService {
        type Response = ();
        type Error = Infallible;

        async fn call(&self, _conn: MockConnection) -> Result<Self::Response, Self::Error> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone)]
    struct CountingFactory {
        hits: Arc<AtomicUsize>,
    }

    impl AsyncMakeService for CountingFactory {
        type Service = CountingService;
        type Error = Infallible;

        async fn make_via_ref(
            &self,
            _old: Option<&Self::Service>,
        ) -> Result<Self::Service, Self::Error> {
            Ok(CountingService {
                hits: self.hits.clone(),
            })
        }
    }

    fn test_config(workers: usize) -> RuntimeConfig {
        RuntimeConfig {
            worker_threads: workers,
            cpu_affinity: false,
            graceful_shutdown_secs: 1,
            ..Default::default()
        }
    }

    fn site(name: &str) -> Arc<String> {
        Arc::new(name.to_string())
    }

    async fn settle() {
        monoio::time::sleep(Duration::from_millis(500)).await;
    }

    #[monoio::test(timer_enabled = true)]
    async fn pool_reaches_configured_size_and_serves() {
        let receiver: Receiver<CountingFactory, MockListenerFactory> =
            Receiver::new(test_config(3));
        receiver.start::<MockConnection>();
        assert_eq!(receiver.worker_count(), 3);
        assert!(receiver
            .worker_states()
            .iter()
            .all(|s| *s == WorkerState::Idle));

        let hits = Arc::new(AtomicUsize::new(0));
        receiver
            .dispatch(ServiceCommand::PrepareAndCommit(
                site("demo"),
                CountingFactory { hits: hits.clone() },
                MockListenerFactory::new(2, 0),
            ))
            .await
            .err()
            .unwrap();
        settle().await;

        assert_eq!(receiver.worker_count(), 3);
        assert!(receiver
            .worker_states()
            .iter()
            .all(|s| matches!(s, WorkerState::Accepting | WorkerState::Handling)));
        // every worker drained its scripted connections
        assert_eq!(hits.load(Ordering::SeqCst), 6);

        receiver.stop().await;
        assert_eq!(receiver.worker_count(), 0);
    }

    #[monoio::test(timer_enabled = true)]
    async fn dead_worker_is_replaced_and_redeployed() {
        let receiver: Receiver<CountingFactory, MockListenerFactory> =
            Receiver::new(test_config(2));
        receiver.start::<MockConnection>();

        let hits = Arc::new(AtomicUsize::new(0));
        receiver
            .dispatch(ServiceCommand::PrepareAndCommit(
                site("demo"),
                CountingFactory { hits: hits.clone() },
                // both initial listeners die after one connection
                MockListenerFactory::new(1, 2),
            ))
            .await
            .err()
            .unwrap();
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(receiver
            .worker_states()
            .iter()
            .all(|s| *s == WorkerState::Dead));

        receiver.monitor_once::<MockConnection>().await;
        settle().await;

        // pool size restored, replacements alive and re-deployed
        assert_eq!(receiver.worker_count(), 2);
        assert!(receiver
            .worker_states()
            .iter()
            .all(|s| matches!(s, WorkerState::Accepting | WorkerState::Handling)));
        assert_eq!(hits.load(Ordering::SeqCst), 4);

        receiver.stop().await;
    }

    #[monoio::test(timer_enabled = true)]
    async fn unavailable_listener_surfaces_at_dispatch() {
        let receiver: Receiver<CountingFactory, UnbindableListenerFactory> =
            Receiver::new(test_config(1));
        receiver.start::<MockConnection>();

        let hits = Arc::new(AtomicUsize::new(0));
        let result = receiver
            .dispatch(ServiceCommand::PrepareAndCommit(
                site("demo"),
                CountingFactory { hits },
                UnbindableListenerFactory,
            ))
            .await
            .err();
        assert!(result.is_err());
        // the failed deployment is not recorded, and the pool survives
        assert_eq!(receiver.worker_count(), 1);
        assert!(receiver.worker_states().iter().all(|s| *s == WorkerState::Idle));

        receiver.stop().await;
    }
}
