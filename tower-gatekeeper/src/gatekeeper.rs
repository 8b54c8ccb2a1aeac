use std::sync::Arc;
use std::time::Duration;

use delay_store::ArenaDelayStore;
use delay_store::Clock;
use delay_store::DelayStore;
use delay_store::MonotonicClock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CompiledConfig;
use crate::config::GatekeeperConfig;
use crate::engine::AdmissionEngine;
use crate::error::ConfigError;
use crate::error::StartupError;
use crate::layer::GatekeeperLayer;
use crate::listener::ControlListener;
use crate::publisher::AccountingPublisher;
use crate::registry::MasterRegistry;
use crate::sweeper::SWEEP_BATCH;
use crate::sweeper::SWEEP_PERIOD;
use crate::sweeper::Sweeper;
use crate::transport::Connector;
use crate::transport::ZmqConnector;

/// Position of a worker in the host's pool.
///
/// Worker 0 is the designated worker: it alone listens to the governors and
/// sweeps the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WorkerIndex(pub usize);

impl WorkerIndex {
    pub const DESIGNATED: WorkerIndex = WorkerIndex(0);

    pub fn is_designated(self) -> bool {
        self == Self::DESIGNATED
    }
}

/// Tuning for the designated worker's background tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    pub sweep_period: Duration,
    pub sweep_batch: usize,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            sweep_period: SWEEP_PERIOD,
            sweep_batch: SWEEP_BATCH,
        }
    }
}

/// Everything one worker needs for admission control.
///
/// Built once per worker with [`Gatekeeper::start`]; workers that share a
/// store pass the same `Arc`. Background tasks stop on
/// [`shutdown`](Gatekeeper::shutdown) or when the context is dropped.
#[derive(Debug)]
pub struct Gatekeeper<D>
where
    D: ?Sized,
{
    compiled: CompiledConfig,
    engine: Arc<AdmissionEngine<D>>,
    worker: WorkerIndex,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Gatekeeper<ArenaDelayStore> {
    /// Starts one worker talking ZeroMQ to its governors.
    ///
    /// Every worker of a host must be given the same `store`; only the
    /// designated worker writes to it. Size it with
    /// [`ArenaDelayStore::with_arena_size`] from `config.arena_size`.
    pub async fn connect(
        config: &GatekeeperConfig,
        store: Arc<ArenaDelayStore>,
        worker: WorkerIndex,
    ) -> Result<Self, StartupError> {
        let compiled = config.compile()?;
        tracing::info!(
            worker = worker.0,
            arena_size = store.capacity(),
            governors = compiled.registry.len(),
            "starting gatekeeper"
        );
        Self::start(
            compiled,
            store,
            Arc::new(MonotonicClock::new()),
            &ZmqConnector,
            worker,
            StartOptions::default(),
        )
        .await
    }
}

impl<D> Gatekeeper<D>
where
    D: DelayStore + ?Sized + 'static,
{
    /// Connects every governor and spawns this worker's background tasks.
    ///
    /// Every worker publishes accounting; only the designated worker
    /// subscribes to control updates, runs the sweeper and asks for a resync.
    pub async fn start<C: Connector>(
        compiled: CompiledConfig,
        store: Arc<D>,
        clock: Arc<dyn Clock>,
        connector: &C,
        worker: WorkerIndex,
        options: StartOptions,
    ) -> Result<Self, StartupError> {
        let shutdown = CancellationToken::new();
        // Stops whatever was spawned if a later connect fails.
        let guard = shutdown.clone().drop_guard();
        let mut tasks = Vec::new();

        let mut publishers = Vec::with_capacity(compiled.registry.len());
        for endpoint in compiled.registry.iter() {
            let sink = connector
                .accounting(endpoint)
                .await
                .map_err(|source| StartupError::Connect {
                    address: endpoint.accounting_address().to_string(),
                    source,
                })?;
            let (publisher, task) =
                AccountingPublisher::spawn(sink, compiled.accounting_queue, shutdown.child_token());
            publishers.push(publisher);
            tasks.push(task);
        }

        if worker.is_designated() {
            for (endpoint, publisher) in compiled.registry.iter().zip(&publishers) {
                let source = connector
                    .control(endpoint)
                    .await
                    .map_err(|source| StartupError::Connect {
                        address: endpoint.control_address().to_string(),
                        source,
                    })?;
                let listener = ControlListener::new(Arc::clone(&store), endpoint.clone());
                tasks.push(tokio::spawn(listener.run(source, shutdown.child_token())));

                if compiled.resync_on_start {
                    for domain in endpoint.domains() {
                        publisher.request_resync(domain);
                    }
                }
            }

            let sweeper = Sweeper::new(Arc::clone(&store), Arc::clone(&clock))
                .with_period(options.sweep_period)
                .with_batch(options.sweep_batch);
            tasks.push(sweeper.spawn(shutdown.child_token()));
        }

        guard.disarm();
        tracing::info!(worker = worker.0, tasks = tasks.len(), "gatekeeper started");

        Ok(Self {
            engine: Arc::new(AdmissionEngine::new(store, clock, publishers)),
            compiled,
            worker,
            shutdown,
            tasks,
        })
    }

    /// Layer enforcing the location called `name`.
    pub fn layer(&self, name: &str) -> Result<GatekeeperLayer<D>, ConfigError> {
        let location = self.compiled.location(name)?;
        Ok(GatekeeperLayer::new(Arc::clone(&self.engine), location))
    }

    pub fn store(&self) -> &Arc<D> {
        self.engine.store()
    }

    pub fn engine(&self) -> &Arc<AdmissionEngine<D>> {
        &self.engine
    }

    pub fn registry(&self) -> &MasterRegistry {
        &self.compiled.registry
    }

    pub fn worker(&self) -> WorkerIndex {
        self.worker
    }

    /// Stops the background tasks and waits for them.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(err) = task.await {
                tracing::warn!(%err, "gatekeeper task failed");
            }
        }
        tracing::info!(worker = self.worker.0, "gatekeeper stopped");
    }
}

impl<D> Drop for Gatekeeper<D>
where
    D: ?Sized,
{
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
