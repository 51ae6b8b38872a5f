//! Chain message handler
//!
//! Sits between the network router and the chain's engines. Inbound messages
//! are split between a sync queue (consensus messages, handled under the
//! consensus lock) and an async queue (application messages, handled by a
//! worker pool without the lock). A third dispatcher turns VM
//! notifications, the gossip ticker and registered timeouts into internal
//! messages.
//!
//! Lifecycle: `start` selects and starts the first engine, then spawns the
//! three dispatchers. `stop` closes both queues and signals the dispatchers.
//! Once all three exited, the current engine is shut down and
//! [`Handler::stopped`] resolves. A handler is never restarted.

mod dispatch;


use crate::config::HandlerConfig;
use crate::context::{ConsensusContext, State};
use crate::engine::{Engine, EngineManager};
use crate::error::{ChainError, ChainResult};
use crate::ids::NodeId;
use crate::message::{Message, VmNotification};
use crate::metrics::HandlerMetrics;
use crate::queue::MessageQueue;
use crate::tracker::ResourceTracker;
use crate::validators::{Subnet, SubnetConnector, ValidatorSet};
use crate::worker::WorkerPool;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

/// Number of dispatchers that must exit before the handler shuts down
const NUM_DISPATCHERS_TO_CLOSE: usize = 3;

type OnStopped = Box<dyn FnOnce() + Send + 'static>;

/// Receivers drained by the chan dispatcher
struct ChanSources {
    msg_from_vm: mpsc::Receiver<VmNotification>,
    timeouts: mpsc::Receiver<()>,
}

/// Passes messages from the network and the VM to the chain's engines
pub struct Handler {
    ctx: Arc<ConsensusContext>,
    config: HandlerConfig,
    metrics: HandlerMetrics,

    /// Validators of the chain's subnet
    validators: Arc<dyn ValidatorSet>,
    subnet: Arc<dyn Subnet>,
    subnet_connector: Arc<dyn SubnetConnector>,
    /// Tracks cpu usage caused by each peer
    resource_tracker: Arc<dyn ResourceTracker>,

    engine_manager: OnceCell<Arc<EngineManager>>,
    /// Runs on a blocking thread once the handler finished shutting down
    on_stopped: Mutex<Option<OnStopped>>,

    sync_queue: MessageQueue,
    async_queue: MessageQueue,
    async_pool: WorkerPool,

    chan_sources: Mutex<Option<ChanSources>>,
    timeouts: mpsc::Sender<()>,
    preempt_timeouts: watch::Receiver<bool>,
    /// Set once the Avalanche frontier was gossiped after linearization
    linearized_gossip_sent: AtomicBool,

    /// Whether panics in dispatched work stop the chain instead of unwinding
    recover_panic: AtomicBool,
    stop_called: AtomicBool,
    closing: watch::Sender<bool>,
    dispatchers_closed: AtomicUsize,
    /// Set when this handler and its engine are done shutting down
    closed: watch::Sender<bool>,
}

impl Handler {
    /// Create the handler of one chain. The engine manager is installed
    /// separately with [`Handler::set_engine_manager`] before `start`.
    pub fn new(
        ctx: Arc<ConsensusContext>,
        config: HandlerConfig,
        validators: Arc<dyn ValidatorSet>,
        msg_from_vm: mpsc::Receiver<VmNotification>,
        resource_tracker: Arc<dyn ResourceTracker>,
        subnet_connector: Arc<dyn SubnetConnector>,
        subnet: Arc<dyn Subnet>,
    ) -> ChainResult<Arc<Self>> {
        config.validate()?;

        let metrics = HandlerMetrics::new("handler", ctx.registry())?;
        let cpu_tracker = resource_tracker.cpu_tracker();
        let sync_queue = MessageQueue::new(
            validators.clone(),
            cpu_tracker.clone(),
            "handler",
            ctx.registry(),
        )?;
        let async_queue =
            MessageQueue::new(validators.clone(), cpu_tracker, "handler_async", ctx.registry())?;

        // A single slot: a pending timeout absorbs any further ones
        let (timeouts, timeouts_rx) = mpsc::channel(1);
        let (closing, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        let async_pool = WorkerPool::new(config.thread_pool_size as u32);

        Ok(Arc::new(Self {
            preempt_timeouts: subnet.on_bootstrap_completed(),
            ctx,
            config,
            metrics,
            validators,
            subnet,
            subnet_connector,
            resource_tracker,
            engine_manager: OnceCell::new(),
            on_stopped: Mutex::new(None),
            sync_queue,
            async_queue,
            async_pool,
            chan_sources: Mutex::new(Some(ChanSources {
                msg_from_vm,
                timeouts: timeouts_rx,
            })),
            timeouts,
            linearized_gossip_sent: AtomicBool::new(false),
            recover_panic: AtomicBool::new(false),
            stop_called: AtomicBool::new(false),
            closing,
            dispatchers_closed: AtomicUsize::new(0),
            closed,
        }))
    }

    pub fn context(&self) -> &Arc<ConsensusContext> {
        &self.ctx
    }

    pub fn metrics(&self) -> &HandlerMetrics {
        &self.metrics
    }

    /// Whether `node_id` may send messages to this chain. Messages from
    /// nodes that may not should be dropped by the router.
    pub fn should_handle(&self, node_id: NodeId) -> bool {
        self.subnet
            .is_allowed(node_id, self.validators.contains(node_id))
    }

    /// Install the chain's engines. Can only be done once.
    pub fn set_engine_manager(&self, engine_manager: EngineManager) -> ChainResult<()> {
        self.engine_manager
            .set(Arc::new(engine_manager))
            .map_err(|_| ChainError::EngineManagerAlreadySet)
    }

    pub fn get_engine_manager(&self) -> Option<Arc<EngineManager>> {
        self.engine_manager.get().cloned()
    }

    fn engine_manager(&self) -> ChainResult<&Arc<EngineManager>> {
        self.engine_manager
            .get()
            .ok_or(ChainError::EngineManagerNotSet)
    }

    /// Callback invoked once the handler reached its terminal state
    pub fn set_on_stopped<F>(&self, on_stopped: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.on_stopped.lock() = Some(Box::new(on_stopped));
    }

    /// Pick the engine the chain starts with: the state syncer when one is
    /// registered and enabled, the bootstrapper otherwise.
    pub(crate) async fn select_starting_gear(&self) -> ChainResult<Arc<dyn Engine>> {
        let state = self.ctx.state();
        let engines = self
            .engine_manager()?
            .get(state.engine_type)
            .ok_or(ChainError::NoStartingGear)?;

        let bootstrapper = engines.get(State::Bootstrapping);
        let Some(state_syncer) = engines.state_syncer() else {
            return bootstrapper.ok_or(ChainError::NoStartingGear);
        };

        if !state_syncer.is_enabled().await? {
            return bootstrapper.ok_or(ChainError::NoStartingGear);
        }

        // Drop bootstrap progress from previous runs before state syncing
        if let Some(bootstrapper) = engines.bootstrapper() {
            bootstrapper.clear().await?;
        }
        engines
            .get(State::StateSyncing)
            .ok_or(ChainError::NoStartingGear)
    }

    /// Start the first engine and the dispatchers. If the engine cannot be
    /// selected or started the handler shuts down immediately.
    ///
    /// With `recover_panic`, a panicking dispatcher stops the chain instead
    /// of propagating the panic.
    pub async fn start(self: &Arc<Self>, recover_panic: bool) {
        self.recover_panic.store(recover_panic, Ordering::Release);
        {
            let _lock = self.ctx.lock.lock().await;

            let gear = match self.select_starting_gear().await {
                Ok(gear) => gear,
                Err(err) => {
                    error!(error = %err, "chain failed to select starting gear");
                    self.stop();
                    self.shutdown().await;
                    return;
                }
            };

            if let Err(err) = gear.start(0).await {
                error!(error = %err, "chain failed to start");
                self.stop();
                self.shutdown().await;
                return;
            }
        }

        self.spawn_dispatcher("sync", recover_panic, Self::dispatch_sync);
        self.spawn_dispatcher("async", recover_panic, Self::dispatch_async);
        self.spawn_dispatcher("chan", recover_panic, Self::dispatch_chans);
    }

    fn spawn_dispatcher<F, Fut>(self: &Arc<Self>, name: &'static str, recover_panic: bool, dispatch: F)
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(dispatch(self.clone()));
        let handler = self.clone();
        tokio::spawn(async move {
            let Err(err) = task.await else {
                return;
            };
            if !err.is_panic() {
                debug!(dispatcher = name, "dispatcher cancelled");
                return;
            }

            if recover_panic {
                error!(dispatcher = name, "chain was shutdown due to a panic in the dispatcher");
                handler.stop();
                handler.close_dispatcher().await;
            } else {
                error!(dispatcher = name, "dispatcher panicked");
                std::panic::resume_unwind(err.into_panic());
            }
        });
    }

    /// Health of the engine currently running the chain
    pub async fn health_check(&self) -> ChainResult<Value> {
        let _lock = self.ctx.lock.lock().await;

        let state = self.ctx.state();
        let engine = self
            .engine_manager()?
            .engine(state.engine_type, state.state)
            .ok_or(ChainError::MissingEngine {
                state: state.state,
                engine_type: state.engine_type,
            })?;
        engine.health_check().await
    }

    /// Queue `msg` for handling. Application messages go to the async queue,
    /// everything else to the sync queue.
    pub fn push(&self, msg: Message) {
        if msg.op().is_async() {
            self.async_queue.push(msg);
        } else {
            self.sync_queue.push(msg);
        }
    }

    /// Number of queued, unhandled messages
    pub fn len(&self) -> usize {
        self.sync_queue.len() + self.async_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a timeout to the current engine after `duration`, or as soon
    /// as the subnet finished bootstrapping. Timeouts that fire while one is
    /// already pending are dropped, and pending ones are abandoned once the
    /// chain is stopping.
    pub fn register_timeout(&self, duration: Duration) {
        let timeouts = self.timeouts.clone();
        let mut preempt = self.preempt_timeouts.clone();
        let mut closing = self.closing.subscribe();
        let pending = self.metrics.pending_timeouts.clone();
        pending.inc();
        tokio::spawn(async move {
            let fire = tokio::select! {
                _ = tokio::time::sleep(duration) => true,
                true = wait_until_set(&mut preempt) => true,
                _ = wait_until_set(&mut closing) => false,
            };

            // Never block, a timeout is already pending if the slot is full
            if fire {
                let _ = timeouts.try_send(());
            }
            pending.dec();
        });
    }

    /// Stop handling messages. Only the first call has an effect; it may
    /// race with `start`.
    pub fn stop(&self) {
        if self.stop_called.swap(true, Ordering::AcqRel) {
            return;
        }

        self.sync_queue.shutdown();
        self.async_queue.shutdown();
        self.closing.send_replace(true);

        // Halt the bootstrapper so a dispatcher stuck executing bootstrap
        // state transitions releases the consensus lock promptly.
        let state = self.ctx.state();
        let bootstrapper = self
            .engine_manager
            .get()
            .and_then(|manager| manager.get(state.engine_type))
            .and_then(|engines| engines.bootstrapper());
        match bootstrapper {
            Some(bootstrapper) => bootstrapper.halt(),
            None => error!(
                engine_type = %state.engine_type,
                "bootstrapping engine doesn't exist"
            ),
        }
    }

    /// Report a fatal error and stop the chain
    pub fn stop_with_error(&self, err: ChainError) {
        error!(
            reason = "received an unexpected error",
            error = %err,
            category = err.category(),
            "shutting down chain"
        );
        self.stop();
    }

    /// Resolves once the handler and its engine finished shutting down
    pub async fn stopped(&self) {
        wait_until_set(&mut self.closed.subscribe()).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.closed.borrow()
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    fn recovers_panics(&self) -> bool {
        self.recover_panic.load(Ordering::Acquire)
    }

    /// Count an exited dispatcher; the last one shuts the chain down
    async fn close_dispatcher(&self) {
        let closed = self.dispatchers_closed.fetch_add(1, Ordering::AcqRel) + 1;
        if closed < NUM_DISPATCHERS_TO_CLOSE {
            return;
        }

        let _lock = self.ctx.lock.lock().await;
        self.shutdown().await;
    }

    /// Shut the current engine down and enter the terminal state. Must hold
    /// the consensus lock, and runs only after every dispatcher exited (or
    /// none was started).
    async fn shutdown(&self) {
        let state = self.ctx.state();
        let engine = self
            .engine_manager
            .get()
            .and_then(|manager| manager.engine(state.engine_type, state.state));
        match engine {
            Some(engine) => {
                if let Err(err) = engine.shutdown().await {
                    error!(error = %err, "failed while shutting down the chain");
                }
            }
            None => error!(
                engine_type = %state.engine_type,
                state = %state.state,
                "failed fetching current engine during shutdown"
            ),
        }

        let on_stopped = self.on_stopped.lock().take();
        if let Some(on_stopped) = on_stopped {
            tokio::task::spawn_blocking(on_stopped);
        }
        self.closed.send_replace(true);
    }

    #[cfg(test)]
    pub(crate) fn queue_lens(&self) -> (usize, usize) {
        (self.sync_queue.len(), self.async_queue.len())
    }
}

/// Wait until `rx` reads `true`. Returns `false` if the sender went away
/// first.
async fn wait_until_set(rx: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *rx.borrow_and_update() {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}
