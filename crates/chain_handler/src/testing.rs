//! Test doubles for the handler's collaborators

use crate::config::HandlerConfig;
use crate::context::{ConsensusContext, EngineState, EngineType, State};
use crate::engine::{Bootstrapper, Engine, StateSyncer};
use crate::error::{ChainError, ChainResult};
use crate::handler::Handler;
use crate::ids::{ChainId, Id, NodeId, SubnetId, Version};
use crate::message::{Message, Op, VmNotification};
use crate::tracker::{CpuTracker, ResourceTracker};
use crate::validators::{Subnet, SubnetConnector, ValidatorSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One engine invocation
#[derive(Debug, Clone)]
pub struct Call {
    pub method: &'static str,
    pub node_id: Option<NodeId>,
    pub request_id: Option<u32>,
    pub at: Instant,
}

/// Engine that records every call. Usable as bootstrapper, state syncer and
/// consensus engine.
pub struct RecordingEngine {
    pub name: &'static str,
    calls: Mutex<Vec<Call>>,
    fail_on: Mutex<Option<&'static str>>,
    panic_on: Mutex<Option<&'static str>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    state_sync_enabled: AtomicBool,
    cleared: AtomicBool,
    starts: AtomicUsize,
    halts: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl RecordingEngine {
    pub fn named(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
            panic_on: Mutex::new(None),
            delays: Mutex::new(HashMap::new()),
            state_sync_enabled: AtomicBool::new(false),
            cleared: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            halts: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        })
    }

    /// Make `method` return an error
    pub fn fail_on(&self, method: &'static str) {
        *self.fail_on.lock() = Some(method);
    }

    /// Make `method` panic
    pub fn panic_on(&self, method: &'static str) {
        *self.panic_on.lock() = Some(method);
    }

    /// Make `method` sleep before returning
    pub fn delay(&self, method: &'static str, duration: Duration) {
        self.delays.lock().insert(method, duration);
    }

    pub fn set_state_sync_enabled(&self, enabled: bool) {
        self.state_sync_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|call| call.method).collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.method == method)
            .count()
    }

    pub fn was_cleared(&self) -> bool {
        self.cleared.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    async fn record(
        &self,
        method: &'static str,
        node_id: Option<NodeId>,
        request_id: Option<u32>,
    ) -> ChainResult<()> {
        let delay = self.delays.lock().get(method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.calls.lock().push(Call {
            method,
            node_id,
            request_id,
            at: Instant::now(),
        });

        if *self.panic_on.lock() == Some(method) {
            panic!("{} panicked in {}", self.name, method);
        }
        if *self.fail_on.lock() == Some(method) {
            return Err(ChainError::engine(format!("{} failed {}", self.name, method)));
        }
        Ok(())
    }

    async fn request(&self, method: &'static str, node_id: NodeId, request_id: u32) -> ChainResult<()> {
        self.record(method, Some(node_id), Some(request_id)).await
    }
}

#[async_trait]
impl Engine for RecordingEngine {
    async fn start(&self, start_request_id: u32) -> ChainResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.record("start", None, Some(start_request_id)).await
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
    }

    async fn shutdown(&self) -> ChainResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> ChainResult<Value> {
        Ok(json!({ "engine": self.name }))
    }

    async fn get_state_summary_frontier(&self, node_id: NodeId, request_id: u32) -> ChainResult<()> {
        self.request("get_state_summary_frontier", node_id, request_id).await
    }

    async fn get_accepted_state_summary(
        &self,
        node_id: NodeId,
        request_id: u32,
        _heights: &[u64],
    ) -> ChainResult<()> {
        self.request("get_accepted_state_summary", node_id, request_id).await
    }

    async fn accepted_state_summary(
        &self,
        node_id: NodeId,
        request_id: u32,
        _summary_ids: Vec<Id>,
    ) -> ChainResult<()> {
        self.request("accepted_state_summary", node_id, request_id).await
    }

    async fn get_accepted_state_summary_failed(&self, node_id: NodeId, request_id: u32) -> ChainResult<()> {
        self.request("get_accepted_state_summary_failed", node_id, request_id).await
    }

    async fn get_accepted_frontier(&self, node_id: NodeId, request_id: u32) -> ChainResult<()> {
        self.request("get_accepted_frontier", node_id, request_id).await
    }

    async fn accepted_frontier(
        &self,
        node_id: NodeId,
        request_id: u32,
        _container_ids: Vec<Id>,
    ) -> ChainResult<()> {
        self.request("accepted_frontier", node_id, request_id).await
    }

    async fn get_accepted_frontier_failed(&self, node_id: NodeId, request_id: u32) -> ChainResult<()> {
        self.request("get_accepted_frontier_failed", node_id, request_id).await
    }

    async fn get_accepted(
        &self,
        node_id: NodeId,
        request_id: u32,
        _container_ids: Vec<Id>,
    ) -> ChainResult<()> {
        self.request("get_accepted", node_id, request_id).await
    }

    async fn accepted(&self, node_id: NodeId, request_id: u32, _container_ids: Vec<Id>) -> ChainResult<()> {
        self.request("accepted", node_id, request_id).await
    }

    async fn get_accepted_failed(&self, node_id: NodeId, request_id: u32) -> ChainResult<()> {
        self.request("get_accepted_failed", node_id, request_id).await
    }

    async fn get_ancestors(&self, node_id: NodeId, request_id: u32, _container_id: Id) -> ChainResult<()> {
        self.request("get_ancestors", node_id, request_id).await
    }

    async fn ancestors(&self, node_id: NodeId, request_id: u32, _containers: &[Vec<u8>]) -> ChainResult<()> {
        self.request("ancestors", node_id, request_id).await
    }

    async fn get(&self, node_id: NodeId, request_id: u32, _container_id: Id) -> ChainResult<()> {
        self.request("get", node_id, request_id).await
    }

    async fn put(&self, node_id: NodeId, request_id: u32, _container: &[u8]) -> ChainResult<()> {
        self.request("put", node_id, request_id).await
    }

    async fn push_query(&self, node_id: NodeId, request_id: u32, _container: &[u8]) -> ChainResult<()> {
        self.request("push_query", node_id, request_id).await
    }

    async fn pull_query(&self, node_id: NodeId, request_id: u32, _container_id: Id) -> ChainResult<()> {
        self.request("pull_query", node_id, request_id).await
    }

    async fn chits(
        &self,
        node_id: NodeId,
        request_id: u32,
        _preferred: Vec<Id>,
        _accepted: Vec<Id>,
    ) -> ChainResult<()> {
        self.request("chits", node_id, request_id).await
    }

    async fn query_failed(&self, node_id: NodeId, request_id: u32) -> ChainResult<()> {
        self.request("query_failed", node_id, request_id).await
    }

    async fn app_request(
        &self,
        node_id: NodeId,
        request_id: u32,
        _deadline: Instant,
        _app_bytes: &[u8],
    ) -> ChainResult<()> {
        self.request("app_request", node_id, request_id).await
    }

    async fn app_gossip(&self, node_id: NodeId, _app_bytes: &[u8]) -> ChainResult<()> {
        self.record("app_gossip", Some(node_id), None).await
    }

    async fn cross_chain_app_request(
        &self,
        _chain_id: ChainId,
        request_id: u32,
        _deadline: Instant,
        _message: &[u8],
    ) -> ChainResult<()> {
        self.record("cross_chain_app_request", None, Some(request_id)).await
    }

    async fn connected(&self, node_id: NodeId, _version: &Version) -> ChainResult<()> {
        self.record("connected", Some(node_id), None).await
    }

    async fn disconnected(&self, node_id: NodeId) -> ChainResult<()> {
        self.record("disconnected", Some(node_id), None).await
    }

    async fn gossip(&self) -> ChainResult<()> {
        self.record("gossip", None, None).await
    }

    async fn timeout(&self) -> ChainResult<()> {
        self.record("timeout", None, None).await
    }

    async fn notify(&self, _notification: VmNotification) -> ChainResult<()> {
        self.record("notify", None, None).await
    }
}

#[async_trait]
impl Bootstrapper for RecordingEngine {
    async fn clear(&self) -> ChainResult<()> {
        self.cleared.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl StateSyncer for RecordingEngine {
    async fn is_enabled(&self) -> ChainResult<bool> {
        Ok(self.state_sync_enabled.load(Ordering::SeqCst))
    }
}

/// CPU tracker returning fixed usages, zero for unknown nodes
#[derive(Default)]
pub struct FixedCpuTracker {
    usage: Mutex<HashMap<NodeId, f64>>,
}

impl FixedCpuTracker {
    pub fn idle() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, node_id: NodeId, usage: f64) {
        self.usage.lock().insert(node_id, usage);
    }
}

impl CpuTracker for FixedCpuTracker {
    fn usage(&self, node_id: NodeId, _now: Instant) -> f64 {
        self.usage.lock().get(&node_id).copied().unwrap_or_default()
    }
}

/// Resource tracker counting processing windows
pub struct CountingResourceTracker {
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    cpu: Arc<FixedCpuTracker>,
}

impl CountingResourceTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            cpu: FixedCpuTracker::idle(),
        })
    }
}

impl ResourceTracker for CountingResourceTracker {
    fn start_processing(&self, _node_id: NodeId, _now: Instant) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn stop_processing(&self, _node_id: NodeId, _now: Instant) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn cpu_tracker(&self) -> Arc<dyn CpuTracker> {
        self.cpu.clone()
    }
}

#[derive(Default)]
pub struct StaticValidators {
    weights: HashMap<NodeId, u64>,
}

impl StaticValidators {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Validators keyed by [`NodeId::from_index`]
    pub fn with_weights(weights: &[(u8, u64)]) -> Arc<Self> {
        Arc::new(Self {
            weights: weights
                .iter()
                .map(|(index, weight)| (NodeId::from_index(*index), *weight))
                .collect(),
        })
    }
}

impl ValidatorSet for StaticValidators {
    fn contains(&self, node_id: NodeId) -> bool {
        self.weights.contains_key(&node_id)
    }

    fn weight(&self, node_id: NodeId) -> u64 {
        self.weights.get(&node_id).copied().unwrap_or_default()
    }

    fn total_weight(&self) -> u64 {
        self.weights.values().sum()
    }
}

/// Subnet that optionally only admits validators
pub struct TestSubnet {
    validators_only: bool,
    bootstrapped: watch::Sender<bool>,
}

impl TestSubnet {
    pub fn new(validators_only: bool) -> Arc<Self> {
        let (bootstrapped, _) = watch::channel(false);
        Arc::new(Self {
            validators_only,
            bootstrapped,
        })
    }

    pub fn complete_bootstrap(&self) {
        self.bootstrapped.send_replace(true);
    }
}

impl Subnet for TestSubnet {
    fn is_allowed(&self, _node_id: NodeId, is_validator: bool) -> bool {
        !self.validators_only || is_validator
    }

    fn on_bootstrap_completed(&self) -> watch::Receiver<bool> {
        self.bootstrapped.subscribe()
    }
}

#[derive(Default)]
pub struct RecordingSubnetConnector {
    pub connected: Mutex<Vec<(NodeId, SubnetId)>>,
}

#[async_trait]
impl SubnetConnector for RecordingSubnetConnector {
    async fn connected_subnet(&self, node_id: NodeId, subnet_id: SubnetId) -> ChainResult<()> {
        self.connected.lock().push((node_id, subnet_id));
        Ok(())
    }
}

/// A handler wired to test collaborators
pub struct TestChain {
    pub handler: Arc<Handler>,
    pub ctx: Arc<ConsensusContext>,
    pub vm: mpsc::Sender<VmNotification>,
    pub tracker: Arc<CountingResourceTracker>,
    pub subnet: Arc<TestSubnet>,
    pub connector: Arc<RecordingSubnetConnector>,
}

impl TestChain {
    pub fn new(engine_type: EngineType, state: State) -> Self {
        Self::with_config(engine_type, state, HandlerConfig::default())
    }

    pub fn with_config(engine_type: EngineType, state: State, config: HandlerConfig) -> Self {
        Self::build(engine_type, state, config, TestSubnet::new(false))
    }

    pub fn build(
        engine_type: EngineType,
        state: State,
        config: HandlerConfig,
        subnet: Arc<TestSubnet>,
    ) -> Self {
        init_tracing();

        let ctx = Arc::new(ConsensusContext::new(
            NodeId::from_index(0),
            Id([1; 32]),
            Id([2; 32]),
            EngineState::new(engine_type, state),
        ));
        let (vm, msg_from_vm) = mpsc::channel(16);
        let tracker = CountingResourceTracker::new();
        let connector = Arc::new(RecordingSubnetConnector::default());

        let handler = Handler::new(
            ctx.clone(),
            config,
            StaticValidators::with_weights(&[(1, 10), (2, 10)]),
            msg_from_vm,
            tracker.clone(),
            connector.clone(),
            subnet.clone(),
        )
        .unwrap();

        Self {
            handler,
            ctx,
            vm,
            tracker,
            subnet,
            connector,
        }
    }
}

/// A message from node `node` expiring in a minute
pub fn message(node: u8, op: Op) -> Message {
    Message::new(
        NodeId::from_index(node),
        op,
        Instant::now() + Duration::from_secs(60),
    )
}

/// Attach a completion counter to `msg`
pub fn counted(msg: Message, counter: &Arc<AtomicUsize>) -> Message {
    let counter = counter.clone();
    msg.with_on_finished(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}
