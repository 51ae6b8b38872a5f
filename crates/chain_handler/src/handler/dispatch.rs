//! Dispatch loops and message forwarding

use super::{wait_until_set, Handler};
use crate::context::{EngineType, State};
use crate::engine::Engine;
use crate::error::{ChainError, ChainResult};
use crate::ids::{Id, NodeId};
use crate::message::{Message, Op};
use crate::queue::MessageQueue;
use futures::FutureExt;
use prometheus::IntCounter;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

impl Handler {
    /// Pop the next message worth handling. Expired messages, and every
    /// message once the chain is stopping, are finished without dispatch.
    async fn pop_unexpired(&self, queue: &MessageQueue, expired: &IntCounter) -> Option<Message> {
        loop {
            let msg = queue.pop().await?;

            if self.is_closing() {
                debug!(
                    node_id = %msg.node_id(),
                    op = msg.op().name(),
                    "dropping message, chain is stopping"
                );
                msg.on_finished_handling();
                continue;
            }

            if msg.is_expired(Instant::now()) {
                debug!(
                    node_id = %msg.node_id(),
                    op = msg.op().name(),
                    "dropping message, past its deadline"
                );
                expired.inc();
                msg.on_finished_handling();
                continue;
            }

            return Some(msg);
        }
    }

    pub(super) async fn dispatch_sync(self: Arc<Self>) {
        while let Some(msg) = self.pop_unexpired(&self.sync_queue, &self.metrics.expired).await {
            if let Err(err) = self.handle_sync_msg(msg).await {
                self.stop_with_error(err);
            }
        }
        self.close_dispatcher().await;
    }

    pub(super) async fn dispatch_async(self: Arc<Self>) {
        while let Some(msg) = self
            .pop_unexpired(&self.async_queue, &self.metrics.async_expired)
            .await
        {
            let handler = self.clone();
            self.async_pool
                .send(async move {
                    let handled = AssertUnwindSafe(handler.handle_async_msg(msg))
                        .catch_unwind()
                        .await;
                    match handled {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => handler.stop_with_error(err),
                        Err(_) if handler.recovers_panics() => {
                            error!(
                                dispatcher = "async",
                                "chain was shutdown due to a panic while handling a message"
                            );
                            handler.stop();
                        }
                        Err(panic) => {
                            error!(dispatcher = "async", "panic while handling a message");
                            std::panic::resume_unwind(panic);
                        }
                    }
                })
                .await;
        }

        // In-flight tasks must finish before the chain can shut down
        self.async_pool.shutdown().await;
        self.close_dispatcher().await;
    }

    pub(super) async fn dispatch_chans(self: Arc<Self>) {
        let sources = self.chan_sources.lock().take();
        let Some(mut sources) = sources else {
            error!("chan dispatcher started more than once");
            self.close_dispatcher().await;
            return;
        };

        let frequency = self.config.gossip_frequency;
        let mut gossiper = tokio::time::interval_at(Instant::now() + frequency, frequency);
        gossiper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut closing = self.closing.subscribe();
        let mut vm_open = true;
        loop {
            let op = tokio::select! {
                biased;

                _ = wait_until_set(&mut closing) => break,
                notification = sources.msg_from_vm.recv(), if vm_open => match notification {
                    Some(notification) => Op::Notify(notification),
                    None => {
                        debug!("vm notification channel closed");
                        vm_open = false;
                        continue;
                    }
                },
                _ = gossiper.tick() => Op::GossipRequest,
                Some(()) = sources.timeouts.recv() => Op::Timeout,
            };

            let msg = Message::internal(self.ctx.node_id, op);
            if let Err(err) = self.handle_chan_msg(msg).await {
                self.stop_with_error(err);
                break;
            }
        }
        self.close_dispatcher().await;
    }

    async fn handle_sync_msg(&self, msg: Message) -> ChainResult<()> {
        let node_id = msg.node_id();
        let op = msg.op().name();

        // The state this message was received in decides the slow warning
        let is_normal_op = self.ctx.state().state == State::NormalOp;

        let started = Instant::now();
        self.resource_tracker.start_processing(node_id, started);
        let lock = self.ctx.lock.lock().await;
        let lock_acquired = Instant::now();

        let result = if self.is_closing() {
            debug!(node_id = %node_id, op, "dropping sync message, chain is stopping");
            Ok(())
        } else {
            self.forward_sync_msg(&msg).await
        };

        drop(lock);
        self.resource_tracker.stop_processing(node_id, Instant::now());
        self.finish(msg, started, lock_acquired, is_normal_op);

        result.map_err(|err| err.dispatch("sync", op))
    }

    async fn forward_sync_msg(&self, msg: &Message) -> ChainResult<()> {
        let node_id = msg.node_id();
        let state = self.ctx.state();

        let engine_type = match msg.engine_type() {
            // Peers may already ask for the linearized chain before it exists here
            EngineType::Snowman if state.engine_type == EngineType::Avalanche => {
                debug!(
                    node_id = %node_id,
                    op = msg.op().name(),
                    "dropping sync message, snowman requested while running avalanche"
                );
                return Ok(());
            }
            EngineType::Unspecified => state.engine_type,
            requested => requested,
        };

        let Some(engine) = self.current_engine(engine_type, state.state) else {
            debug!(
                node_id = %node_id,
                op = msg.op().name(),
                engine_type = %engine_type,
                state = %state.state,
                "dropping sync message, no engine registered"
            );
            return Ok(());
        };

        trace!(node_id = %node_id, message = ?msg, "forwarding sync message to consensus");
        debug!(node_id = %node_id, op = msg.op().name(), "forwarding sync message to consensus");

        let engine = engine.as_ref();
        match msg.op() {
            Op::GetStateSummaryFrontier { request_id } => {
                engine.get_state_summary_frontier(node_id, *request_id).await
            }
            Op::StateSummaryFrontier { request_id, summary } => {
                engine
                    .state_summary_frontier(node_id, *request_id, summary)
                    .await
            }
            Op::GetStateSummaryFrontierFailed { request_id } => {
                engine
                    .get_state_summary_frontier_failed(node_id, *request_id)
                    .await
            }
            Op::GetAcceptedStateSummary { request_id, heights } => {
                if !has_unique_heights(heights) {
                    debug!(
                        node_id = %node_id,
                        request_id,
                        field = "heights",
                        "message with invalid field"
                    );
                    return engine
                        .get_accepted_state_summary_failed(node_id, *request_id)
                        .await;
                }
                engine
                    .get_accepted_state_summary(node_id, *request_id, heights)
                    .await
            }
            Op::AcceptedStateSummary {
                request_id,
                summary_ids,
            } => match Id::from_slices("summary_ids", summary_ids) {
                Ok(ids) => {
                    engine
                        .accepted_state_summary(node_id, *request_id, ids)
                        .await
                }
                Err(err) => {
                    invalid_field(node_id, *request_id, &err);
                    engine
                        .get_accepted_state_summary_failed(node_id, *request_id)
                        .await
                }
            },
            Op::GetAcceptedStateSummaryFailed { request_id } => {
                engine
                    .get_accepted_state_summary_failed(node_id, *request_id)
                    .await
            }
            Op::GetAcceptedFrontier { request_id } => {
                engine.get_accepted_frontier(node_id, *request_id).await
            }
            Op::AcceptedFrontier {
                request_id,
                container_ids,
            } => match Id::from_slices("container_ids", container_ids) {
                Ok(ids) => engine.accepted_frontier(node_id, *request_id, ids).await,
                Err(err) => {
                    invalid_field(node_id, *request_id, &err);
                    engine
                        .get_accepted_frontier_failed(node_id, *request_id)
                        .await
                }
            },
            Op::GetAcceptedFrontierFailed { request_id } => {
                engine
                    .get_accepted_frontier_failed(node_id, *request_id)
                    .await
            }
            Op::GetAccepted {
                request_id,
                container_ids,
            } => match Id::from_slices("container_ids", container_ids) {
                Ok(ids) => engine.get_accepted(node_id, *request_id, ids).await,
                Err(err) => {
                    invalid_field(node_id, *request_id, &err);
                    Ok(())
                }
            },
            Op::Accepted {
                request_id,
                container_ids,
            } => match Id::from_slices("container_ids", container_ids) {
                Ok(ids) => engine.accepted(node_id, *request_id, ids).await,
                Err(err) => {
                    invalid_field(node_id, *request_id, &err);
                    engine.get_accepted_failed(node_id, *request_id).await
                }
            },
            Op::GetAcceptedFailed { request_id } => {
                engine.get_accepted_failed(node_id, *request_id).await
            }
            Op::GetAncestors {
                request_id,
                container_id,
            } => match Id::from_slice("container_id", container_id) {
                Ok(id) => engine.get_ancestors(node_id, *request_id, id).await,
                Err(err) => {
                    invalid_field(node_id, *request_id, &err);
                    Ok(())
                }
            },
            Op::GetAncestorsFailed { request_id } => {
                engine.get_ancestors_failed(node_id, *request_id).await
            }
            Op::Ancestors {
                request_id,
                containers,
            } => engine.ancestors(node_id, *request_id, containers).await,
            Op::Get {
                request_id,
                container_id,
            } => match Id::from_slice("container_id", container_id) {
                Ok(id) => engine.get(node_id, *request_id, id).await,
                Err(err) => {
                    invalid_field(node_id, *request_id, &err);
                    Ok(())
                }
            },
            Op::GetFailed { request_id } => engine.get_failed(node_id, *request_id).await,
            Op::Put {
                request_id,
                container,
            } => engine.put(node_id, *request_id, container).await,
            Op::PushQuery {
                request_id,
                container,
            } => engine.push_query(node_id, *request_id, container).await,
            Op::PullQuery {
                request_id,
                container_id,
            } => match Id::from_slice("container_id", container_id) {
                Ok(id) => engine.pull_query(node_id, *request_id, id).await,
                Err(err) => {
                    invalid_field(node_id, *request_id, &err);
                    Ok(())
                }
            },
            Op::Chits {
                request_id,
                preferred_container_ids,
                accepted_container_ids,
            } => {
                let preferred = Id::from_slices("preferred_container_ids", preferred_container_ids);
                let accepted = Id::from_slices("accepted_container_ids", accepted_container_ids);
                match (preferred, accepted) {
                    (Ok(preferred), Ok(accepted)) => {
                        engine
                            .chits(node_id, *request_id, preferred, accepted)
                            .await
                    }
                    (Err(err), _) | (_, Err(err)) => {
                        invalid_field(node_id, *request_id, &err);
                        engine.query_failed(node_id, *request_id).await
                    }
                }
            }
            Op::QueryFailed { request_id } => engine.query_failed(node_id, *request_id).await,
            Op::Connected { node_version } => engine.connected(node_id, node_version).await,
            Op::ConnectedSubnet { subnet_id } => {
                self.subnet_connector
                    .connected_subnet(node_id, *subnet_id)
                    .await
            }
            Op::Disconnected => engine.disconnected(node_id).await,
            op => Err(ChainError::UnexpectedOp {
                kind: "sync",
                op: op.name(),
            }),
        }
    }

    async fn handle_async_msg(&self, msg: Message) -> ChainResult<()> {
        let node_id = msg.node_id();
        let op = msg.op().name();

        let started = Instant::now();
        self.resource_tracker.start_processing(node_id, started);
        let result = if self.is_closing() {
            debug!(node_id = %node_id, op, "dropping async message, chain is stopping");
            Ok(())
        } else {
            self.forward_async_msg(&msg).await
        };
        self.resource_tracker.stop_processing(node_id, Instant::now());
        self.finish(msg, started, started, false);

        result.map_err(|err| err.dispatch("async", op))
    }

    async fn forward_async_msg(&self, msg: &Message) -> ChainResult<()> {
        let node_id = msg.node_id();
        let state = self.ctx.state();

        let Some(engine) = self.current_engine(state.engine_type, state.state) else {
            debug!(
                node_id = %node_id,
                op = msg.op().name(),
                engine_type = %state.engine_type,
                state = %state.state,
                "dropping async message, no engine registered"
            );
            return Ok(());
        };

        trace!(node_id = %node_id, message = ?msg, "forwarding async message to consensus");
        debug!(node_id = %node_id, op = msg.op().name(), "forwarding async message to consensus");

        match msg.op() {
            Op::AppRequest {
                request_id,
                app_bytes,
            } => {
                engine
                    .app_request(node_id, *request_id, msg.expiration(), app_bytes)
                    .await
            }
            Op::AppResponse {
                request_id,
                app_bytes,
            } => engine.app_response(node_id, *request_id, app_bytes).await,
            Op::AppRequestFailed { request_id } => {
                engine.app_request_failed(node_id, *request_id).await
            }
            Op::AppGossip { app_bytes } => engine.app_gossip(node_id, app_bytes).await,
            Op::CrossChainAppRequest {
                source_chain_id,
                request_id,
                message,
            } => {
                engine
                    .cross_chain_app_request(*source_chain_id, *request_id, msg.expiration(), message)
                    .await
            }
            Op::CrossChainAppResponse {
                source_chain_id,
                request_id,
                message,
            } => {
                engine
                    .cross_chain_app_response(*source_chain_id, *request_id, message)
                    .await
            }
            Op::CrossChainAppRequestFailed {
                source_chain_id,
                request_id,
            } => {
                engine
                    .cross_chain_app_request_failed(*source_chain_id, *request_id)
                    .await
            }
            op => Err(ChainError::UnexpectedOp {
                kind: "async",
                op: op.name(),
            }),
        }
    }

    async fn handle_chan_msg(&self, msg: Message) -> ChainResult<()> {
        let op = msg.op().name();

        let is_normal_op = self.ctx.state().state == State::NormalOp;

        let started = Instant::now();
        let lock = self.ctx.lock.lock().await;
        let lock_acquired = Instant::now();

        let result = if self.is_closing() {
            debug!(op, "dropping internal message, chain is stopping");
            Ok(())
        } else {
            self.forward_chan_msg(&msg).await
        };

        drop(lock);
        self.finish(msg, started, lock_acquired, is_normal_op);

        result.map_err(|err| err.dispatch("chan", op))
    }

    async fn forward_chan_msg(&self, msg: &Message) -> ChainResult<()> {
        let state = self.ctx.state();

        let Some(engine) = self.current_engine(state.engine_type, state.state) else {
            debug!(
                op = msg.op().name(),
                engine_type = %state.engine_type,
                state = %state.state,
                "dropping internal message, no engine registered"
            );
            return Ok(());
        };

        trace!(message = ?msg, "forwarding chan message to consensus");
        debug!(op = msg.op().name(), "forwarding chan message to consensus");

        match msg.op() {
            Op::Notify(notification) => engine.notify(*notification).await,
            Op::GossipRequest => {
                if state.engine_type == EngineType::Snowman {
                    self.gossip_linearized(state.state).await?;
                }
                engine.gossip().await
            }
            Op::Timeout => engine.timeout().await,
            op => Err(ChainError::UnexpectedOp {
                kind: "chan",
                op: op.name(),
            }),
        }
    }

    /// A linearized chain gossips its Avalanche frontier once so peers that
    /// have not linearized yet still converge.
    async fn gossip_linearized(&self, state: State) -> ChainResult<()> {
        let Some(avalanche) = self.current_engine(EngineType::Avalanche, state) else {
            return Ok(());
        };
        if self.linearized_gossip_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!("gossiping the avalanche frontier of the linearized chain");
        avalanche.gossip().await
    }

    fn current_engine(&self, engine_type: EngineType, state: State) -> Option<Arc<dyn Engine>> {
        self.engine_manager
            .get()
            .and_then(|manager| manager.engine(engine_type, state))
    }

    /// Record metrics and run the message's completion
    fn finish(&self, msg: Message, started: Instant, lock_acquired: Instant, is_normal_op: bool) {
        let end = Instant::now();
        let node_id = msg.node_id();
        let op = msg.op().name();

        let queue_wait = started.saturating_duration_since(msg.received());
        let handling = lock_acquired.saturating_duration_since(started);
        let processing = end.saturating_duration_since(started);
        self.metrics.observe(op, queue_wait, handling, processing);
        msg.on_finished_handling();

        if is_normal_op && processing > self.config.processing_time_warn_limit {
            self.metrics.slow_processing.inc();
            warn!(
                node_id = %node_id,
                op,
                processing_time = ?processing,
                "handling message took longer than expected"
            );
        }
    }
}

fn has_unique_heights(heights: &[u64]) -> bool {
    let mut seen = HashSet::with_capacity(heights.len());
    heights.iter().all(|height| seen.insert(*height))
}

fn invalid_field(node_id: NodeId, request_id: u32, err: &ChainError) {
    debug!(node_id = %node_id, request_id, error = %err, "message with invalid field");
}
