//! Mapping contexts, mapper stacks, and channel fan-out.
//!
//! A mapping context binds one topology snapshot (ordered peer list) to a
//! mapper and the pooled connections it resolves into. Subscriptions and
//! publishes each keep their own FIFO stack of contexts; during a
//! migration both the old and new topology are simultaneously active, so
//! every operation fans out across every context in the relevant stack.
//! Stack length is normally 1 and transiently 2.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::LocalBroker;
use crate::error::RelayError;
use crate::mapper::ChannelMapper;
use crate::pool::{ConnectionPool, TargetConnection};
use crate::transport::MessagePacket;

/// Reports non-fatal relay errors: structured log plus an optional
/// observer channel (used by tests and embedders).
#[derive(Clone)]
pub(crate) struct ErrorSink {
    suppress_logging: bool,
    observer: Option<mpsc::UnboundedSender<RelayError>>,
}

impl ErrorSink {
    pub(crate) fn new(
        suppress_logging: bool,
        observer: Option<mpsc::UnboundedSender<RelayError>>,
    ) -> Self {
        Self {
            suppress_logging,
            observer,
        }
    }

    pub(crate) fn report(&self, err: RelayError) {
        if self.suppress_logging {
            tracing::debug!(error = %err, "cluster relay error");
        } else {
            tracing::warn!(error = %err, "cluster relay error");
        }
        if let Some(observer) = &self.observer {
            let _ = observer.send(err);
        }
    }
}

/// One topology version: a mapper bound to a fixed peer list and the
/// connections acquired for it.
pub struct MapperContext {
    mapper: Arc<dyn ChannelMapper>,
    /// Ordered peer URIs; the mapping input. Immutable once built.
    targets: Vec<String>,
    clients: HashMap<String, Arc<TargetConnection>>,
    /// Channels this context has subscribed (subscription stack only).
    subscriptions: HashSet<String>,
}

impl MapperContext {
    fn resolve(&self, channel: &str) -> Option<&str> {
        self.mapper.target(channel, &self.targets)
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn subscriptions(&self) -> &HashSet<String> {
        &self.subscriptions
    }
}

/// The sub/pub mapper stacks plus the shared connection pool.
pub struct ClusterRelay {
    broker: Arc<dyn LocalBroker>,
    pool: ConnectionPool,
    sub_mappers: VecDeque<MapperContext>,
    pub_mappers: VecDeque<MapperContext>,
    errors: ErrorSink,
}

impl ClusterRelay {
    pub(crate) fn new(
        broker: Arc<dyn LocalBroker>,
        pool: ConnectionPool,
        errors: ErrorSink,
    ) -> Self {
        Self {
            broker,
            pool,
            sub_mappers: VecDeque::new(),
            pub_mappers: VecDeque::new(),
            errors,
        }
    }

    /// Activate a new subscription topology: build a context for
    /// `targets`, append it, and replay every currently-active channel
    /// through it.
    pub async fn sub_mapper_push(
        &mut self,
        mapper: Arc<dyn ChannelMapper>,
        targets: Vec<String>,
    ) {
        let context = self.build_context(mapper, targets).await;
        self.sub_mappers.push_back(context);

        let active_channels = self.all_subscriptions();
        let newest = self.sub_mappers.len() - 1;
        for channel in active_channels {
            self.subscribe_with_context(newest, &channel).await;
        }
        self.cleanup_pool().await;
    }

    /// Retire the oldest subscription topology, unsubscribing each active
    /// channel from its mapped target unless another remaining context
    /// still maps that channel to the same target.
    pub async fn sub_mapper_shift(&mut self) {
        let active_channels = self.all_subscriptions();
        let Some(mut removed) = self.sub_mappers.pop_front() else {
            return;
        };
        for channel in &active_channels {
            self.unsubscribe_with_removed_context(&mut removed, channel)
                .await;
        }
        self.cleanup_pool().await;
    }

    /// Activate a new publish topology.
    pub async fn pub_mapper_push(
        &mut self,
        mapper: Arc<dyn ChannelMapper>,
        targets: Vec<String>,
    ) {
        let context = self.build_context(mapper, targets).await;
        self.pub_mappers.push_back(context);
        self.cleanup_pool().await;
    }

    /// Retire the oldest publish topology.
    pub async fn pub_mapper_shift(&mut self) {
        self.pub_mappers.pop_front();
        self.cleanup_pool().await;
    }

    /// Subscribe `channel` under every active subscription topology.
    pub async fn subscribe(&mut self, channel: &str) {
        for index in 0..self.sub_mappers.len() {
            self.subscribe_with_context(index, channel).await;
        }
    }

    /// Unsubscribe `channel` from every active subscription topology.
    pub async fn unsubscribe(&mut self, channel: &str) {
        for index in 0..self.sub_mappers.len() {
            self.unsubscribe_with_context(index, channel).await;
        }
    }

    /// Forward `packet` to every publish topology's mapped target.
    pub async fn publish(&self, channel: &str, packet: &MessagePacket) {
        for connection in self.resolve_publish_targets(channel) {
            if let Err(err) = connection.link.publish(channel, packet).await {
                self.errors.report(err);
            }
        }
    }

    /// Resolve the target connection of every publish context for
    /// `channel`, surfacing `NoMatchingTarget` for contexts that cannot
    /// resolve. The caller owns the actual sends (so publish acks never
    /// block unrelated work).
    pub fn resolve_publish_targets(&self, channel: &str) -> Vec<Arc<TargetConnection>> {
        let mut connections = Vec::with_capacity(self.pub_mappers.len());
        for context in &self.pub_mappers {
            match context.resolve(channel).and_then(|uri| context.clients.get(uri)) {
                Some(connection) => connections.push(connection.clone()),
                None => self.errors.report(RelayError::no_matching_target(channel)),
            }
        }
        connections
    }

    /// Union of channels already subscribed across the stack's distinct
    /// connections (visited once each, in stack order, deduplicated by
    /// channel name) plus the local broker's current channel interest.
    pub fn all_subscriptions(&self) -> Vec<String> {
        let mut visited_clients = HashSet::new();
        let mut seen = HashSet::new();
        let mut subscriptions = Vec::new();

        for context in &self.sub_mappers {
            for (uri, connection) in &context.clients {
                if !visited_clients.insert(uri.clone()) {
                    continue;
                }
                for channel in connection.subscriptions() {
                    if seen.insert(channel.clone()) {
                        subscriptions.push(channel);
                    }
                }
            }
        }

        for channel in self.broker.subscriptions() {
            if seen.insert(channel.clone()) {
                subscriptions.push(channel);
            }
        }
        subscriptions
    }

    pub fn sub_stack_len(&self) -> usize {
        self.sub_mappers.len()
    }

    pub fn pub_stack_len(&self) -> usize {
        self.pub_mappers.len()
    }

    pub fn sub_contexts(&self) -> impl Iterator<Item = &MapperContext> {
        self.sub_mappers.iter()
    }

    pub fn pub_contexts(&self) -> impl Iterator<Item = &MapperContext> {
        self.pub_mappers.iter()
    }

    /// Endpoints currently held by the pool (test/introspection surface).
    pub fn pooled_endpoints(&self) -> Vec<String> {
        self.pool.endpoints()
    }

    async fn build_context(
        &mut self,
        mapper: Arc<dyn ChannelMapper>,
        targets: Vec<String>,
    ) -> MapperContext {
        let mut clients = HashMap::with_capacity(targets.len());
        for uri in &targets {
            match self.pool.acquire(uri).await {
                Ok(connection) => {
                    clients.insert(uri.clone(), connection);
                }
                // A context missing a connection degrades to per-channel
                // NoMatchingTarget errors rather than failing the push.
                Err(err) => self.errors.report(err),
            }
        }
        MapperContext {
            mapper,
            targets,
            clients,
            subscriptions: HashSet::new(),
        }
    }

    async fn subscribe_with_context(&mut self, index: usize, channel: &str) {
        let errors = self.errors.clone();
        let context = &mut self.sub_mappers[index];
        let Some(connection) = context
            .resolve(channel)
            .and_then(|uri| context.clients.get(uri))
            .cloned()
        else {
            errors.report(RelayError::no_matching_target(channel));
            return;
        };

        context.subscriptions.insert(channel.to_string());
        connection.note_subscribed(channel);
        if let Err(err) = connection.link.subscribe(channel).await {
            errors.report(err);
        }
        // One shared consumer per connection per channel.
        if connection.note_watched(channel) {
            if let Err(err) = connection.link.watch(channel).await {
                errors.report(err);
            }
        }
    }

    async fn unsubscribe_with_context(&mut self, index: usize, channel: &str) {
        let errors = self.errors.clone();
        let context = &mut self.sub_mappers[index];
        let target = context.resolve(channel).map(str::to_string);
        context.subscriptions.remove(channel);

        let Some(connection) = target
            .as_deref()
            .and_then(|uri| context.clients.get(uri))
            .cloned()
        else {
            errors.report(RelayError::no_matching_target(channel));
            return;
        };
        let target = target.unwrap_or_default();

        if self.still_mapped_elsewhere(Some(index), channel, &target) {
            return;
        }
        self.teardown_subscription(&connection, channel).await;
    }

    async fn unsubscribe_with_removed_context(
        &mut self,
        removed: &mut MapperContext,
        channel: &str,
    ) {
        let target = removed.resolve(channel).map(str::to_string);
        removed.subscriptions.remove(channel);

        let Some(connection) = target
            .as_deref()
            .and_then(|uri| removed.clients.get(uri))
            .cloned()
        else {
            self.errors
                .report(RelayError::no_matching_target(channel));
            return;
        };
        let target = target.unwrap_or_default();

        if self.still_mapped_elsewhere(None, channel, &target) {
            return;
        }
        self.teardown_subscription(&connection, channel).await;
    }

    /// Whether any subscription context other than `skip` maps `channel`
    /// to `target` and still holds it subscribed. Tearing the channel
    /// down on the connection would break that mapping.
    fn still_mapped_elsewhere(&self, skip: Option<usize>, channel: &str, target: &str) -> bool {
        self.sub_mappers.iter().enumerate().any(|(index, other)| {
            Some(index) != skip
                && other.subscriptions.contains(channel)
                && other.resolve(channel) == Some(target)
        })
    }

    async fn teardown_subscription(&self, connection: &Arc<TargetConnection>, channel: &str) {
        connection.note_unsubscribed(channel);
        connection.note_unwatched(channel);
        if let Err(err) = connection.link.unsubscribe(channel).await {
            self.errors.report(err);
        }
        if let Err(err) = connection.link.unwatch(channel).await {
            self.errors.report(err);
        }
    }

    /// Drop pooled connections referenced by no remaining context. Runs
    /// after every push and shift.
    async fn cleanup_pool(&mut self) {
        let mut referenced = HashSet::new();
        for context in self.sub_mappers.iter().chain(self.pub_mappers.iter()) {
            referenced.extend(context.clients.keys().cloned());
        }
        self.pool.release_unreferenced(&referenced).await;
    }
}
