//! The broker: lifecycle, placement, dispatch, salvage and recovery.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parallax_core::{hash_key, AddressCache, Backoff};
use parallax_proto::{PeerMessage, Signal};
use parallax_registry::{
    BrokerState as RecordState, DestroyWorkerMode, FindBrokerReply, FindOrCreateArgs,
    FindOrCreateReply, HealthCheckReply, JoinArgs, Registry, RegistryError, SalvageMode,
    WorkerAttributes,
};
use parallax_router::{Router, RouterEvent};

use crate::agent::Agent;
use crate::class::WorkerClass;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::rpc::{RpcFailure, RpcTable};
use crate::worker::{
    CreateCause, CreateInfo, DestroyCause, DestroyInfo, Worker, WorkerContext, WorkerState,
};

/// Broker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Inactive,
    Activating,
    Active,
    Destroying,
    Destroyed,
}

/// What happens to this broker's workers on destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyMode {
    /// Park recoverable workers in the recovery set for peers to pick up.
    Recover,
    /// Discard every worker.
    NoRecover,
}

/// Options for creating a worker.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Explicit worker id; overrides both static and derived ids.
    pub worker_id: Option<String>,
    /// Attribute bag stored on the worker's record.
    pub attributes: WorkerAttributes,
}

/// Builds a [`Broker`] from a configuration and a set of worker classes.
pub struct BrokerBuilder {
    config: BrokerConfig,
    classes: HashMap<String, WorkerClass>,
}

impl BrokerBuilder {
    /// Registers a worker class; later registrations replace earlier ones
    /// of the same name.
    #[must_use]
    pub fn register(mut self, class: WorkerClass) -> Self {
        self.classes.insert(class.name().to_owned(), class);
        self
    }

    /// Connects to the registry and assembles the broker in `inactive`
    /// state.
    pub async fn build(self) -> Result<Broker> {
        let registry = Registry::connect(&self.config.registry).await?;
        let broker_id = self
            .config
            .broker_id
            .clone()
            .unwrap_or_else(|| format!("broker-{}", uuid::Uuid::new_v4()));
        let cluster = self.config.clustername.clone();
        let cache = AddressCache::new(self.config.cache());

        let shared = Arc::new_cyclic(|weak| Shared {
            config: self.config,
            broker_id,
            cluster,
            registry,
            classes: self.classes,
            workers: DashMap::new(),
            state: Mutex::new(BrokerState::Inactive),
            router: RwLock::new(None),
            listen_addr: Mutex::new(None),
            rpc: RpcTable::new(),
            clock_offset_ms: AtomicI64::new(0),
            load_dirty: AtomicBool::new(false),
            cache,
            recovery_running: AtomicBool::new(false),
            recovery_dirty: AtomicBool::new(false),
            run_cancel: Mutex::new(None),
            self_weak: weak.clone(),
        });
        Ok(Broker { shared })
    }
}

/// One peer of the fleet.
///
/// Cheap to clone; all clones share the same underlying broker.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
}

impl Broker {
    /// Starts building a broker.
    #[must_use]
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder {
            config,
            classes: HashMap::new(),
        }
    }

    /// This broker's fleet-wide identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.broker_id
    }

    /// This broker's cluster.
    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.shared.cluster
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BrokerState {
        *self.shared.state.lock()
    }

    /// The peer-visible listener address, once started.
    #[must_use]
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.shared.listen_addr.lock()
    }

    /// Joins the fleet: syncs the registry clock, primes the script
    /// cache, opens the listener, subscribes to the control channels,
    /// runs the join script and starts the periodic timer.
    pub async fn start(&self) -> Result<()> {
        self.shared.start().await
    }

    /// Leaves the fleet, tearing down local workers and salvaging per
    /// `mode`. Refused while activating (ambiguous) or already
    /// destroying/destroyed.
    pub async fn destroy(&self, mode: DestroyMode) -> Result<()> {
        self.shared.destroy(mode).await
    }

    /// Creates (or finds, on an idempotent race) a worker of a
    /// registered class somewhere in its cluster.
    pub async fn create(&self, name: &str, options: CreateOptions) -> Result<Agent> {
        self.shared.create(name, options).await
    }

    /// Finds an existing worker by id; `None` when no such worker.
    pub async fn find(&self, worker_id: &str) -> Result<Option<Agent>> {
        self.shared.find(worker_id).await
    }

    /// Request/response exchange with any worker in the fleet.
    pub async fn ask(&self, worker_id: &str, method: &str, data: Value) -> Result<Value> {
        self.shared.ask(worker_id, method, data).await
    }

    /// Fire-and-forget message to any worker in the fleet.
    pub async fn tell(&self, worker_id: &str, method: &str, data: Value) -> Result<()> {
        self.shared.tell(worker_id, method, data).await
    }

    /// Destroys a locally-hosted worker, optionally parking it for
    /// recovery.
    pub async fn destroy_worker(&self, worker_id: &str, recoverable: bool) -> Result<()> {
        self.shared.require_active()?;
        let mode = if recoverable {
            DestroyWorkerMode::Salvage
        } else {
            DestroyWorkerMode::Delete
        };
        self.shared
            .destroy_hosted_worker(worker_id, DestroyCause::System, mode)
            .await
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("broker_id", &self.shared.broker_id)
            .field("cluster", &self.shared.cluster)
            .field("state", &self.state())
            .field("workers", &self.shared.workers.len())
            .finish_non_exhaustive()
    }
}

/// A hosted worker instance plus its dispatch lock.
///
/// The lock serialises every hook call for one worker: create before
/// ask/tell, destroy behind in-flight asks.
#[derive(Clone)]
pub(crate) struct WorkerCell {
    pub(crate) ctx: Arc<WorkerContext>,
    pub(crate) instance: Arc<dyn Worker>,
    pub(crate) call_lock: Arc<tokio::sync::Mutex<()>>,
}

enum Owner {
    Local,
    Remote(String),
}

pub(crate) struct Shared {
    pub(crate) config: BrokerConfig,
    pub(crate) broker_id: String,
    pub(crate) cluster: String,
    pub(crate) registry: Registry,
    classes: HashMap<String, WorkerClass>,
    pub(crate) workers: DashMap<String, WorkerCell>,
    state: Mutex<BrokerState>,
    router: RwLock<Option<Arc<Router>>>,
    listen_addr: Mutex<Option<SocketAddr>>,
    rpc: RpcTable,
    clock_offset_ms: AtomicI64,
    load_dirty: AtomicBool,
    cache: AddressCache,
    recovery_running: AtomicBool,
    recovery_dirty: AtomicBool,
    run_cancel: Mutex<Option<CancellationToken>>,
    self_weak: Weak<Shared>,
}

impl Shared {
    // ---- lifecycle -------------------------------------------------------

    async fn start(self: &Arc<Self>) -> Result<()> {
        transition_to_activating(&mut self.state.lock())?;

        match self.start_inner().await {
            Ok(()) => {
                *self.state.lock() = BrokerState::Active;
                tracing::info!(broker_id = %self.broker_id, cluster = %self.cluster, "broker active");
                Ok(())
            }
            Err(e) => {
                // Unwind whatever was set up.
                if let Some(cancel) = self.run_cancel.lock().take() {
                    cancel.cancel();
                }
                if let Some(router) = self.router.write().take() {
                    router.close();
                }
                *self.listen_addr.lock() = None;
                *self.state.lock() = BrokerState::Inactive;
                tracing::warn!(broker_id = %self.broker_id, error = %e, "broker start failed");
                Err(e)
            }
        }
    }

    async fn start_inner(self: &Arc<Self>) -> Result<()> {
        self.sync_clock().await?;
        self.registry.prime_scripts().await?;

        // The listener binds to the interface the registry connection
        // resolves to, unless pinned by configuration.
        let bind_ip = match self.config.bind_host {
            Some(ip) => ip,
            None => self.registry.local_ip().await?,
        };

        let (router, events) = Router::new(self.config.router());
        let router = Arc::new(router);
        let addr = router.listen(bind_ip).await?;
        if addr.ip() != bind_ip {
            router.close();
            return Err(BrokerError::InvalidState(format!(
                "listener bound {} instead of requested {bind_ip}",
                addr.ip()
            )));
        }
        *self.router.write() = Some(Arc::clone(&router));
        *self.listen_addr.lock() = Some(addr);

        // Both subscriptions must be confirmed before join makes this
        // broker discoverable, or a liveness probe could race us.
        let keys = self.registry.keys().clone();
        let mut pubsub = self.registry.subscriber().await?;
        pubsub
            .subscribe(keys.broadcast_channel())
            .await
            .map_err(RegistryError::Redis)?;
        pubsub
            .subscribe(keys.unicast_channel(&self.broker_id))
            .await
            .map_err(RegistryError::Redis)?;

        self.registry
            .join(&JoinArgs {
                broker_id: self.broker_id.clone(),
                load: self.total_load(),
                cluster: self.cluster.clone(),
                addr: addr.to_string(),
                hash_key: hash_key(&self.broker_id),
            })
            .await?;

        let cancel = CancellationToken::new();
        *self.run_cancel.lock() = Some(cancel.clone());

        let shared = Arc::clone(self);
        let events_cancel = cancel.clone();
        tokio::spawn(async move {
            shared.run_event_loop(events, events_cancel).await;
        });

        let shared = Arc::clone(self);
        let pubsub_cancel = cancel.clone();
        tokio::spawn(async move {
            shared.run_pubsub(pubsub, pubsub_cancel).await;
        });

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.run_timer(cancel).await;
        });

        Ok(())
    }

    async fn destroy(self: &Arc<Self>, mode: DestroyMode) -> Result<()> {
        transition_to_destroying(&mut self.state.lock())?;
        tracing::info!(broker_id = %self.broker_id, ?mode, "broker destroying");

        // Tear down local instances; hook errors are ignored.
        let cells: Vec<WorkerCell> = self
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for cell in &cells {
            self.teardown_instance(cell, DestroyCause::System).await;
        }

        if let Some(router) = self.router.write().take() {
            router.close();
        }
        *self.listen_addr.lock() = None;

        if let Err(e) = self
            .registry
            .remove_from_rings(&self.cluster, &self.broker_id)
            .await
        {
            tracing::warn!(error = %e, "failed to leave cluster sets");
        }

        // Dropping the pub/sub connection unsubscribes both channels.
        if let Some(cancel) = self.run_cancel.lock().take() {
            cancel.cancel();
        }

        let salvage_mode = match mode {
            DestroyMode::Recover => SalvageMode::SelfRecoverable,
            DestroyMode::NoRecover => SalvageMode::SelfDiscard,
        };
        let salvage_result = self
            .registry
            .salvage(&self.broker_id, &self.cluster, salvage_mode)
            .await;

        self.rpc.clear();
        self.workers.clear();
        self.cache.clear();
        *self.state.lock() = BrokerState::Destroyed;
        tracing::info!(broker_id = %self.broker_id, "broker destroyed");

        salvage_result.map_err(BrokerError::from)
    }

    async fn restart(self: &Arc<Self>) {
        if let Err(e) = self.destroy(DestroyMode::NoRecover).await {
            tracing::warn!(error = %e, "restart: destroy failed");
            if !matches!(*self.state.lock(), BrokerState::Destroyed) {
                return;
            }
        }
        if let Err(e) = self.start().await {
            tracing::error!(error = %e, "restart: start failed");
        }
    }

    // ---- client operations ----------------------------------------------

    async fn create(self: &Arc<Self>, name: &str, options: CreateOptions) -> Result<Agent> {
        self.require_active()?;
        let class = self
            .classes
            .get(name)
            .ok_or_else(|| BrokerError::NotFound(format!("no worker class {name}")))?;
        let cluster = class.cluster().unwrap_or(&self.config.clustername).to_owned();

        let mut backoff = Backoff::new(self.config.retry_policy());
        loop {
            let picked = self
                .registry
                .pick_broker(&cluster, 100)
                .await?
                .ok_or_else(|| {
                    BrokerError::NotFound(format!("no broker available in cluster {cluster}"))
                })?;

            if picked.broker_id == self.broker_id {
                let (_, class_name, worker_id) = self
                    .local_create(
                        name,
                        options.worker_id.clone(),
                        options.attributes.clone(),
                        CreateCause::New,
                        None,
                    )
                    .await?;
                return Ok(Agent::new(worker_id, class_name, self.self_weak.clone()));
            }

            let payload = json!({
                "name": name,
                "id": options.worker_id,
                "attributes": options.attributes,
                "cause": "NEW",
            });
            let (seq, waiter) = self.rpc.register();
            let message = PeerMessage::request("onCreateWorker", seq, None, payload);

            match self.router()?.request(&picked.addr, &message).await {
                Ok(()) => {
                    return match waiter.await {
                        Ok(Ok(value)) => {
                            let (broker_id, class_name, worker_id): (String, String, String) =
                                serde_json::from_value(value).map_err(|e| {
                                    BrokerError::Registry(RegistryError::Reply(format!(
                                        "malformed create response: {e}"
                                    )))
                                })?;
                            tracing::debug!(worker_id = %worker_id, owner = %broker_id, "worker created");
                            Ok(Agent::new(worker_id, class_name, self.self_weak.clone()))
                        }
                        Ok(Err(RpcFailure::Timeout)) => Err(BrokerError::Timeout(format!(
                            "create of {name} on {} timed out",
                            picked.broker_id
                        ))),
                        Ok(Err(RpcFailure::App(err))) => Err(BrokerError::Application {
                            name: err.name,
                            message: err.message,
                        }),
                        Err(_) => Err(BrokerError::Unreachable(
                            "broker destroyed while awaiting create response".to_owned(),
                        )),
                    };
                }
                Err(e) => {
                    self.rpc.abort(seq);
                    tracing::debug!(addr = %picked.addr, error = %e, "create routing failed, repicking");
                }
            }

            match backoff.next_delay() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(BrokerError::Timeout(format!(
                        "could not place {name} within the retry budget"
                    )))
                }
            }
        }
    }

    async fn find(self: &Arc<Self>, worker_id: &str) -> Result<Option<Agent>> {
        self.require_active()?;
        let mut backoff = Backoff::new(self.config.retry_policy());
        loop {
            let reply = self
                .registry
                .find_or_create(&FindOrCreateArgs {
                    broker_id: None,
                    name: String::new(),
                    worker_id: Some(worker_id.to_owned()),
                    attributes: WorkerAttributes::default(),
                    now_ms: self.now_ms(),
                    ttl_ms: self.config.ttl_ms(),
                    for_recovery: false,
                })
                .await?;

            match reply {
                FindOrCreateReply::Found {
                    name, worker_id, ..
                } => return Ok(Some(Agent::new(worker_id, name, self.self_weak.clone()))),
                FindOrCreateReply::NotFound => return Ok(None),
                FindOrCreateReply::Retry => match backoff.next_delay() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        return Err(BrokerError::Timeout(format!(
                            "find of {worker_id} exhausted its retry budget"
                        )))
                    }
                },
            }
        }
    }

    pub(crate) async fn ask(
        self: &Arc<Self>,
        worker_id: &str,
        method: &str,
        data: Value,
    ) -> Result<Value> {
        self.require_active()?;
        let mut backoff = Backoff::new(self.config.retry_policy());
        loop {
            match self.resolve_owner(worker_id).await? {
                Some(Owner::Local) => return self.local_ask(worker_id, method, data).await,
                Some(Owner::Remote(addr)) => {
                    let (seq, waiter) = self.rpc.register();
                    let message =
                        PeerMessage::request(method, seq, Some(worker_id.to_owned()), data.clone());
                    match self.router()?.request(&addr, &message).await {
                        Ok(()) => {
                            return match waiter.await {
                                Ok(Ok(value)) => Ok(value),
                                Ok(Err(RpcFailure::Timeout)) => Err(BrokerError::Timeout(
                                    format!("ask {method} to {worker_id} timed out"),
                                )),
                                Ok(Err(RpcFailure::App(err))) => Err(BrokerError::Application {
                                    name: err.name,
                                    message: err.message,
                                }),
                                Err(_) => Err(BrokerError::Unreachable(
                                    "broker destroyed while awaiting response".to_owned(),
                                )),
                            };
                        }
                        Err(e) => {
                            self.rpc.abort(seq);
                            self.cache.remove(worker_id);
                            tracing::debug!(addr = %addr, error = %e, "ask routing failed, re-resolving");
                        }
                    }
                }
                None => {
                    self.cache.remove(worker_id);
                }
            }

            match backoff.next_delay() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(BrokerError::Timeout(format!(
                        "could not reach worker {worker_id} within the retry budget"
                    )))
                }
            }
        }
    }

    pub(crate) async fn tell(
        self: &Arc<Self>,
        worker_id: &str,
        method: &str,
        data: Value,
    ) -> Result<()> {
        self.require_active()?;
        let mut backoff = Backoff::new(self.config.retry_policy());
        loop {
            match self.resolve_owner(worker_id).await? {
                Some(Owner::Local) => {
                    self.local_tell(worker_id, method, data);
                    return Ok(());
                }
                Some(Owner::Remote(addr)) => {
                    let message =
                        PeerMessage::tell(method, Some(worker_id.to_owned()), data.clone());
                    match self.router()?.request(&addr, &message).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            self.cache.remove(worker_id);
                            tracing::debug!(addr = %addr, error = %e, "tell routing failed, re-resolving");
                        }
                    }
                }
                None => {
                    self.cache.remove(worker_id);
                }
            }

            match backoff.next_delay() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(BrokerError::Timeout(format!(
                        "could not reach worker {worker_id} within the retry budget"
                    )))
                }
            }
        }
    }

    /// Resolves which broker owns a worker. `None` asks the caller to
    /// retry after a salvage cycle.
    async fn resolve_owner(&self, worker_id: &str) -> Result<Option<Owner>> {
        if self.workers.contains_key(worker_id) {
            return Ok(Some(Owner::Local));
        }
        if let Some(addr) = self.cache.get(worker_id) {
            return Ok(Some(Owner::Remote(addr)));
        }

        match self.registry.find_broker(&self.broker_id, worker_id).await? {
            FindBrokerReply::Found {
                broker_id,
                state,
                addr,
                ..
            } => {
                if broker_id == self.broker_id {
                    Ok(Some(Owner::Local))
                } else if state == Some(RecordState::Active) {
                    self.cache.insert(worker_id, addr.clone());
                    Ok(Some(Owner::Remote(addr)))
                } else {
                    // Owner invalidated; salvage is in motion.
                    Ok(None)
                }
            }
            FindBrokerReply::NotFound => {
                Err(BrokerError::NotFound(format!("no worker {worker_id}")))
            }
            FindBrokerReply::Invalidated { broker_id } => {
                tracing::debug!(worker_id, dead_broker = %broker_id, "owner invalidated, retrying");
                Ok(None)
            }
        }
    }

    // ---- local worker table ---------------------------------------------

    /// Runs the create path on this broker as owner.
    ///
    /// Returns the winning `(brokerId, name, workerId)` triple; only when
    /// this broker won the allocation is an instance constructed.
    pub(crate) async fn local_create(
        self: &Arc<Self>,
        name: &str,
        worker_id: Option<String>,
        attributes: WorkerAttributes,
        cause: CreateCause,
        created_at: Option<u64>,
    ) -> Result<(String, String, String)> {
        let class = self
            .classes
            .get(name)
            .ok_or_else(|| BrokerError::NotFound(format!("no worker class {name}")))?
            .clone();

        let mut backoff = Backoff::new(self.config.retry_policy());
        let (owner, class_name, worker_id) = loop {
            let reply = self
                .registry
                .find_or_create(&FindOrCreateArgs {
                    broker_id: Some(self.broker_id.clone()),
                    name: name.to_owned(),
                    worker_id: worker_id.clone(),
                    attributes: attributes.clone(),
                    now_ms: created_at.unwrap_or_else(|| self.now_ms()),
                    ttl_ms: self.config.ttl_ms(),
                    for_recovery: cause == CreateCause::Recovery,
                })
                .await?;

            match reply {
                FindOrCreateReply::Found {
                    broker_id,
                    name,
                    worker_id,
                } => break (broker_id, name, worker_id),
                FindOrCreateReply::NotFound => {
                    return Err(BrokerError::Registry(RegistryError::Reply(
                        "find_or_create returned not-found in create mode".to_owned(),
                    )))
                }
                FindOrCreateReply::Retry => match backoff.next_delay() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        return Err(BrokerError::Timeout(format!(
                            "create of {name} exhausted its retry budget"
                        )))
                    }
                },
            }
        };

        if owner == self.broker_id {
            self.ensure_local_instance(&class, &worker_id, attributes, cause)
                .await;
        }
        Ok((owner, class_name, worker_id))
    }

    /// Constructs and activates the local instance exactly once.
    ///
    /// The dispatch lock is taken before the cell becomes visible, so an
    /// ask that resolves this worker mid-activation blocks until
    /// `on_create` has completed.
    async fn ensure_local_instance(
        self: &Arc<Self>,
        class: &WorkerClass,
        worker_id: &str,
        attributes: WorkerAttributes,
        cause: CreateCause,
    ) {
        use dashmap::mapref::entry::Entry;

        let call_lock = Arc::new(tokio::sync::Mutex::new(()));
        let guard = Arc::clone(&call_lock).lock_owned().await;

        let cell = match self.workers.entry(worker_id.to_owned()) {
            // An idempotent race replay: the instance already exists.
            Entry::Occupied(_) => return,
            Entry::Vacant(vacant) => {
                let ctx = Arc::new(WorkerContext {
                    worker_id: worker_id.to_owned(),
                    attributes,
                    state: AtomicU8::new(WorkerState::Inactive as u8),
                    load: AtomicU32::new(0),
                    pending_destroy: AtomicBool::new(false),
                    broker: self.self_weak.clone(),
                });
                let cell = WorkerCell {
                    ctx,
                    instance: class.instantiate(),
                    call_lock,
                };
                vacant.insert(cell.clone());
                cell
            }
        };

        cell.ctx.set_state(WorkerState::Activating);
        if let Err(e) = cell.instance.on_create(&cell.ctx, CreateInfo { cause }).await {
            tracing::warn!(worker_id, error = %e, "on_create failed (ignored)");
        }
        cell.ctx.set_state(WorkerState::Active);
        drop(guard);
        tracing::debug!(worker_id, ?cause, "worker active");

        // A self-destroy issued during activation lands here.
        if cell.ctx.pending_destroy.swap(false, Ordering::AcqRel) {
            if let Err(e) = self
                .destroy_local_worker(worker_id, DestroyCause::SelfRequested)
                .await
            {
                tracing::warn!(worker_id, error = %e, "deferred destroy failed");
            }
        }
    }

    /// Self-destroy path: tears down the instance and deletes its record
    /// (self-destruction is non-recoverable).
    pub(crate) async fn destroy_local_worker(
        self: &Arc<Self>,
        worker_id: &str,
        cause: DestroyCause,
    ) -> Result<()> {
        self.destroy_hosted_worker(worker_id, cause, DestroyWorkerMode::Delete)
            .await
    }

    /// Tears down a hosted instance and updates its registry record.
    pub(crate) async fn destroy_hosted_worker(
        self: &Arc<Self>,
        worker_id: &str,
        cause: DestroyCause,
        mode: DestroyWorkerMode,
    ) -> Result<()> {
        let cell = self
            .workers
            .get(worker_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::NotFound(format!("no local worker {worker_id}")))?;
        if matches!(
            cell.ctx.state(),
            WorkerState::Destroying | WorkerState::Destroyed
        ) {
            return Err(BrokerError::InvalidState(format!(
                "worker {worker_id} is already destroyed"
            )));
        }

        self.teardown_instance(&cell, cause).await;
        self.workers.remove(worker_id);
        self.mark_load_dirty();
        self.registry
            .destroy_worker(&self.broker_id, worker_id, mode, self.now_ms())
            .await?;
        Ok(())
    }

    /// Runs the destroy hook behind any in-flight dispatch.
    pub(crate) async fn teardown_instance(&self, cell: &WorkerCell, cause: DestroyCause) {
        let _guard = cell.call_lock.lock().await;
        if matches!(
            cell.ctx.state(),
            WorkerState::Destroying | WorkerState::Destroyed
        ) {
            return;
        }
        cell.ctx.set_state(WorkerState::Destroying);
        if let Err(e) = cell
            .instance
            .on_destroy(&cell.ctx, DestroyInfo { cause })
            .await
        {
            tracing::warn!(worker_id = %cell.ctx.id(), error = %e, "on_destroy failed (ignored)");
        }
        cell.ctx.set_state(WorkerState::Destroyed);
    }

    async fn local_ask(&self, worker_id: &str, method: &str, data: Value) -> Result<Value> {
        let cell = self
            .workers
            .get(worker_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BrokerError::NotFound(format!("no worker {worker_id}")))?;

        let _guard = cell.call_lock.lock().await;
        if cell.ctx.state() != WorkerState::Active {
            return Err(BrokerError::NotFound(format!(
                "worker {worker_id} is gone"
            )));
        }
        cell.instance
            .on_ask(&cell.ctx, method, data)
            .await
            .map_err(|e| BrokerError::Application {
                name: e.name,
                message: e.message,
            })
    }

    fn local_tell(self: &Arc<Self>, worker_id: &str, method: &str, data: Value) {
        let Some(cell) = self
            .workers
            .get(worker_id)
            .map(|entry| entry.value().clone())
        else {
            return;
        };
        let method = method.to_owned();
        tokio::spawn(async move {
            let _guard = cell.call_lock.lock().await;
            if cell.ctx.state() != WorkerState::Active {
                return;
            }
            if let Err(e) = cell.instance.on_tell(&cell.ctx, &method, data).await {
                tracing::warn!(worker_id = %cell.ctx.id(), method = %method, error = %e, "on_tell failed (ignored)");
            }
        });
    }

    // ---- inbound dispatch ------------------------------------------------

    async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<RouterEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    None => break,
                    Some(event) => event,
                },
            };

            match event {
                RouterEvent::Request {
                    message,
                    requester_id,
                } => {
                    let shared = Arc::clone(&self);
                    tokio::spawn(async move {
                        shared.handle_request(message, requester_id).await;
                    });
                }
                RouterEvent::Response { message } => self.handle_response(&message),
                RouterEvent::Disconnect { addr } => {
                    tracing::debug!(addr = %addr, "peer disconnected");
                }
            }
        }
    }

    fn handle_response(&self, message: &PeerMessage) {
        let Some(seq) = message.seq else {
            return;
        };
        let result = match message.response_result() {
            Ok(value) => Ok(value),
            Err(err) => Err(RpcFailure::App(err)),
        };
        if !self.rpc.complete(seq, result) {
            tracing::debug!(seq, "response with no waiter (timed out?)");
        }
    }

    async fn handle_request(self: &Arc<Self>, message: PeerMessage, requester_id: u64) {
        let PeerMessage { m, seq, wid, pl } = message;
        match (m.as_deref(), wid) {
            (Some("onCreateWorker"), None) => {
                self.handle_create_rpc(seq, pl, requester_id).await;
            }
            (Some(method), Some(worker_id)) => {
                self.dispatch_inbound(&worker_id, method, seq, pl, requester_id)
                    .await;
            }
            _ => {
                tracing::debug!(requester_id, "unroutable request ignored");
            }
        }
    }

    async fn handle_create_rpc(self: &Arc<Self>, seq: Option<u64>, pl: Value, requester_id: u64) {
        #[derive(Deserialize)]
        struct CreateRpc {
            name: String,
            #[serde(default)]
            id: Option<String>,
            #[serde(default)]
            attributes: WorkerAttributes,
            #[serde(default)]
            cause: Option<String>,
            #[serde(rename = "createdAt", default)]
            created_at: Option<u64>,
        }

        let Some(seq) = seq else {
            tracing::debug!(requester_id, "create request without sequence ignored");
            return;
        };

        let result = match serde_json::from_value::<CreateRpc>(pl) {
            Ok(rpc) => {
                let cause = match rpc.cause.as_deref() {
                    Some("RECOVERY") => CreateCause::Recovery,
                    _ => CreateCause::New,
                };
                self.local_create(&rpc.name, rpc.id, rpc.attributes, cause, rpc.created_at)
                    .await
            }
            Err(e) => Err(BrokerError::Application {
                name: "Protocol".to_owned(),
                message: format!("malformed create payload: {e}"),
            }),
        };

        let response = match result {
            Ok((broker_id, name, worker_id)) => {
                PeerMessage::response_ok(seq, json!([broker_id, name, worker_id]))
            }
            Err(e) => PeerMessage::response_err(seq, error_name(&e), e.to_string()),
        };
        self.respond(requester_id, &response).await;
    }

    async fn dispatch_inbound(
        self: &Arc<Self>,
        worker_id: &str,
        method: &str,
        seq: Option<u64>,
        data: Value,
        requester_id: u64,
    ) {
        let Some(cell) = self
            .workers
            .get(worker_id)
            .map(|entry| entry.value().clone())
        else {
            if let Some(seq) = seq {
                let response = PeerMessage::response_err(
                    seq,
                    "NotFound",
                    format!("no worker {worker_id} on this broker"),
                );
                self.respond(requester_id, &response).await;
            }
            return;
        };

        let _guard = cell.call_lock.lock().await;
        if cell.ctx.state() != WorkerState::Active {
            if let Some(seq) = seq {
                let response = PeerMessage::response_err(
                    seq,
                    "NotFound",
                    format!("worker {worker_id} is gone"),
                );
                self.respond(requester_id, &response).await;
            }
            return;
        }

        if let Some(seq) = seq {
            let response = match cell.instance.on_ask(&cell.ctx, method, data).await {
                Ok(value) => PeerMessage::response_ok(seq, value),
                Err(e) => PeerMessage::response_err(seq, e.name, e.message),
            };
            self.respond(requester_id, &response).await;
        } else if let Err(e) = cell.instance.on_tell(&cell.ctx, method, data).await {
            tracing::warn!(worker_id, method, error = %e, "on_tell failed (ignored)");
        }
    }

    async fn respond(&self, requester_id: u64, response: &PeerMessage) {
        let Ok(router) = self.router() else {
            return;
        };
        if let Err(e) = router.respond(requester_id, response).await {
            tracing::warn!(requester_id, error = %e, "response failed");
        }
    }

    // ---- control signals and recovery ------------------------------------

    async fn run_pubsub(
        self: Arc<Self>,
        mut pubsub: redis::aio::PubSub,
        cancel: CancellationToken,
    ) {
        let broadcast = self.registry.keys().broadcast_channel();
        let mut stream = pubsub.on_message();
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                message = stream.next() => match message {
                    None => {
                        tracing::warn!("registry pub/sub connection lost");
                        break;
                    }
                    Some(message) => message,
                },
            };

            if message.get_channel_name() != broadcast {
                // Unicast traffic is liveness probes only.
                continue;
            }
            match Signal::parse(message.get_payload_bytes()) {
                Ok(None) => {}
                Ok(Some(signal)) => self.handle_signal(signal),
                Err(e) => {
                    tracing::debug!(error = %e, "unknown signal ignored");
                }
            }
        }
    }

    fn handle_signal(self: &Arc<Self>, signal: Signal) {
        tracing::debug!(?signal, "signal received");
        match signal {
            Signal::Recover => self.drive_recovery(),
            Signal::Salvage {
                clustername,
                broker_id,
            } => {
                let shared = self.self_weak.clone();
                tokio::spawn(async move {
                    let Some(shared) = shared.upgrade() else {
                        return;
                    };
                    match shared
                        .registry
                        .salvage(&broker_id, &clustername, SalvageMode::Peer)
                        .await
                    {
                        Ok(()) => shared.drive_recovery(),
                        Err(e) => {
                            tracing::warn!(target_broker = %broker_id, error = %e, "salvage failed");
                        }
                    }
                });
            }
            Signal::Restart => {
                let shared = self.self_weak.clone();
                tokio::spawn(async move {
                    if let Some(shared) = shared.upgrade() {
                        shared.restart().await;
                    }
                });
            }
        }
    }

    /// Drives the recovery loop, single-flight per broker.
    ///
    /// Every living peer receives the `recover` broadcast and competes
    /// for each entry; `fetch_for_recovery` removes entries atomically so
    /// exactly one peer wins any given worker, spreading recovery across
    /// the fleet.
    pub(crate) fn drive_recovery(self: &Arc<Self>) {
        if self.recovery_running.swap(true, Ordering::AcqRel) {
            self.recovery_dirty.store(true, Ordering::Release);
            return;
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if *shared.state.lock() != BrokerState::Active {
                    break;
                }
                shared.recovery_dirty.store(false, Ordering::Release);

                let batch = match shared
                    .registry
                    .fetch_for_recovery(
                        shared.now_ms(),
                        shared.config.ttl_ms(),
                        shared.config.batch_read_size,
                    )
                    .await
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(error = %e, "recovery fetch failed");
                        break;
                    }
                };

                for record in batch.records {
                    let Some(worker_id) = record.id.clone() else {
                        continue;
                    };
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::as_conversions)]
                    let created_at = record.created_at.map(|ms| ms as u64);
                    if let Err(e) = shared
                        .local_create(
                            &record.name,
                            Some(worker_id.clone()),
                            record.attributes.clone(),
                            CreateCause::Recovery,
                            created_at,
                        )
                        .await
                    {
                        // One bad record must not stall the loop.
                        tracing::warn!(worker_id = %worker_id, error = %e, "worker recovery failed");
                    } else {
                        tracing::info!(worker_id = %worker_id, "worker recovered");
                    }
                }

                if batch.remaining == 0 && !shared.recovery_dirty.load(Ordering::Acquire) {
                    break;
                }
            }

            shared.recovery_running.store(false, Ordering::Release);
            if shared.recovery_dirty.swap(false, Ordering::AcqRel) {
                shared.drive_recovery();
            }
        });
    }

    // ---- periodic timer ---------------------------------------------------

    async fn run_timer(self: Arc<Self>, cancel: CancellationToken) {
        const CLOCK_SYNC_PERIOD: Duration = Duration::from_secs(30);

        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_sync = Instant::now();
        let health_period = self.config.health_check_interval.as_secs();
        let mut health_countdown = health_period;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if last_sync.elapsed() >= CLOCK_SYNC_PERIOD {
                match self.sync_clock().await {
                    Ok(()) => last_sync = Instant::now(),
                    Err(e) => tracing::warn!(error = %e, "registry clock sync failed"),
                }
            }

            let swept = self.rpc.sweep(self.config.rpc_timeout);
            if swept > 0 {
                tracing::debug!(swept, "asks timed out");
            }

            self.flush_load().await;

            if health_period > 0 {
                health_countdown -= 1;
                if health_countdown == 0 {
                    health_countdown = health_period;
                    match self
                        .registry
                        .health_check(&self.broker_id, &self.cluster)
                        .await
                    {
                        Ok(HealthCheckReply::Healthy) => {}
                        Ok(HealthCheckReply::SalvageIssued) => {
                            tracing::debug!("health check issued salvage for the next peer");
                        }
                        Ok(HealthCheckReply::Pruned(message)) => {
                            tracing::warn!(message, "health check pruned a ring entry");
                        }
                        Err(e) => tracing::warn!(error = %e, "health check failed"),
                    }
                }
            }
        }
    }

    // ---- shared helpers ---------------------------------------------------

    pub(crate) fn mark_load_dirty(&self) {
        self.load_dirty.store(true, Ordering::Release);
    }

    /// Writes the aggregate load as a single-shot score update if it is
    /// dirty. A failed write is re-flagged; the next tick recomputes.
    pub(crate) async fn flush_load(&self) {
        if !self.load_dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let total = self.total_load();
        if let Err(e) = self
            .registry
            .update_load(&self.cluster, &self.broker_id, total)
            .await
        {
            tracing::warn!(error = %e, "load update failed");
            self.load_dirty.store(true, Ordering::Release);
        }
    }

    fn total_load(&self) -> u64 {
        self.workers
            .iter()
            .map(|entry| u64::from(entry.value().ctx.load()))
            .sum()
    }

    async fn sync_clock(&self) -> Result<()> {
        let server_ms = self.registry.server_time_ms().await?;
        let local_ms = local_epoch_ms();
        let offset = i64::try_from(server_ms).unwrap_or(i64::MAX) - local_ms;
        self.clock_offset_ms.store(offset, Ordering::Release);
        tracing::debug!(offset_ms = offset, "registry clock synced");
        Ok(())
    }

    /// Local wall clock corrected by the registry offset, in ms.
    pub(crate) fn now_ms(&self) -> u64 {
        let adjusted = local_epoch_ms() + self.clock_offset_ms.load(Ordering::Acquire);
        u64::try_from(adjusted).unwrap_or(0)
    }

    fn require_active(&self) -> Result<()> {
        let state = *self.state.lock();
        if state == BrokerState::Active {
            Ok(())
        } else {
            Err(BrokerError::InvalidState(format!(
                "broker is {state:?}, not active"
            )))
        }
    }

    fn router(&self) -> Result<Arc<Router>> {
        self.router
            .read()
            .clone()
            .ok_or_else(|| BrokerError::InvalidState("router is not running".to_owned()))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn local_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn transition_to_activating(state: &mut BrokerState) -> Result<()> {
    match *state {
        BrokerState::Inactive | BrokerState::Destroyed => {
            *state = BrokerState::Activating;
            Ok(())
        }
        other => Err(BrokerError::InvalidState(format!(
            "cannot start while {other:?}"
        ))),
    }
}

fn transition_to_destroying(state: &mut BrokerState) -> Result<()> {
    match *state {
        BrokerState::Active => {
            *state = BrokerState::Destroying;
            Ok(())
        }
        BrokerState::Activating => Err(BrokerError::InvalidState(
            "destroy during activation is ambiguous".to_owned(),
        )),
        other => Err(BrokerError::InvalidState(format!(
            "cannot destroy while {other:?}"
        ))),
    }
}

/// Category name carried on the wire for an error response.
fn error_name(error: &BrokerError) -> &str {
    match error {
        BrokerError::NotFound(_) => "NotFound",
        BrokerError::Unreachable(_) => "Unreachable",
        BrokerError::Timeout(_) => "Timeout",
        BrokerError::InvalidState(_) => "InvalidState",
        BrokerError::Registry(_) => "RegistryFault",
        BrokerError::Application { name, .. } => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_transitions() {
        let mut state = BrokerState::Inactive;
        transition_to_activating(&mut state).unwrap();
        assert_eq!(state, BrokerState::Activating);

        // Restart after destroy is permitted.
        let mut state = BrokerState::Destroyed;
        transition_to_activating(&mut state).unwrap();
        assert_eq!(state, BrokerState::Activating);

        for from in [BrokerState::Activating, BrokerState::Active, BrokerState::Destroying] {
            let mut state = from;
            assert!(transition_to_activating(&mut state).is_err());
            assert_eq!(state, from);
        }
    }

    #[test]
    fn destroy_transitions() {
        let mut state = BrokerState::Active;
        transition_to_destroying(&mut state).unwrap();
        assert_eq!(state, BrokerState::Destroying);

        for from in [
            BrokerState::Inactive,
            BrokerState::Activating,
            BrokerState::Destroying,
            BrokerState::Destroyed,
        ] {
            let mut state = from;
            assert!(transition_to_destroying(&mut state).is_err());
            assert_eq!(state, from);
        }
    }

    #[test]
    fn error_names_for_wire() {
        assert_eq!(error_name(&BrokerError::NotFound("x".into())), "NotFound");
        assert_eq!(error_name(&BrokerError::Timeout("x".into())), "Timeout");
        assert_eq!(
            error_name(&BrokerError::Application {
                name: "RangeError".into(),
                message: "x".into()
            }),
            "RangeError"
        );
    }

    #[test]
    fn create_options_default() {
        let options = CreateOptions::default();
        assert!(options.worker_id.is_none());
        assert!(!options.attributes.recoverable);
    }
}
