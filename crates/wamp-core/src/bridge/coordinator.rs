//! Coordinator role of the cluster bridge.
//!
//! The coordinator owns the authoritative registry. It serves calls that
//! workers forward, relays worker events into its event handlers, keeps
//! every live worker's view of the configuration current, and can broadcast
//! to all workers at once.

use crate::bridge::worker_set::WorkerSet;
use crate::envelope::{Envelope, MessageType, SocketId, WorkerId};
use crate::guard::{CallKey, ConcurrencyGuard};
use crate::registry::{Endpoint, EventHandler, Registry, RpcHandler};
use crate::transport::{ClusterEvent, WorkerLink};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Authoritative endpoint host for a pool of workers.
pub struct Coordinator {
    link: Arc<dyn WorkerLink>,
    registry: Arc<Registry>,
    workers: Mutex<WorkerSet>,
    guard: Arc<ConcurrencyGuard>,
    /// Worker owning each socket that has a call in flight.
    owners: Arc<Mutex<HashMap<SocketId, WorkerId>>>,
    config: Mutex<Map<String, Value>>,
}

impl Coordinator {
    pub fn new(link: Arc<dyn WorkerLink>) -> Self {
        Self::with_config(link, Map::new())
    }

    pub fn with_config(link: Arc<dyn WorkerLink>, config: Map<String, Value>) -> Self {
        Self {
            link,
            registry: Arc::new(Registry::new()),
            workers: Mutex::new(WorkerSet::new()),
            guard: Arc::new(ConcurrencyGuard::new()),
            owners: Arc::new(Mutex::new(HashMap::new())),
            config: Mutex::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    /// Live workers in start order.
    pub fn workers(&self) -> Vec<WorkerId> {
        lock(&self.workers).as_slice().to_vec()
    }

    pub fn config(&self) -> Map<String, Value> {
        lock(&self.config).clone()
    }

    pub fn register_rpc(&self, endpoints: impl IntoIterator<Item = (String, RpcHandler)>) {
        self.registry.register_rpc(endpoints);
        self.publish_config();
    }

    pub fn register_event(&self, endpoints: impl IntoIterator<Item = (String, EventHandler)>) {
        self.registry.register_event(endpoints);
        self.publish_config();
    }

    pub fn reassign_rpc(&self, endpoints: impl IntoIterator<Item = (String, RpcHandler)>) {
        self.registry.reassign_rpc(endpoints);
        self.publish_config();
    }

    pub fn reassign_event(&self, endpoints: impl IntoIterator<Item = (String, EventHandler)>) {
        self.registry.reassign_event(endpoints);
        self.publish_config();
    }

    /// Merge keys into the shared configuration and push it to every worker.
    pub fn merge_config(&self, config: Map<String, Value>) {
        lock(&self.config).extend(config);
        self.publish_config();
    }

    pub fn on_worker_start(&self, worker_id: WorkerId) {
        if lock(&self.workers).add(worker_id) {
            info!("Worker {} started", worker_id);
        }
        self.send_config(worker_id);
    }

    /// Forget an exited worker and every in-flight marker of its sockets.
    pub fn on_worker_exit(&self, worker_id: WorkerId) {
        if lock(&self.workers).remove(worker_id) {
            info!("Worker {} exited", worker_id);
        }

        let sockets: Vec<SocketId> = {
            let mut owners = lock(&self.owners);
            let sockets: Vec<SocketId> = owners
                .iter()
                .filter(|(_, owner)| **owner == worker_id)
                .map(|(socket_id, _)| socket_id.clone())
                .collect();
            for socket_id in &sockets {
                owners.remove(socket_id);
            }
            sockets
        };
        let cleared: usize = sockets
            .iter()
            .map(|socket_id| self.guard.clear_socket(socket_id))
            .sum();
        if cleared > 0 {
            debug!("Cleared {} in-flight calls of worker {}", cleared, worker_id);
        }
    }

    /// Process one message a worker sent over its process channel.
    pub fn on_worker_message(&self, worker_id: WorkerId, raw: &Value) -> bool {
        match Envelope::peek_kind(raw) {
            Some(MessageType::ForwardedCall) => {
                match Envelope::validate(raw, MessageType::ForwardedCall) {
                    Some(call) => {
                        self.handle_forwarded_call(worker_id, call);
                        true
                    }
                    None => false,
                }
            }
            Some(MessageType::Event) => match Envelope::validate(raw, MessageType::Event) {
                Some(event) => {
                    let procedure = event.procedure_name().to_string();
                    if !self.registry.notify(&procedure, event.data) {
                        debug!("No handler for event {} from worker {}", procedure, worker_id);
                    }
                    true
                }
                None => false,
            },
            Some(MessageType::ConfigRequest) => {
                self.send_config(worker_id);
                true
            }
            other => {
                trace!("Ignoring message {:?} from worker {}", other, worker_id);
                false
            }
        }
    }

    fn handle_forwarded_call(&self, sender: WorkerId, call: Envelope) {
        let Some(key) = CallKey::from_envelope(&call) else {
            return;
        };
        if !self.guard.try_admit(&key) {
            debug!("Duplicate forwarded call {} dropped", key);
            return;
        }

        let origin = call.worker_id.unwrap_or(sender);
        lock(&self.owners).insert(key.socket_id.clone(), origin);
        let in_flight = InFlight {
            key,
            guard: self.guard.clone(),
            owners: self.owners.clone(),
        };

        if let Some(Endpoint::Event(handler)) = self.registry.endpoint(&in_flight.key.procedure) {
            // Events produce no reply; the marker clears when `in_flight` drops.
            handler(call.data);
            return;
        }

        let link = self.link.clone();
        self.registry.dispatch(
            call,
            Box::new(move |response: Envelope| {
                let in_flight = &in_flight;
                let key = &in_flight.key;
                let response = Envelope::forwarded_response(response, origin, &key.socket_id);
                if let Err(e) = link.send_to_worker(origin, &response) {
                    warn!("Reply for {} to worker {} lost: {}", key, origin, e);
                }
            }),
        );
    }

    /// Send an event to every live worker. Returns how many were reached.
    pub fn broadcast(&self, procedure: &str, data: Value) -> usize {
        let workers = self.workers();
        let mut reached = 0;
        for worker_id in workers {
            let envelope = Envelope::broadcast(procedure, data.clone(), worker_id);
            match self.link.send_to_worker(worker_id, &envelope) {
                Ok(()) => reached += 1,
                Err(e) => warn!("Broadcast {} to worker {} failed: {}", procedure, worker_id, e),
            }
        }
        reached
    }

    fn publish_config(&self) {
        for worker_id in self.workers() {
            self.send_config(worker_id);
        }
    }

    fn send_config(&self, worker_id: WorkerId) {
        let response =
            Envelope::config_response(worker_id, self.registry.registered_events(), self.config());
        if let Err(e) = self.link.send_to_worker(worker_id, &response) {
            warn!("Config for worker {} not delivered: {}", worker_id, e);
        }
    }

    /// Drain worker lifecycle events until the channel closes.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ClusterEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ClusterEvent::WorkerStart(id) => self.on_worker_start(id),
                ClusterEvent::WorkerMessage(id, raw) => {
                    self.on_worker_message(id, &raw);
                }
                ClusterEvent::WorkerExit(id) => self.on_worker_exit(id),
            }
        }
        info!("Coordinator event stream closed");
    }
}

/// In-flight marker of one admitted call.
///
/// Dropping it clears the marker, whether the handler answered, dropped its
/// reply or panicked.
struct InFlight {
    key: CallKey,
    guard: Arc<ConcurrencyGuard>,
    owners: Arc<Mutex<HashMap<SocketId, WorkerId>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut owners = lock(&self.owners);
        self.guard.delete_call(&self.key);
        if !self.guard.has_socket(&self.key.socket_id) {
            owners.remove(&self.key.socket_id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
