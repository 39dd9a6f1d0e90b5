//! Worker role of the cluster bridge.
//!
//! Client sockets attach to a worker. Calls for procedures the worker has
//! registered are served locally; everything else is forwarded to the
//! coordinator and the reply routed back to the socket that asked. Event
//! names advertised by the coordinator are registered as local stubs that
//! re-emit the event upstream.

use crate::bridge::forwarded::ForwardedLedger;
use crate::envelope::{Envelope, MessageType, SocketId, WorkerId};
use crate::guard::CallKey;
use crate::registry::{event_handler, Endpoint, Registry};
use crate::server::reply_to;
use crate::transport::{Connection, CoordinatorLink};
use crate::{Result, WampError};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

type Sockets = HashMap<SocketId, Arc<dyn Connection>>;

/// Client-facing server of one worker process.
pub struct WorkerServer {
    link: Arc<dyn CoordinatorLink>,
    registry: Arc<Registry>,
    sockets: Mutex<Sockets>,
    forwarded: Arc<ForwardedLedger>,
    config: Mutex<Map<String, Value>>,
    stubs: Mutex<HashSet<String>>,
    generation: watch::Sender<u64>,
}

impl WorkerServer {
    pub fn new(link: Arc<dyn CoordinatorLink>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            link,
            registry: Arc::new(Registry::new()),
            sockets: Mutex::new(HashMap::new()),
            forwarded: Arc::new(ForwardedLedger::new()),
            config: Mutex::new(Map::new()),
            stubs: Mutex::new(HashSet::new()),
            generation,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.link.worker_id()
    }

    /// Endpoints served without involving the coordinator.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Outstanding forwarded calls, e.g. to hand to a reaper.
    pub fn forwarded_ledger(&self) -> Arc<ForwardedLedger> {
        self.forwarded.clone()
    }

    /// Last configuration received from the coordinator.
    pub fn config(&self) -> Map<String, Value> {
        lock(&self.config).clone()
    }

    /// Event names currently stubbed on behalf of the coordinator, sorted.
    pub fn advertised_events(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.stubs).iter().cloned().collect();
        names.sort();
        names
    }

    /// Watch that ticks every time a coordinator configuration is applied.
    pub fn subscribe_config(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Ask the coordinator for its configuration.
    pub fn request_config(&self) -> Result<()> {
        self.link
            .send_to_coordinator(&Envelope::config_request(Some(self.worker_id())))
    }

    pub fn attach_socket(&self, connection: Arc<dyn Connection>) -> SocketId {
        let id = connection.id().to_string();
        debug!("Worker {}: socket {} attached", self.worker_id(), id);
        self.sockets().insert(id.clone(), connection);
        id
    }

    /// Forget a socket and every forwarded call it still had outstanding.
    ///
    /// Replies that arrive later for those calls are dropped.
    pub fn on_socket_disconnect(&self, socket_id: &str) -> usize {
        self.sockets().remove(socket_id);
        let purged = self.forwarded.purge_socket(socket_id);
        debug!(
            "Worker {}: socket {} disconnected, {} forwarded call(s) purged",
            self.worker_id(),
            socket_id,
            purged
        );
        purged
    }

    pub fn socket_count(&self) -> usize {
        self.sockets().len()
    }

    /// Process one inbound message from a client socket.
    ///
    /// Returns false when the message was dropped.
    pub fn handle_socket_message(&self, socket_id: &str, raw: &Value) -> bool {
        let Some(connection) = self.sockets().get(socket_id).cloned() else {
            warn!("Worker {}: message from unknown socket {}", self.worker_id(), socket_id);
            return false;
        };

        if let Some(call) = Envelope::validate(raw, MessageType::Call) {
            self.handle_call(connection, call);
            return true;
        }

        if let Some(event) = Envelope::validate(raw, MessageType::Event) {
            let procedure = event.procedure_name().to_string();
            if !self.registry.notify(&procedure, event.data) {
                debug!("No handler for event {}", procedure);
            }
            return true;
        }

        trace!("Dropping invalid message from {}", socket_id);
        false
    }

    fn handle_call(&self, connection: Arc<dyn Connection>, call: Envelope) {
        if self.registry.contains(call.procedure_name()) {
            self.registry.dispatch(call, reply_to(connection));
            return;
        }

        let Some(key) = CallKey::for_socket(connection.id(), &call) else {
            let error = WampError::Validation {
                field: "signature".into(),
                message: format!("call to {} cannot be forwarded unsigned", call.procedure_name()),
            };
            reply_to(connection)(Envelope::response_to(&call, Err(error.to_wire())));
            return;
        };

        if !self.forwarded.record(key.clone(), connection.clone(), call.clone()) {
            debug!("Duplicate call {} ignored", key);
            return;
        }

        let forwarded = Envelope::forwarded_call(&call, self.worker_id(), connection.id());
        if let Err(e) = self.link.send_to_coordinator(&forwarded) {
            warn!("Worker {}: forwarding {} failed: {}", self.worker_id(), key, e);
            self.forwarded.discard(&key);
            reply_to(connection)(Envelope::response_to(&call, Err(e.to_wire())));
            return;
        }
        trace!("Forwarded {} to coordinator", key);
    }

    /// Process one message addressed to this worker by the coordinator.
    pub fn handle_coordinator_message(&self, raw: &Value) -> bool {
        match Envelope::peek_kind(raw) {
            Some(MessageType::ForwardedResponse) => {
                match Envelope::validate(raw, MessageType::ForwardedResponse) {
                    Some(response) => {
                        self.deliver_response(response);
                        true
                    }
                    None => false,
                }
            }
            Some(MessageType::ConfigResponse) => {
                match Envelope::validate(raw, MessageType::ConfigResponse) {
                    Some(response) => {
                        self.apply_config(response);
                        true
                    }
                    None => false,
                }
            }
            Some(MessageType::Broadcast) => match Envelope::validate(raw, MessageType::Broadcast) {
                Some(broadcast) => {
                    let procedure = broadcast.procedure_name().to_string();
                    if !self.registry.notify(&procedure, broadcast.data) {
                        debug!("No handler for broadcast {}", procedure);
                    }
                    true
                }
                None => false,
            },
            other => {
                trace!("Worker {}: ignoring coordinator message {:?}", self.worker_id(), other);
                false
            }
        }
    }

    fn deliver_response(&self, response: Envelope) {
        let Some(key) = CallKey::from_envelope(&response) else {
            return;
        };
        match self.forwarded.complete(&key, response) {
            Ok(()) => trace!("Delivered reply for {}", key),
            Err(e @ WampError::DisconnectedTarget { .. }) => {
                debug!("Dropping late reply for {}: {}", key, e)
            }
            Err(e) => debug!("Reply for {} not delivered: {}", key, e),
        }
    }

    fn apply_config(&self, response: Envelope) {
        if let Some(config) = response.config {
            lock(&self.config).extend(config);
        }

        let mut stubs = lock(&self.stubs);
        if let Some(events) = response.registered_events {
            let advertised: HashSet<String> = events.into_iter().collect();

            for stale in stubs.difference(&advertised) {
                if matches!(self.registry.endpoint(stale), Some(Endpoint::Event(_))) {
                    self.registry.remove(stale);
                }
            }
            stubs.retain(|name| advertised.contains(name));

            let fresh: Vec<String> = advertised
                .into_iter()
                .filter(|name| stubs.contains(name) || !self.registry.contains(name))
                .collect();
            self.registry.register_event(
                fresh
                    .iter()
                    .map(|name| (name.clone(), self.event_stub(name.clone()))),
            );
            stubs.extend(fresh);
        }
        let advertised = stubs.len();
        drop(stubs);

        self.generation.send_modify(|generation| *generation += 1);
        info!(
            "Worker {}: coordinator config applied ({} advertised event(s))",
            self.worker_id(),
            advertised
        );
    }

    fn event_stub(&self, procedure: String) -> crate::registry::EventHandler {
        let link = self.link.clone();
        event_handler(move |data| {
            let event = Envelope::event(procedure.clone(), data).with_worker_id(link.worker_id());
            if let Err(e) = link.send_to_coordinator(&event) {
                warn!("Relaying event {} failed: {}", procedure, e);
            }
        })
    }

    /// Drain coordinator messages until the channel closes.
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<Value>) {
        while let Some(raw) = inbound.recv().await {
            self.handle_coordinator_message(&raw);
        }
        info!("Worker {}: coordinator channel closed", self.worker_id());
    }

    /// Serve one client socket until its inbound channel closes.
    pub async fn serve_socket(
        &self,
        connection: Arc<dyn Connection>,
        mut inbound: mpsc::UnboundedReceiver<Value>,
    ) {
        let socket_id = self.attach_socket(connection);
        while let Some(raw) = inbound.recv().await {
            self.handle_socket_message(&socket_id, &raw);
        }
        self.on_socket_disconnect(&socket_id);
    }

    fn sockets(&self) -> MutexGuard<'_, Sockets> {
        lock(&self.sockets)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::rpc_handler;
    use crate::signature::{now_ms, Signature};
    use crate::transport::{ChannelConnection, LocalCoordinatorLink, LocalWorkerLink, ClusterEvent};
    use serde_json::json;

    struct Harness {
        worker: WorkerServer,
        upstream: mpsc::UnboundedReceiver<ClusterEvent>,
        _cluster: LocalWorkerLink,
    }

    fn harness() -> Harness {
        let (cluster, mut upstream) = LocalWorkerLink::new();
        let (link, _down): (LocalCoordinatorLink, _) = cluster.spawn_worker(1).unwrap();
        // swallow WorkerStart
        let _ = upstream.try_recv();
        Harness {
            worker: WorkerServer::new(Arc::new(link)),
            upstream,
            _cluster: cluster,
        }
    }

    fn socket(worker: &WorkerServer, id: &str) -> mpsc::UnboundedReceiver<Value> {
        let (conn, rx) = ChannelConnection::new(id);
        worker.attach_socket(Arc::new(conn));
        rx
    }

    fn call_value(procedure: &str, signature: &Signature) -> Value {
        Envelope::call(procedure, json!(4), signature.clone())
            .to_value()
            .unwrap()
    }

    fn next_upstream(upstream: &mut mpsc::UnboundedReceiver<ClusterEvent>) -> Value {
        match upstream.try_recv() {
            Ok(ClusterEvent::WorkerMessage(1, value)) => value,
            other => panic!("Expected WorkerMessage, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_procedure_is_served_locally() {
        let mut h = harness();
        h.worker.registry().register_rpc([(
            "ping".to_string(),
            rpc_handler(|_, reply| reply.ok(json!("pong"))),
        )]);
        let mut rx = socket(&h.worker, "s1");

        let signature = Signature::from_parts(now_ms(), 1);
        assert!(h.worker.handle_socket_message("s1", &call_value("ping", &signature)));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["data"], json!("pong"));
        assert!(h.upstream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_procedure_is_forwarded_once() {
        let mut h = harness();
        let _rx = socket(&h.worker, "s1");
        let signature = Signature::from_parts(now_ms(), 1);
        let raw = call_value("multiplyByTwo", &signature);

        assert!(h.worker.handle_socket_message("s1", &raw));
        assert!(h.worker.handle_socket_message("s1", &raw));

        let forwarded = next_upstream(&mut h.upstream);
        assert_eq!(forwarded["type"], json!("/InterProcessRPCRequest"));
        assert_eq!(forwarded["workerId"], json!(1));
        assert_eq!(forwarded["socketId"], json!("s1"));
        assert!(h.upstream.try_recv().is_err());
        assert_eq!(h.worker.forwarded_ledger().len(), 1);
    }

    #[tokio::test]
    async fn test_forwarded_response_reaches_socket() {
        let mut h = harness();
        let mut rx = socket(&h.worker, "s1");
        let signature = Signature::from_parts(now_ms(), 1);
        h.worker
            .handle_socket_message("s1", &call_value("multiplyByTwo", &signature));

        let forwarded = next_upstream(&mut h.upstream);
        let call = Envelope::validate(&forwarded, MessageType::ForwardedCall).unwrap();
        let response =
            Envelope::forwarded_response(Envelope::response_to(&call, Ok(json!(8))), 1, "s1");
        assert!(h
            .worker
            .handle_coordinator_message(&response.to_value().unwrap()));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["type"], json!("/WAMPResponse"));
        assert_eq!(reply["data"], json!(8));
        assert!(h.worker.forwarded_ledger().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_purges_and_drops_late_reply() {
        let mut h = harness();
        let mut rx = socket(&h.worker, "s1");
        let signature = Signature::from_parts(now_ms(), 1);
        h.worker
            .handle_socket_message("s1", &call_value("multiplyByTwo", &signature));
        let forwarded = next_upstream(&mut h.upstream);

        assert_eq!(h.worker.on_socket_disconnect("s1"), 1);
        assert_eq!(h.worker.socket_count(), 0);

        let call = Envelope::validate(&forwarded, MessageType::ForwardedCall).unwrap();
        let late = Envelope::forwarded_response(Envelope::response_to(&call, Ok(json!(8))), 1, "s1");
        h.worker.handle_coordinator_message(&late.to_value().unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_config_response_installs_event_stubs() {
        let mut h = harness();
        let mut generation = h.worker.subscribe_config();

        let mut config = Map::new();
        config.insert("region".into(), json!("eu"));
        let response = Envelope::config_response(1, vec!["log".into()], config);
        assert!(h
            .worker
            .handle_coordinator_message(&response.to_value().unwrap()));

        assert!(generation.has_changed().unwrap());
        assert_eq!(*generation.borrow_and_update(), 1);
        assert_eq!(h.worker.config().get("region"), Some(&json!("eu")));
        assert_eq!(h.worker.advertised_events(), vec!["log".to_string()]);

        // A client event for the stub travels upstream tagged with the worker.
        let _rx = socket(&h.worker, "s1");
        h.worker
            .handle_socket_message("s1", &Envelope::event("log", json!("hi")).to_value().unwrap());
        let relayed = next_upstream(&mut h.upstream);
        assert_eq!(relayed["type"], json!("/EventRequest"));
        assert_eq!(relayed["workerId"], json!(1));
        assert_eq!(relayed["data"], json!("hi"));
    }

    #[tokio::test]
    async fn test_stale_stubs_are_removed_and_local_handlers_kept() {
        let h = harness();
        h.worker
            .registry()
            .register_event([("audit".to_string(), event_handler(|_| {}))]);

        let first = Envelope::config_response(1, vec!["log".into(), "audit".into()], Map::new());
        h.worker.handle_coordinator_message(&first.to_value().unwrap());
        assert_eq!(h.worker.advertised_events(), vec!["log".to_string()]);

        let second = Envelope::config_response(1, vec![], Map::new());
        h.worker.handle_coordinator_message(&second.to_value().unwrap());
        assert!(h.worker.advertised_events().is_empty());
        assert!(!h.worker.registry().contains("log"));
        assert!(h.worker.registry().contains("audit"));
    }

    #[tokio::test]
    async fn test_unsigned_call_for_remote_procedure_fails() {
        let h = harness();
        let mut rx = socket(&h.worker, "s1");
        let raw = json!({"type": "/WAMPRequest", "procedure": "remote", "data": 1});

        assert!(h.worker.handle_socket_message("s1", &raw));
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["success"], json!(false));
        assert!(h.worker.forwarded_ledger().is_empty());
    }

    #[tokio::test]
    async fn test_request_config_sends_worker_id() {
        let mut h = harness();
        h.worker.request_config().unwrap();
        let request = next_upstream(&mut h.upstream);
        assert_eq!(request["type"], json!("/MasterConfigRequest"));
        assert_eq!(request["workerId"], json!(1));
    }
}
