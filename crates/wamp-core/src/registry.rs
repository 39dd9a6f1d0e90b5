//! Endpoint registry and dispatcher.
//!
//! Procedures map to exactly one [`Endpoint`]: an RPC handler that answers
//! through a [`Reply`], or an event handler that answers nothing. When both
//! kinds compete for a name, the RPC wins: an RPC registration replaces an
//! event of the same name, and an event registration never displaces an RPC.
//!
//! Handlers are cloned out of the map and invoked after the lock is released,
//! so a handler may register further endpoints without deadlocking.

use crate::envelope::Envelope;
use crate::WampError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace, warn};

/// Handler for a request/response procedure.
pub type RpcHandler = Arc<dyn Fn(Value, Reply) + Send + Sync>;

/// Handler for a fire-and-forget procedure.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Where a finished response envelope goes.
pub type ReplySink = Box<dyn FnOnce(Envelope) + Send>;

/// Wrap a closure as an [`RpcHandler`].
pub fn rpc_handler<F>(f: F) -> RpcHandler
where
    F: Fn(Value, Reply) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as an [`EventHandler`].
pub fn event_handler<F>(f: F) -> EventHandler
where
    F: Fn(Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A registered procedure.
#[derive(Clone)]
pub enum Endpoint {
    Rpc(RpcHandler),
    Event(EventHandler),
}

impl Endpoint {
    pub fn is_rpc(&self) -> bool {
        matches!(self, Endpoint::Rpc(_))
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Rpc(_) => f.write_str("Endpoint::Rpc"),
            Endpoint::Event(_) => f.write_str("Endpoint::Event"),
        }
    }
}

/// One-shot reply handle given to an RPC handler.
///
/// Consumed by [`Reply::send`], so a handler can answer at most once.
pub struct Reply {
    request: Envelope,
    sink: Option<ReplySink>,
}

impl Reply {
    pub fn new(request: Envelope, sink: ReplySink) -> Self {
        Self {
            request,
            sink: Some(sink),
        }
    }

    /// Answer with `Ok(data)` or `Err(error)`.
    pub fn send(mut self, outcome: std::result::Result<Value, Value>) {
        if let Some(sink) = self.sink.take() {
            sink(Envelope::response_to(&self.request, outcome));
        }
    }

    pub fn ok(self, data: Value) {
        self.send(Ok(data))
    }

    pub fn err(self, error: impl Into<Value>) {
        self.send(Err(error.into()))
    }

    /// Procedure of the call being answered.
    pub fn procedure(&self) -> &str {
        self.request.procedure_name()
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if self.sink.is_some() {
            debug!(
                "Reply for {} dropped without an answer",
                self.request.procedure_name()
            );
        }
    }
}

/// Typed map from procedure name to endpoint.
#[derive(Default)]
pub struct Registry {
    endpoints: RwLock<HashMap<String, Endpoint>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge RPC endpoints into the registry.
    pub fn register_rpc(&self, endpoints: impl IntoIterator<Item = (String, RpcHandler)>) {
        let mut map = self.write();
        for (name, handler) in endpoints {
            debug!("Registering RPC endpoint {}", name);
            map.insert(name, Endpoint::Rpc(handler));
        }
    }

    /// Merge event endpoints into the registry.
    pub fn register_event(&self, endpoints: impl IntoIterator<Item = (String, EventHandler)>) {
        let mut map = self.write();
        for (name, handler) in endpoints {
            insert_event(&mut map, name, handler);
        }
    }

    /// Replace every RPC endpoint.
    pub fn reassign_rpc(&self, endpoints: impl IntoIterator<Item = (String, RpcHandler)>) {
        let mut map = self.write();
        map.retain(|_, endpoint| !endpoint.is_rpc());
        for (name, handler) in endpoints {
            map.insert(name, Endpoint::Rpc(handler));
        }
        debug!("Reassigned RPC endpoints ({} total)", map.len());
    }

    /// Replace every event endpoint.
    pub fn reassign_event(&self, endpoints: impl IntoIterator<Item = (String, EventHandler)>) {
        let mut map = self.write();
        map.retain(|_, endpoint| endpoint.is_rpc());
        for (name, handler) in endpoints {
            insert_event(&mut map, name, handler);
        }
        debug!("Reassigned event endpoints ({} total)", map.len());
    }

    /// Unregister a single procedure of either kind.
    pub fn remove(&self, procedure: &str) -> Option<Endpoint> {
        self.write().remove(procedure)
    }

    pub fn endpoint(&self, procedure: &str) -> Option<Endpoint> {
        self.read().get(procedure).cloned()
    }

    pub fn contains(&self, procedure: &str) -> bool {
        self.read().contains_key(procedure)
    }

    /// Every registered procedure name, sorted.
    pub fn procedures(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names bound to event handlers, sorted.
    pub fn registered_events(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, endpoint)| !endpoint.is_rpc())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Route a call or event envelope to its handler.
    ///
    /// RPC handlers answer through `sink`; events never touch it; unknown
    /// procedures are answered immediately with a failed response listing
    /// what is registered.
    pub fn dispatch(&self, request: Envelope, sink: ReplySink) {
        let procedure = request.procedure_name().to_string();
        match self.endpoint(&procedure) {
            Some(Endpoint::Rpc(handler)) => {
                trace!("Dispatching RPC {}", procedure);
                let data = request.data.clone();
                handler(data, Reply::new(request, sink));
            }
            Some(Endpoint::Event(handler)) => {
                trace!("Dispatching event {}", procedure);
                handler(request.data);
            }
            None => {
                debug!("Procedure {} not registered, replying now", procedure);
                let error = WampError::ProcedureNotFound {
                    procedure: procedure.clone(),
                };
                let mut response = Envelope::response_to(&request, Err(error.to_wire()));
                response.data = Value::from(self.procedures());
                sink(response);
            }
        }
    }

    /// Fire a procedure with nobody waiting for the answer.
    ///
    /// Returns false when nothing is registered under `procedure`.
    pub fn notify(&self, procedure: &str, data: Value) -> bool {
        match self.endpoint(procedure) {
            Some(Endpoint::Event(handler)) => {
                handler(data);
                true
            }
            Some(Endpoint::Rpc(handler)) => {
                let request = Envelope::event(procedure, data.clone());
                let name = procedure.to_string();
                handler(
                    data,
                    Reply::new(
                        request,
                        Box::new(move |response| {
                            trace!(
                                "Discarding notification result for {} (success={:?})",
                                name,
                                response.success
                            );
                        }),
                    ),
                );
                true
            }
            None => false,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn insert_event(map: &mut HashMap<String, Endpoint>, name: String, handler: EventHandler) {
    if matches!(map.get(&name), Some(Endpoint::Rpc(_))) {
        warn!(
            "Event endpoint {} ignored: an RPC endpoint with that name takes priority",
            name
        );
        return;
    }
    debug!("Registering event endpoint {}", name);
    map.insert(name, Endpoint::Event(handler));
}
