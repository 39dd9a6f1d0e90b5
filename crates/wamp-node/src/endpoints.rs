//! Built-in endpoints served by each node role.

use serde_json::{json, Value};
use tracing::info;
use wamp_core::{event_handler, rpc_handler, Coordinator, WorkerServer};

/// Endpoints hosted by the coordinator and reachable from every worker.
pub fn register_coordinator(coordinator: &Coordinator) {
    coordinator.register_rpc([
        (
            "multiplyByTwo".to_string(),
            rpc_handler(|data, reply| match data.as_f64() {
                Some(n) => reply.ok(multiply_by_two(&data, n)),
                None => reply.err(format!("multiplyByTwo expects a number, got {}", data)),
            }),
        ),
        (
            "ping".to_string(),
            rpc_handler(|_, reply| reply.ok(json!("pong"))),
        ),
    ]);

    coordinator.register_event([(
        "log".to_string(),
        event_handler(|data| info!("log: {}", data)),
    )]);
}

/// Endpoints a worker answers without asking the coordinator.
pub fn register_worker(worker: &WorkerServer) {
    let worker_id = worker.worker_id();
    worker.registry().register_rpc([(
        "workerInfo".to_string(),
        rpc_handler(move |_, reply| reply.ok(json!({ "workerId": worker_id }))),
    )]);

    worker.registry().register_event([(
        "announce".to_string(),
        event_handler(move |data| info!("Worker {} announcement: {}", worker_id, data)),
    )]);
}

/// Integers stay integers unless doubling overflows `i64`.
fn multiply_by_two(data: &Value, n: f64) -> Value {
    match data.as_i64().and_then(|i| i.checked_mul(2)) {
        Some(doubled) => json!(doubled),
        None => json!(n * 2.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wamp_core::{Envelope, LocalWorkerLink, MessageType, Signature};

    #[test]
    fn test_multiply_by_two_keeps_integers() {
        assert_eq!(multiply_by_two(&json!(4), 4.0), json!(8));
        assert_eq!(multiply_by_two(&json!(1.5), 1.5), json!(3.0));
    }

    #[test]
    fn test_multiply_by_two_overflow_falls_back_to_float() {
        let max = json!(i64::MAX);
        let n = max.as_f64().unwrap();
        assert_eq!(multiply_by_two(&max, n), json!(n * 2.0));

        let min = json!(i64::MIN);
        let n = min.as_f64().unwrap();
        assert_eq!(multiply_by_two(&min, n), json!(n * 2.0));
    }

    #[tokio::test]
    async fn test_coordinator_endpoints_registered() {
        let (link, _events) = LocalWorkerLink::new();
        let coordinator = Coordinator::new(Arc::new(link));
        register_coordinator(&coordinator);

        assert_eq!(
            coordinator.registry().procedures(),
            vec!["log".to_string(), "multiplyByTwo".to_string(), "ping".to_string()]
        );
        assert_eq!(coordinator.registry().registered_events(), vec!["log".to_string()]);
    }

    #[tokio::test]
    async fn test_multiply_by_two_rejects_non_numbers() {
        let (link, _events) = LocalWorkerLink::new();
        let coordinator = Coordinator::new(Arc::new(link));
        register_coordinator(&coordinator);

        let (tx, rx) = std::sync::mpsc::channel();
        let call = Envelope::call("multiplyByTwo", json!("four"), Signature::from("1580519260000_1"));
        coordinator.registry().dispatch(
            call,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        );

        let response = rx.recv().unwrap();
        assert_eq!(response.kind, MessageType::Response);
        assert_eq!(response.success, Some(false));
    }

    #[tokio::test]
    async fn test_multiply_by_two_answers_largest_integer() {
        let (link, _events) = LocalWorkerLink::new();
        let coordinator = Coordinator::new(Arc::new(link));
        register_coordinator(&coordinator);

        let (tx, rx) = std::sync::mpsc::channel();
        let call = Envelope::call("multiplyByTwo", json!(i64::MAX), Signature::from("1580519260000_1"));
        coordinator.registry().dispatch(
            call,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        );

        let response = rx.recv().unwrap();
        assert_eq!(response.success, Some(true));
        assert_eq!(response.data, json!(i64::MAX as f64 * 2.0));
    }
}
