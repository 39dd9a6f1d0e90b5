//! Wire envelopes and their validation.
//!
//! Every message on a socket or on the process channel is a JSON object
//! tagged by `type`. Inbound objects are checked against the required fields
//! of the expected kind before they are decoded; anything that fails the
//! check is dropped by the caller without raising.
//!
//! ```text
//! {"type":"/WAMPRequest","procedure":"multiplyByTwo","data":4,"signature":"1580519260000_42"}
//! ```

use crate::signature::Signature;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

/// Identifier of a worker process.
pub type WorkerId = u32;

/// Stable identity of one client connection.
pub type SocketId = String;

/// Envelope discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "/WAMPRequest")]
    Call,
    #[serde(rename = "/WAMPResponse")]
    Response,
    #[serde(rename = "/EventRequest")]
    Event,
    #[serde(rename = "/InterProcessRPCRequest")]
    ForwardedCall,
    #[serde(rename = "/InterProcessRPCResponse")]
    ForwardedResponse,
    #[serde(rename = "/MasterConfigRequest")]
    ConfigRequest,
    #[serde(rename = "/MasterConfigResponse")]
    ConfigResponse,
    #[serde(rename = "/Broadcast")]
    Broadcast,
}

impl MessageType {
    /// The `type` string carried on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Call => "/WAMPRequest",
            MessageType::Response => "/WAMPResponse",
            MessageType::Event => "/EventRequest",
            MessageType::ForwardedCall => "/InterProcessRPCRequest",
            MessageType::ForwardedResponse => "/InterProcessRPCResponse",
            MessageType::ConfigRequest => "/MasterConfigRequest",
            MessageType::ConfigResponse => "/MasterConfigResponse",
            MessageType::Broadcast => "/Broadcast",
        }
    }

    /// The kind that answers this one, if any.
    pub fn response_type(&self) -> Option<MessageType> {
        match self {
            MessageType::Call => Some(MessageType::Response),
            MessageType::Response => Some(MessageType::Call),
            MessageType::Event => None,
            MessageType::ForwardedCall => Some(MessageType::ForwardedResponse),
            MessageType::ForwardedResponse => Some(MessageType::ForwardedCall),
            MessageType::ConfigRequest => Some(MessageType::ConfigResponse),
            MessageType::ConfigResponse => Some(MessageType::ConfigRequest),
            MessageType::Broadcast => Some(MessageType::Broadcast),
        }
    }

    /// Fields that must be present for an object to count as this kind.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            MessageType::Call | MessageType::Event | MessageType::Broadcast => {
                &["type", "procedure"]
            }
            MessageType::Response => &["type", "procedure", "signature", "success", "error"],
            MessageType::ForwardedCall => {
                &["type", "procedure", "signature", "workerId", "socketId"]
            }
            MessageType::ForwardedResponse => &[
                "type",
                "procedure",
                "signature",
                "success",
                "workerId",
                "socketId",
            ],
            MessageType::ConfigRequest | MessageType::ConfigResponse => &["type"],
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed message exchanged over a socket or the process channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// `Some(Value::Null)` serializes as an explicit `"error": null`, which
    /// successful responses need to satisfy the response schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<SocketId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_events: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
}

impl Envelope {
    fn bare(kind: MessageType) -> Self {
        Self {
            kind,
            procedure: None,
            data: Value::Null,
            signature: None,
            success: None,
            error: None,
            worker_id: None,
            socket_id: None,
            registered_events: None,
            config: None,
        }
    }

    /// A client call.
    pub fn call(procedure: impl Into<String>, data: Value, signature: Signature) -> Self {
        Self {
            procedure: Some(procedure.into()),
            data,
            signature: Some(signature),
            ..Self::bare(MessageType::Call)
        }
    }

    /// A fire-and-forget event.
    pub fn event(procedure: impl Into<String>, data: Value) -> Self {
        Self {
            procedure: Some(procedure.into()),
            data,
            ..Self::bare(MessageType::Event)
        }
    }

    /// The response to `request`, echoing its procedure and signature.
    pub fn response_to(request: &Envelope, outcome: std::result::Result<Value, Value>) -> Self {
        let (success, data, error) = match outcome {
            Ok(data) => (true, data, Value::Null),
            Err(error) => (false, Value::Null, error),
        };
        Self {
            procedure: request.procedure.clone(),
            signature: request.signature.clone(),
            success: Some(success),
            data,
            error: Some(error),
            ..Self::bare(MessageType::Response)
        }
    }

    /// Re-tag a client call for the coordinator.
    pub fn forwarded_call(request: &Envelope, worker_id: WorkerId, socket_id: &str) -> Self {
        Self {
            kind: MessageType::ForwardedCall,
            worker_id: Some(worker_id),
            socket_id: Some(socket_id.to_string()),
            ..request.clone()
        }
    }

    /// Re-tag a response for the worker that forwarded the call.
    pub fn forwarded_response(response: Envelope, worker_id: WorkerId, socket_id: &str) -> Self {
        Self {
            kind: MessageType::ForwardedResponse,
            worker_id: Some(worker_id),
            socket_id: Some(socket_id.to_string()),
            ..response
        }
    }

    /// Strip the routing tags of a forwarded response back to a plain one.
    pub fn into_client_response(self) -> Self {
        Self {
            kind: MessageType::Response,
            worker_id: None,
            socket_id: None,
            error: Some(self.error.clone().unwrap_or(Value::Null)),
            ..self
        }
    }

    pub fn config_request(worker_id: Option<WorkerId>) -> Self {
        Self {
            worker_id,
            ..Self::bare(MessageType::ConfigRequest)
        }
    }

    pub fn config_response(
        worker_id: WorkerId,
        registered_events: Vec<String>,
        config: Map<String, Value>,
    ) -> Self {
        Self {
            worker_id: Some(worker_id),
            registered_events: Some(registered_events),
            config: Some(config),
            ..Self::bare(MessageType::ConfigResponse)
        }
    }

    pub fn broadcast(procedure: impl Into<String>, data: Value, worker_id: WorkerId) -> Self {
        Self {
            procedure: Some(procedure.into()),
            data,
            worker_id: Some(worker_id),
            ..Self::bare(MessageType::Broadcast)
        }
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    /// Procedure name, or the empty string for kinds that carry none.
    pub fn procedure_name(&self) -> &str {
        self.procedure.as_deref().unwrap_or_default()
    }

    /// Check `raw` against `kind` and decode it.
    pub fn validate(raw: &Value, kind: MessageType) -> Option<Envelope> {
        if !is_valid(raw, kind) {
            return None;
        }
        match serde_json::from_value(raw.clone()) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                trace!("Envelope passed validation but failed to decode: {}", e);
                None
            }
        }
    }

    /// The kind `raw` claims to be, without validating anything else.
    pub fn peek_kind(raw: &Value) -> Option<MessageType> {
        raw.get("type")
            .cloned()
            .and_then(|t| serde_json::from_value(t).ok())
    }

    pub fn to_value(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// True iff `raw` is an object carrying every required field of `kind` with
/// well-typed values and the matching discriminant.
pub fn is_valid(raw: &Value, kind: MessageType) -> bool {
    let Some(obj) = raw.as_object() else {
        return false;
    };

    if kind
        .required_fields()
        .iter()
        .any(|field| !obj.contains_key(*field))
    {
        return false;
    }

    let typed = obj.iter().all(|(field, value)| match field.as_str() {
        "type" | "procedure" | "signature" | "socketId" => value.is_string(),
        "success" => value.is_boolean(),
        "workerId" => value.is_u64(),
        "registeredEvents" => value
            .as_array()
            .map(|events| events.iter().all(Value::is_string))
            .unwrap_or(false),
        "config" => value.is_object(),
        _ => true,
    });

    typed && obj.get("type").and_then(Value::as_str) == Some(kind.as_str())
}
