//! The engine message data type

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Direction of a message plus its direction-specific attribute.
///
/// Requests carry the unix timestamp at which they were created; replies
/// carry the `processed` flag from the handling module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Engine-bound or engine-originated request.
    Request {
        /// Creation time, unix seconds.
        time: u64,
    },
    /// Reply to a request, matched by id.
    Reply {
        /// Whether a module claimed to have processed the message.
        processed: bool,
    },
}

/// One extmodule message: a name, an id, a direction, a return value and a
/// free-form string parameter dictionary.
///
/// Parameter keys the engine is not told about are preserved verbatim; a
/// parameter is simply absent rather than ever holding a null value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    name: String,
    id: String,
    kind: MessageKind,
    retvalue: String,
    params: HashMap<String, String>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Message {
    /// Create a request with a fresh unique id and the current time.
    pub fn request(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4().simple().to_string(),
            kind: MessageKind::Request { time: unix_now() },
            retvalue: String::new(),
            params: HashMap::new(),
        }
    }

    /// Assemble a message from its decoded wire parts.
    pub fn from_parts(
        name: impl Into<String>,
        id: impl Into<String>,
        kind: MessageKind,
        retvalue: impl Into<String>,
        params: HashMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            kind,
            retvalue: retvalue.into(),
            params,
        }
    }

    /// Derive the reply to this request.
    ///
    /// Only the reserved attributes (name and id) are carried over; the
    /// parameter dictionary and return value start empty and the direction
    /// is flipped with the given `processed` flag.
    pub fn to_reply(&self, processed: bool) -> Message {
        Message {
            name: self.name.clone(),
            id: self.id.clone(),
            kind: MessageKind::Reply { processed },
            retvalue: String::new(),
            params: HashMap::new(),
        }
    }

    /// Message name (e.g. `call.route`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Correlation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Direction and its attribute.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// `true` for requests.
    pub fn is_request(&self) -> bool {
        matches!(self.kind, MessageKind::Request { .. })
    }

    /// Creation time for requests, `None` for replies.
    pub fn time(&self) -> Option<u64> {
        match self.kind {
            MessageKind::Request { time } => Some(time),
            MessageKind::Reply { .. } => None,
        }
    }

    /// The `processed` flag for replies, `None` for requests.
    pub fn processed(&self) -> Option<bool> {
        match self.kind {
            MessageKind::Request { .. } => None,
            MessageKind::Reply { processed } => Some(processed),
        }
    }

    /// The return value slot.
    pub fn retvalue(&self) -> &str {
        &self.retvalue
    }

    /// Overwrite the return value slot.
    pub fn set_retvalue(&mut self, retvalue: impl Into<String>) {
        self.retvalue = retvalue.into();
    }

    /// Look up a parameter by key.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    /// Set or overwrite a parameter.
    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    /// Set a parameter only when a value is present.
    pub fn set_param_opt(&mut self, key: impl Into<String>, value: Option<impl Into<String>>) {
        if let Some(value) = value {
            self.params.insert(key.into(), value.into());
        }
    }

    /// Remove a parameter, returning its value if it existed.
    pub fn del_param(&mut self, key: &str) -> Option<String> {
        self.params.remove(key)
    }

    /// All parameters.
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// Parse a parameter as a boolean (`true`/`false`).
    pub fn param_bool(&self, key: &str) -> Option<bool> {
        match self.param(key)? {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
}
