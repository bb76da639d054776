//! Link protocol message types.
//!
//! Every message carries a sender-chosen 64-bit `id`, which is the only
//! correlation key between a request and its `Response`/`Reject`.

use crate::error::ErrorPayload;
use crate::program::Program;
use crate::value::Value;

/// A link protocol message (envelope).
#[derive(Debug, Clone)]
pub struct Message {
    /// Correlation id, drawn from the full u64 keyspace.
    pub id: u64,
    /// Message variant.
    pub kind: MessageKind,
}

/// The closed set of message kinds.
#[derive(Debug, Clone)]
pub enum MessageKind {
    /// Bare message with no payload.
    Message,
    /// Bare request with no payload.
    Request,
    /// Successful reply to a request.
    Response { value: Value },
    /// Failed reply to a request.
    Reject { error: ErrorPayload },
    /// Establish the session and obtain the peer's root object.
    Authenticate {
        key: String,
        /// API the authenticator may call back into.
        api: Option<Value>,
    },
    /// Execute `program`, seeding the stack with `target` when present.
    ///
    /// Without a target the stack starts empty, not at the root: programs
    /// push their own base handle first.
    Resolve {
        program: Program,
        target: Option<Value>,
    },
    /// One-way notice that the sender no longer holds `uri`.
    Deref { uri: String },
}

impl MessageKind {
    /// Wire name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Message => "message",
            MessageKind::Request => "request",
            MessageKind::Response { .. } => "response",
            MessageKind::Reject { .. } => "reject",
            MessageKind::Authenticate { .. } => "authenticate",
            MessageKind::Resolve { .. } => "resolve",
            MessageKind::Deref { .. } => "deref",
        }
    }

    /// Every kind name, in a fixed order.
    pub const NAMES: [&'static str; 7] = [
        "message",
        "request",
        "response",
        "reject",
        "authenticate",
        "resolve",
        "deref",
    ];
}

/// Generate a fresh message id.
pub fn next_id() -> u64 {
    rand::random::<u64>()
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            id: next_id(),
            kind,
        }
    }

    /// A bare request.
    pub fn request() -> Self {
        Self::new(MessageKind::Request)
    }

    pub fn authenticate(key: impl Into<String>, api: Option<Value>) -> Self {
        Self::new(MessageKind::Authenticate {
            key: key.into(),
            api,
        })
    }

    pub fn resolve(program: Program, target: Option<Value>) -> Self {
        Self::new(MessageKind::Resolve { program, target })
    }

    pub fn deref(uri: impl Into<String>) -> Self {
        Self::new(MessageKind::Deref { uri: uri.into() })
    }

    /// True for kinds that expect a `Response` or `Reject`.
    pub fn is_request(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::Request | MessageKind::Authenticate { .. } | MessageKind::Resolve { .. }
        )
    }

    /// Build the successful reply to this request.
    pub fn response(&self, value: Value) -> Message {
        Message {
            id: self.id,
            kind: MessageKind::Response { value },
        }
    }

    /// Build the failed reply to this request.
    pub fn error(&self, error: ErrorPayload) -> Message {
        Message {
            id: self.id,
            kind: MessageKind::Reject { error },
        }
    }
}
