//! Connection: one link session over a framed transport.
//!
//! A [`Connection`] owns a reader task and a writer task. The reader decodes
//! frames in arrival order and dispatches them:
//!
//! - `Response`/`Reject` settle the matching entry in the pending table.
//! - `Deref` evicts an exported uri.
//! - `Authenticate` and `Resolve` run inline until they first suspend, so
//!   requests take effect in the order they arrived. A handler that is
//!   still waiting (typically on a request of its own) continues on its own
//!   task and never blocks the loop that must deliver its replies.
//!
//! The writer drains a single outbound queue, so frames leave in the order
//! they were produced. Closing (locally, by the peer, or on a transport
//! error) rejects every pending request with [`LinkError::ConnectionClosed`]
//! and unlinks every exported value.

use crate::auth::{Authenticator, DenyAll};
use crate::codec::{
    Codec, CodecContext, DecodeFailure, ExternRegistry, ExternScheme, FunctionRegistry, JsonCodec,
    WellKnownTypes,
};
use crate::config::LinkConfig;
use crate::deferred::Deferred;
use crate::error::{LinkError, LinkResult};
use crate::message::{Message, MessageKind};
use crate::program::{execute, Program};
use crate::references::{References, LINK_SCHEME};
use crate::transport::{FrameSink, FrameSource, Transport};
use crate::value::Value;

use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// Everything a connection is configured with.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Value handed to a peer that authenticates successfully.
    pub root: Option<Value>,
    /// Decides incoming `Authenticate` requests.
    pub authenticator: Arc<dyn Authenticator>,
    /// Reject named functions in `Resolve` even after authentication.
    pub secure_resolvables: bool,
    /// Headers of the underlying channel, passed to the authenticator.
    pub headers: HashMap<String, String>,
    /// Named functions peers may reference in programs.
    pub functions: FunctionRegistry,
    pub types: WellKnownTypes,
    pub codec: Arc<dyn Codec>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            root: None,
            authenticator: Arc::new(DenyAll),
            secure_resolvables: false,
            headers: HashMap::new(),
            functions: FunctionRegistry::new(),
            types: WellKnownTypes::default(),
            codec: Arc::new(JsonCodec),
        }
    }
}

impl ConnectionOptions {
    /// Options derived from a loaded [`LinkConfig`].
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            authenticator: config.auth.build(),
            secure_resolvables: config.secure_resolvables,
            ..Self::default()
        }
    }

    pub fn with_root(mut self, root: impl Into<Value>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    pub fn with_secure_resolvables(mut self, secure: bool) -> Self {
        self.secure_resolvables = secure;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_types(mut self, types: WellKnownTypes) -> Self {
        self.types = types;
        self
    }

    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("root", &self.root)
            .field("secure_resolvables", &self.secure_resolvables)
            .field("headers", &self.headers)
            .field("functions", &self.functions.len())
            .field("types", &self.types)
            .finish()
    }
}

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// State shared by a connection's handles, tasks and proxies.
pub(crate) struct Shared {
    id: String,
    options: ConnectionOptions,
    references: Arc<References>,
    externs: ExternRegistry,
    pending: DashMap<u64, oneshot::Sender<LinkResult<Value>>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn context(&self) -> CodecContext<'_> {
        CodecContext {
            externs: &self.externs,
            functions: &self.options.functions,
            header: &self.options.types,
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn send(&self, message: &Message) -> LinkResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(LinkError::ConnectionClosed);
        }
        let frame = self.options.codec.encode(message, self.context())?;
        debug!(
            connection = %self.id,
            id = message.id,
            kind = message.kind.name(),
            bytes = frame.len(),
            "Sending message"
        );
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| LinkError::ConnectionClosed)
    }

    /// Register `message` as pending and enqueue it. The frame is on the
    /// outbound queue when this returns; the receiver yields the reply.
    pub(crate) fn start_request(&self, message: Message) -> LinkResult<PendingReply> {
        if !message.is_request() {
            return Err(LinkError::execution(format!(
                "{} is not a request",
                message.kind.name()
            )));
        }
        let id = message.id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if let Err(e) = self.send(&message) {
            self.pending.remove(&id);
            return Err(e);
        }
        Ok(PendingReply { rx })
    }

    pub(crate) async fn request(&self, message: Message) -> LinkResult<Value> {
        self.start_request(message)?.wait().await
    }

    pub(crate) async fn resolve(&self, program: Program, target: Option<Value>) -> LinkResult<Value> {
        self.request(Message::resolve(program, target)).await
    }

    /// Dispatch one frame. Handlers run inline up to their first suspension
    /// point, so requests take effect in arrival order; only a handler that
    /// is still pending moves to its own task.
    async fn receive(self: &Arc<Self>, frame: Vec<u8>) {
        let message = match self.options.codec.decode(&frame, self.context()) {
            Ok(message) => message,
            Err(failure) => {
                self.decode_failed(failure);
                return;
            }
        };
        debug!(
            connection = %self.id,
            id = message.id,
            kind = message.kind.name(),
            "Received message"
        );

        let id = message.id;
        match message.kind {
            MessageKind::Response { value } => self.settle(id, Ok(value)),
            MessageKind::Reject { error } => self.settle(id, Err(error.into())),
            MessageKind::Deref { uri } => {
                if !self.references.evict(&uri) {
                    debug!(connection = %self.id, uri = %uri, "Deref for unknown uri");
                }
            }
            MessageKind::Authenticate { key, api } => {
                let handler = Arc::clone(self).handle_authenticate(id, key, api);
                run_in_order(handler).await;
            }
            MessageKind::Resolve { program, target } => {
                let handler = Arc::clone(self).handle_resolve(id, program, target);
                run_in_order(handler).await;
            }
            MessageKind::Request => {
                self.respond(id, Err(LinkError::execution("bare requests carry no operation")));
            }
            MessageKind::Message => {
                debug!(connection = %self.id, id, "Ignoring bare message");
            }
        }
    }

    fn decode_failed(&self, failure: DecodeFailure) {
        warn!(
            connection = %self.id,
            id = ?failure.id,
            kind = ?failure.kind,
            error = %failure.error,
            "Failed to decode frame"
        );
        let Some(id) = failure.id else { return };
        if self.pending.contains_key(&id) {
            self.settle(id, Err(failure.error));
            return;
        }
        let expects_reply = matches!(
            failure.kind.as_deref(),
            Some("request" | "authenticate" | "resolve")
        );
        if expects_reply {
            self.respond(id, Err(failure.error));
        }
    }

    fn settle(&self, id: u64, result: LinkResult<Value>) {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => debug!(connection = %self.id, id, "Reply for unknown request"),
        }
    }

    fn respond(&self, id: u64, result: LinkResult<Value>) {
        let reply = match result {
            Ok(value) => Message {
                id,
                kind: MessageKind::Response { value },
            },
            Err(e) => Message {
                id,
                kind: MessageKind::Reject {
                    error: e.to_payload(),
                },
            },
        };
        if let Err(e) = self.send(&reply) {
            if matches!(e, LinkError::ConnectionClosed) {
                return;
            }
            // The value could not be encoded; tell the requester why.
            let reject = Message {
                id,
                kind: MessageKind::Reject {
                    error: e.to_payload(),
                },
            };
            if let Err(e) = self.send(&reject) {
                warn!(connection = %self.id, id, error = %e, "Failed to send reply");
            }
        }
    }

    async fn handle_resolve(self: Arc<Self>, id: u64, program: Program, target: Option<Value>) {
        let result = match self.authorize(&program, target.as_ref()) {
            Ok(()) => execute(&program, target.into_iter().collect()).await,
            Err(e) => {
                warn!(connection = %self.id, id, error = %e, "Rejected resolve");
                Err(e)
            }
        };
        if let Err(e) = &result {
            debug!(connection = %self.id, id, error = %e, "Resolve failed");
        }
        self.respond(id, result);
    }

    /// Only values already exchanged may appear in a program from a peer that
    /// has not authenticated, or from any peer in secure mode.
    fn authorize(&self, program: &Program, target: Option<&Value>) -> LinkResult<()> {
        let restricted =
            self.options.secure_resolvables || self.state() != ConnectionState::Authenticated;
        if !restricted {
            return Ok(());
        }
        match program.literals().chain(target).find_map(named_function) {
            Some(name) => Err(LinkError::Authentication(format!(
                "resolvable references function {name} without authentication"
            ))),
            None => Ok(()),
        }
    }

    async fn handle_authenticate(self: Arc<Self>, id: u64, key: String, api: Option<Value>) {
        let peer_api = match api {
            Some(Value::Remote(remote)) => Some(Deferred::new(remote)),
            _ => None,
        };
        let accepted = self
            .options
            .authenticator
            .authenticate(&key, peer_api, &self.options.headers)
            .await;

        if accepted {
            self.mark_authenticated();
            let root = self.options.root.clone().unwrap_or(Value::Null);
            self.respond(id, Ok(root));
        } else {
            warn!(connection = %self.id, "Authentication rejected");
            self.respond(
                id,
                Err(LinkError::Authentication("credentials rejected".to_string())),
            );
            self.shutdown("authentication failed");
        }
    }

    fn mark_authenticated(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Unauthenticated {
                *state = ConnectionState::Authenticated;
                true
            } else {
                false
            }
        });
        if changed {
            info!(connection = %self.id, "Connection authenticated");
        }
    }

    /// A proxy for `uri` was dropped; tell the owner.
    pub(crate) fn release_remote(&self, uri: &str) {
        self.references.forget_remote(uri);
        if self.state() == ConnectionState::Closed {
            return;
        }
        if let Err(e) = self.send(&Message::deref(uri)) {
            debug!(connection = %self.id, uri = %uri, error = %e, "Failed to send deref");
        }
    }

    fn shutdown(&self, reason: &str) {
        let closed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
        if !closed {
            return;
        }
        info!(connection = %self.id, reason, "Connection closed");
        let _ = self.outbound.send(Outbound::Close);

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(LinkError::ConnectionClosed));
            }
        }
        self.references.unlink_all();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Pending senders drop with the table and surface as ConnectionClosed.
        if self.state() != ConnectionState::Closed {
            debug!(connection = %self.id, "Last handle dropped");
            self.references.unlink_all();
        }
    }
}

/// Reply to a request already on the outbound queue.
pub(crate) struct PendingReply {
    rx: oneshot::Receiver<LinkResult<Value>>,
}

impl PendingReply {
    pub(crate) async fn wait(self) -> LinkResult<Value> {
        self.rx.await.unwrap_or(Err(LinkError::ConnectionClosed))
    }
}

/// Poll `handler` once on the reader task and spawn the rest, if any.
async fn run_in_order<F>(handler: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut handler = Box::pin(handler);
    if futures::poll!(handler.as_mut()).is_pending() {
        tokio::spawn(handler);
    }
}

fn named_function(value: &Value) -> Option<String> {
    match value {
        Value::Function(f) if f.is_named() => f.name().map(str::to_string),
        Value::List(items) => items.iter().find_map(named_function),
        Value::Map(map) => map.values().find_map(named_function),
        _ => None,
    }
}

async fn wait_closed(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
}

async fn read_loop(
    weak: Weak<Shared>,
    mut source: Box<dyn FrameSource>,
    mut state: watch::Receiver<ConnectionState>,
) {
    loop {
        let frame = tokio::select! {
            frame = source.next_frame() => frame,
            _ = wait_closed(&mut state) => break,
        };
        let Some(shared) = weak.upgrade() else { break };
        match frame {
            Ok(Some(bytes)) => shared.receive(bytes).await,
            Ok(None) => {
                shared.shutdown("peer closed the transport");
                break;
            }
            Err(e) => {
                warn!(connection = %shared.id, error = %e, "Transport read failed");
                shared.shutdown("transport error");
                break;
            }
        }
    }
}

async fn write_loop(
    weak: Weak<Shared>,
    mut sink: Box<dyn FrameSink>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if let Err(e) = sink.send_frame(frame).await {
                    warn!(error = %e, "Transport write failed");
                    if let Some(shared) = weak.upgrade() {
                        shared.shutdown("transport error");
                    }
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Transport close failed");
    }
}

/// Handle to a link session. Clones share the session; dropping the last
/// handle closes the transport and unlinks every exported value.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Start a session over `transport`. Must be called within a tokio runtime.
    pub fn open(transport: impl Transport, options: ConnectionOptions) -> Self {
        let (sink, source) = transport.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Unauthenticated);

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let references = Arc::new(References::new(weak.clone()));
            let scheme: Arc<dyn ExternScheme> = references.clone();
            let mut externs = ExternRegistry::new();
            externs.register(LINK_SCHEME, scheme);
            Shared {
                id: uuid::Uuid::new_v4().to_string(),
                options,
                references,
                externs,
                pending: DashMap::new(),
                outbound: outbound_tx,
                state: state_tx,
            }
        });
        debug!(connection = %shared.id, "Connection opened");

        tokio::spawn(read_loop(Arc::downgrade(&shared), source, state_rx));
        tokio::spawn(write_loop(Arc::downgrade(&shared), sink, outbound_rx));
        Self { shared }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        wait_closed(&mut self.shared.state.subscribe()).await;
    }

    /// Encode and enqueue `message` without waiting for a reply.
    pub fn send(&self, message: &Message) -> LinkResult<()> {
        self.shared.send(message)
    }

    /// Send a request and wait for its `Response` or `Reject`.
    pub async fn request(&self, message: Message) -> LinkResult<Value> {
        self.shared.request(message).await
    }

    /// Run `program` on the peer, with `target` as the initial stack.
    pub async fn resolve(&self, program: Program, target: Option<Value>) -> LinkResult<Value> {
        self.shared.resolve(program, target).await
    }

    /// Authenticate against the peer and return a builder on its root.
    ///
    /// `api` is advertised to the peer's authenticator, which may call it.
    pub async fn authenticate(&self, key: &str, api: Option<Value>) -> LinkResult<Deferred> {
        let root = self.shared.request(Message::authenticate(key, api)).await?;
        self.shared.mark_authenticated();
        match root {
            Value::Remote(remote) => Ok(Deferred::new(remote)),
            other => Err(LinkError::execution(format!(
                "peer root is {}, not a reference",
                other.type_name()
            ))),
        }
    }

    pub fn references(&self) -> &References {
        &self.shared.references
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.shared.options.headers
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Close the session, rejecting everything still pending.
    pub fn close(&self) {
        self.shared.shutdown("closed locally");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::KeyMatch;
    use crate::transport::memory;
    use crate::value::{Function, Object, Record};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    fn double() -> Function {
        Function::named("math::double", |args: Vec<Value>| async move {
            let n = args.first().and_then(Value::as_i64).unwrap_or_default();
            Ok(Value::Int(n * 2))
        })
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_close_rejects_outstanding_requests() {
        let (a, _silent_peer) = memory::pair();
        let conn = Connection::open(a, ConnectionOptions::default());

        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(Message::request()).await }
        });
        let second = tokio::spawn({
            let conn = conn.clone();
            async move { conn.resolve(Program::default(), None).await }
        });
        wait_until(|| conn.pending_requests() == 2).await;

        conn.close();
        assert!(matches!(first.await.unwrap(), Err(LinkError::ConnectionClosed)));
        assert!(matches!(second.await.unwrap(), Err(LinkError::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.request(Message::request()).await,
            Err(LinkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_peer_closing_rejects_outstanding_requests() {
        let (a, b) = memory::pair();
        let conn = Connection::open(a, ConnectionOptions::default());
        let (peer_sink, _peer_source) = b.split();

        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(Message::request()).await }
        });
        let second = tokio::spawn({
            let conn = conn.clone();
            async move { conn.resolve(Program::default(), None).await }
        });
        wait_until(|| conn.pending_requests() == 2).await;

        drop(peer_sink);
        assert!(matches!(first.await.unwrap(), Err(LinkError::ConnectionClosed)));
        assert!(matches!(second.await.unwrap(), Err(LinkError::ConnectionClosed)));
        timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
        assert_eq!(conn.pending_requests(), 0);
    }

    struct Tracked {
        unlinked: Arc<AtomicBool>,
    }

    impl Object for Tracked {
        fn get(&self, _key: &str) -> LinkResult<Value> {
            Ok(Value::Null)
        }
        fn on_unlink(&self) {
            self.unlinked.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_dropping_last_handle_unlinks_exports() {
        let (a, b) = memory::pair();
        let unlinked = Arc::new(AtomicBool::new(false));
        let client = Connection::open(a, ConnectionOptions::default());
        let server = Connection::open(
            b,
            ConnectionOptions::default()
                .with_root(Value::object(Tracked {
                    unlinked: Arc::clone(&unlinked),
                }))
                .with_authenticator(crate::auth::AllowAll),
        );

        let _root = client.authenticate("", None).await.unwrap();
        assert_eq!(server.references().exported_count(), 1);
        assert!(!unlinked.load(Ordering::SeqCst));

        drop(server);
        wait_until(|| unlinked.load(Ordering::SeqCst)).await;
        timeout(Duration::from_secs(5), client.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_requires_request_kind() {
        let (a, _b) = memory::pair();
        let conn = Connection::open(a, ConnectionOptions::default());
        let result = conn.request(Message::deref("link:x")).await;
        assert!(matches!(result, Err(LinkError::Execution(_))));
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_named_function_needs_authentication() {
        let (a, b) = memory::pair();
        let functions = FunctionRegistry::new().with(double()).unwrap();
        let client = Connection::open(a, ConnectionOptions::default());
        let _server = Connection::open(
            b,
            ConnectionOptions::default()
                .with_root(Record::new().with("name", "server"))
                .with_authenticator(KeyMatch::new("secret"))
                .with_functions(functions),
        );

        let program = Program::call(Value::Function(double()), vec![Value::Int(21)]);
        let rejected = client.resolve(program.clone(), None).await;
        assert!(matches!(rejected, Err(LinkError::Authentication(_))));
        assert_eq!(client.state(), ConnectionState::Unauthenticated);

        client.authenticate("secret", None).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Authenticated);
        let value = client.resolve(program, None).await.unwrap();
        assert_eq!(value, Value::Int(42));
    }

    #[tokio::test]
    async fn test_secure_resolvables_always_restricts() {
        let (a, b) = memory::pair();
        let functions = FunctionRegistry::new().with(double()).unwrap();
        let client = Connection::open(a, ConnectionOptions::default());
        let _server = Connection::open(
            b,
            ConnectionOptions::default()
                .with_root(Record::new())
                .with_authenticator(crate::auth::AllowAll)
                .with_secure_resolvables(true)
                .with_functions(functions),
        );

        client.authenticate("anything", None).await.unwrap();
        let nested = Value::from(vec![Value::Function(double())]);
        let program = Program::build(vec![crate::program::Node::Push(nested)]);
        let result = client.resolve(program, None).await;
        assert!(matches!(result, Err(LinkError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_failed_authentication_closes_both_sides() {
        let (a, b) = memory::pair();
        let client = Connection::open(a, ConnectionOptions::default());
        let server = Connection::open(b, ConnectionOptions::default());

        let result = client.authenticate("guess", None).await;
        assert!(matches!(result, Err(LinkError::Authentication(_))));
        timeout(Duration::from_secs(5), server.closed()).await.unwrap();
        timeout(Duration::from_secs(5), client.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_reply_settles_pending_request() {
        let (a, b) = memory::pair();
        let conn = Connection::open(a, ConnectionOptions::default());
        let (mut peer_sink, mut peer_source) = b.split();

        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(Message::request()).await }
        });

        let frame = peer_source.next_frame().await.unwrap().unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        let reply = serde_json::json!({
            "header": WellKnownTypes::default().fingerprint(),
            "id": sent["id"],
            "type": "response",
        });
        peer_sink
            .send_frame(serde_json::to_vec(&reply).unwrap())
            .await
            .unwrap();

        assert!(pending.await.unwrap().is_err());
        assert_eq!(conn.state(), ConnectionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_bare_request_is_rejected() {
        let (a, b) = memory::pair();
        let _conn = Connection::open(a, ConnectionOptions::default());
        let (mut peer_sink, mut peer_source) = b.split();

        let request = serde_json::json!({
            "header": WellKnownTypes::default().fingerprint(),
            "id": 7,
            "type": "request",
        });
        peer_sink
            .send_frame(serde_json::to_vec(&request).unwrap())
            .await
            .unwrap();

        let frame = peer_source.next_frame().await.unwrap().unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["type"], "reject");
        assert_eq!(reply["error"]["kind"], "execution");
    }

    #[tokio::test]
    async fn test_header_mismatch_rejects_request() {
        let (a, b) = memory::pair();
        let _conn = Connection::open(a, ConnectionOptions::default());
        let (mut peer_sink, mut peer_source) = b.split();

        let request = serde_json::json!({
            "header": "not-the-same",
            "id": 9,
            "type": "resolve",
            "program": [],
        });
        peer_sink
            .send_frame(serde_json::to_vec(&request).unwrap())
            .await
            .unwrap();

        let frame = peer_source.next_frame().await.unwrap().unwrap();
        let reply: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["kind"], "encoding");
    }

    #[tokio::test]
    async fn test_deref_evicts_server_export() {
        let (a, b) = memory::pair();
        let client = Connection::open(a, ConnectionOptions::default());
        let server = Connection::open(
            b,
            ConnectionOptions::default()
                .with_root(Record::new().with("value", 1))
                .with_authenticator(crate::auth::AllowAll),
        );

        let root = client.authenticate("", None).await.unwrap();
        assert_eq!(server.references().exported_count(), 1);
        assert_eq!(root.get("value").await.unwrap(), Value::Int(1));

        drop(root);
        wait_until(|| server.references().exported_count() == 0).await;
        assert!(!client.is_closed());
    }
}
