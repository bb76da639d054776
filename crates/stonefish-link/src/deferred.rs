//! Deferred operation builder.
//!
//! A [`Deferred`] accumulates property reads, calls and assignments against a
//! remote handle as a [`Program`] without touching the network. Awaiting it
//! ships the whole chain as one `Resolve` and yields the single result.
//!
//! ```ignore
//! let root = connection.authenticate("secret", None).await?;
//! // One round trip: [root, "value", get, 2, CALL, root, "inc", get_bind, 2, CALL, 1, CALL]
//! let n = root.get("inc").call([Arg::from(root.get("value"))]).await?;
//! ```

use crate::error::LinkResult;
use crate::message::Message;
use crate::program::{Builtin, Node, Program};
use crate::references::RemoteRef;
use crate::value::Value;

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// An argument to [`Deferred::call`] or [`Deferred::set`].
#[derive(Debug, Clone)]
pub enum Arg {
    /// Spliced in as the builder's own program.
    Deferred(Deferred),
    /// Pushed as a literal.
    Value(Value),
}

impl From<Deferred> for Arg {
    fn from(d: Deferred) -> Self {
        Arg::Deferred(d)
    }
}

impl From<&Deferred> for Arg {
    fn from(d: &Deferred) -> Self {
        Arg::Deferred(d.clone())
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Value(v)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Value(v.into())
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Value(v.into())
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Value(v.into())
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Value(v.into())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Value(v.into())
    }
}

impl Arg {
    fn append_to(self, nodes: &mut Vec<Node>) {
        match self {
            Arg::Deferred(d) => nodes.extend(d.program().iter().cloned()),
            Arg::Value(v) => nodes.push(Node::Push(v)),
        }
    }
}

struct DeferredInner {
    base: RemoteRef,
    program: Program,
    children: Mutex<HashMap<String, Deferred>>,
}

/// Builder for a chain of operations on a remote value.
///
/// Its program always starts by pushing the base handle, so a builder with
/// no operations is the bare handle and is not thenable.
#[derive(Clone)]
pub struct Deferred {
    inner: Arc<DeferredInner>,
}

impl Deferred {
    pub fn new(base: RemoteRef) -> Self {
        let program = Program::build(vec![Node::Push(Value::Remote(base.clone()))]);
        Self::with_program(base, program)
    }

    fn with_program(base: RemoteRef, program: Program) -> Self {
        Self {
            inner: Arc::new(DeferredInner {
                base,
                program,
                children: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn derive(&self, program: Program) -> Self {
        Self::with_program(self.inner.base.clone(), program)
    }

    /// The handle this chain starts from.
    pub fn base(&self) -> &RemoteRef {
        &self.inner.base
    }

    pub fn program(&self) -> &Program {
        &self.inner.program
    }

    /// False for the bare handle; awaiting it performs no I/O.
    pub fn is_thenable(&self) -> bool {
        self.inner.program.len() > 1
    }

    pub fn ptr_eq(&self, other: &Deferred) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read property `name`. Repeated reads return the same builder.
    ///
    /// Each distinct name is memoized for as long as this builder lives, so
    /// reading many different keys through one long-lived builder grows its
    /// cache without bound.
    pub fn get(&self, name: &str) -> Deferred {
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        children
            .entry(name.to_string())
            .or_insert_with(|| {
                self.derive(self.inner.program.concat([
                    Node::Push(Value::from(name)),
                    Node::builtin(Builtin::Get),
                    Node::int(2),
                    Node::Call,
                ]))
            })
            .clone()
    }

    /// Call the current value with `args`.
    ///
    /// A trailing property read is rebound so the callee sees its receiver.
    pub fn call<I>(&self, args: I) -> Deferred
    where
        I: IntoIterator,
        I::Item: Into<Arg>,
    {
        let mut nodes = Vec::new();
        let mut argc = 0;
        for arg in args {
            arg.into().append_to(&mut nodes);
            argc += 1;
        }

        let mut callee = self.inner.program.nodes().to_vec();
        let len = callee.len();
        if len >= 3 && callee[len - 3].as_builtin() == Some(Builtin::Get) {
            callee[len - 3] = Node::builtin(Builtin::GetBind);
        }
        nodes.extend(callee);
        nodes.push(Node::int(argc));
        nodes.push(Node::Call);
        self.derive(Program::build(nodes))
    }

    /// Whether the current value is not null.
    pub fn defined(&self) -> Deferred {
        self.derive(self.inner.program.concat([
            Node::builtin(Builtin::Defined),
            Node::int(1),
            Node::Call,
        ]))
    }

    /// Type name of the current value.
    pub fn type_of(&self) -> Deferred {
        self.derive(self.inner.program.concat([
            Node::builtin(Builtin::TypeOf),
            Node::int(1),
            Node::Call,
        ]))
    }

    fn assignment(&self, name: &str, value: Arg) -> Deferred {
        let mut nodes = self.inner.program.nodes().to_vec();
        nodes.push(Node::Push(Value::from(name)));
        value.append_to(&mut nodes);
        nodes.push(Node::builtin(Builtin::Set));
        nodes.push(Node::int(3));
        nodes.push(Node::Call);
        self.derive(Program::build(nodes))
    }

    fn deletion(&self, name: &str) -> Deferred {
        self.derive(self.inner.program.concat([
            Node::Push(Value::from(name)),
            Node::builtin(Builtin::Delete),
            Node::int(2),
            Node::Call,
        ]))
    }

    /// Assign property `name`, fire-and-forget.
    pub fn set(&self, name: &str, value: impl Into<Arg>) {
        self.assignment(name, value.into()).detach("set", name);
    }

    /// Assign property `name` and wait for the peer to apply it.
    pub async fn set_now(&self, name: &str, value: impl Into<Arg>) -> LinkResult<Value> {
        self.assignment(name, value.into()).resolve().await
    }

    /// Delete property `name`, fire-and-forget.
    pub fn delete(&self, name: &str) {
        self.deletion(name).detach("delete", name);
    }

    /// Delete property `name` and wait for the outcome.
    pub async fn delete_now(&self, name: &str) -> LinkResult<Value> {
        self.deletion(name).resolve().await
    }

    /// Enqueue the program now and leave only the reply to a background task.
    fn detach(self, op: &'static str, name: &str) {
        let message = Message::resolve(self.inner.program.clone(), None);
        let sent = self
            .inner
            .base
            .connection()
            .and_then(|conn| conn.start_request(message));
        let reply = match sent {
            Ok(reply) => reply,
            Err(e) => {
                warn!(op, property = %name, error = %e, "Deferred operation failed");
                return;
            }
        };
        let name = name.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = reply.wait().await {
                        warn!(op, property = %name, error = %e, "Deferred operation failed");
                    }
                });
            }
            Err(_) => debug!(op, property = %name, "No runtime to observe the reply"),
        }
    }

    /// Ship the program and wait for its result.
    ///
    /// Returns `None` for the bare handle, which has nothing to resolve.
    pub fn then(&self) -> Option<BoxFuture<'static, LinkResult<Value>>> {
        self.is_thenable().then(|| self.clone().into_future())
    }

    /// Resolve the chain. The bare handle resolves to itself with no I/O.
    pub async fn resolve(&self) -> LinkResult<Value> {
        if !self.is_thenable() {
            return Ok(Value::Remote(self.inner.base.clone()));
        }
        let connection = self.inner.base.connection()?;
        connection.resolve(self.inner.program.clone(), None).await
    }
}

impl IntoFuture for Deferred {
    type Output = LinkResult<Value>;
    type IntoFuture = BoxFuture<'static, LinkResult<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.resolve().await }.boxed()
    }
}

impl IntoFuture for &Deferred {
    type Output = LinkResult<Value>;
    type IntoFuture = BoxFuture<'static, LinkResult<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        self.clone().into_future()
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("base", &self.inner.base)
            .field("nodes", &self.inner.program.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionOptions};
    use crate::transport::memory;

    fn root_for(conn: &Connection) -> Deferred {
        match conn.references().get_item("link:root") {
            Value::Remote(r) => Deferred::new(r),
            other => panic!("Expected remote, got {other:?}"),
        }
    }

    fn open() -> (Connection, Connection) {
        let (a, b) = memory::pair();
        (
            Connection::open(a, ConnectionOptions::default()),
            Connection::open(b, ConnectionOptions::default()),
        )
    }

    #[tokio::test]
    async fn test_property_reads_are_memoized() {
        let (client, _server) = open();
        let root = root_for(&client);
        let ab1 = root.get("a").get("b");
        let ab2 = root.get("a").get("b");
        assert!(ab1.ptr_eq(&ab2));
        assert!(!root.get("a").ptr_eq(&root.get("c")));
        assert_eq!(ab1.program().len(), 9);
    }

    #[tokio::test]
    async fn test_bare_handle_is_not_thenable() {
        let (client, _server) = open();
        let root = root_for(&client);
        assert!(!root.is_thenable());
        assert!(root.then().is_none());
        assert!(root.get("a").is_thenable());

        // Resolving the bare handle performs no round trip.
        let value = root.clone().await.unwrap();
        match value {
            Value::Remote(r) => assert!(r.ptr_eq(root.base())),
            other => panic!("Expected the base handle, got {other:?}"),
        }
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_call_rebinds_get_and_splices_args() {
        let (client, _server) = open();
        let root = root_for(&client);
        let call = root.get("inc").call([Arg::from(root.get("value")), Arg::from(1)]);
        let nodes = call.program().nodes();
        // value arg (5 nodes) + literal (1) + callee (5) + count + CALL
        assert_eq!(nodes.len(), 13);
        assert_eq!(nodes[2].as_builtin(), Some(Builtin::Get));
        assert_eq!(nodes[8].as_builtin(), Some(Builtin::GetBind));
        assert!(matches!(nodes[11], Node::Push(Value::Int(2))));
        assert!(matches!(nodes[12], Node::Call));
        // The original read is untouched.
        assert_eq!(
            root.get("inc").program().nodes()[2].as_builtin(),
            Some(Builtin::Get)
        );
    }

    #[tokio::test]
    async fn test_calling_bare_handle_keeps_program() {
        let (client, _server) = open();
        let root = root_for(&client);
        let call = root.call(Vec::<Arg>::new());
        assert_eq!(call.program().len(), 3);
        assert!(call.is_thenable());
    }

    #[tokio::test]
    async fn test_defined_and_type_of_append_helpers() {
        let (client, _server) = open();
        let root = root_for(&client);
        let defined = root.get("IsLocal").defined();
        assert_eq!(
            defined.program().nodes()[5].as_builtin(),
            Some(Builtin::Defined)
        );
        let type_of = root.type_of();
        assert_eq!(
            type_of.program().nodes()[1].as_builtin(),
            Some(Builtin::TypeOf)
        );
    }
}
