//! Reference lifecycle: uri allocation, proxy caching and distributed release.
//!
//! Each connection owns one [`References`] table:
//!
//! - `items`: uri -> value we exported. Strong; values stay alive until the
//!   peer sends `Deref` or the connection closes.
//! - `uris`: value identity -> uri. Holds no strong reference; entries are
//!   dropped together with the matching `items` entry.
//! - `remotes`: uri -> weak handle to the live [`RemoteRef`], so one uri has
//!   at most one proxy per connection while any clone of it survives.
//!
//! Dropping the last clone of a [`RemoteRef`] sends `Deref(uri)` to the owner.

use crate::codec::ExternScheme;
use crate::connection::Shared;
use crate::deferred::Deferred;
use crate::error::{LinkError, LinkResult};
use crate::program::{Builtin, Program};
use crate::value::Value;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;

/// Prefix of every uri minted by this crate.
pub const LINK_SCHEME: &str = "link";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-connection reference table.
pub struct References {
    conn: Weak<Shared>,
    items: Mutex<HashMap<String, Value>>,
    uris: Mutex<HashMap<usize, String>>,
    remotes: Mutex<HashMap<String, Weak<RemoteInner>>>,
}

impl References {
    pub(crate) fn new(conn: Weak<Shared>) -> Self {
        Self {
            conn,
            items: Mutex::new(HashMap::new()),
            uris: Mutex::new(HashMap::new()),
            remotes: Mutex::new(HashMap::new()),
        }
    }

    /// Uri for `value`, publishing it on first use.
    pub fn get_uri(&self, value: &Value) -> LinkResult<String> {
        if let Value::Remote(remote) = value {
            if remote.belongs_to(&self.conn) {
                return Ok(remote.uri().to_string());
            }
        }
        let identity = value.identity().ok_or_else(|| {
            LinkError::Encoding(format!(
                "{} values are sent by value, not by reference",
                value.type_name()
            ))
        })?;

        let mut items = lock(&self.items);
        let mut uris = lock(&self.uris);
        if let Some(uri) = uris.get(&identity) {
            return Ok(uri.clone());
        }
        let uri = format!("{LINK_SCHEME}:{}", uuid::Uuid::new_v4().simple());
        items.insert(uri.clone(), value.clone());
        uris.insert(identity, uri.clone());
        debug!(uri = %uri, kind = value.type_name(), "Published reference");
        Ok(uri)
    }

    /// Value for `uri`: our own export, the live proxy, or a fresh proxy.
    pub fn get_item(&self, uri: &str) -> Value {
        if let Some(item) = lock(&self.items).get(uri) {
            return item.clone();
        }
        let mut remotes = lock(&self.remotes);
        if let Some(live) = remotes.get(uri).and_then(Weak::upgrade) {
            return Value::Remote(RemoteRef { inner: live });
        }
        let inner = Arc::new(RemoteInner {
            uri: uri.to_string(),
            conn: self.conn.clone(),
        });
        remotes.insert(uri.to_string(), Arc::downgrade(&inner));
        Value::Remote(RemoteRef { inner })
    }

    /// Stop exporting `uri`. Returns whether it was exported.
    pub fn evict(&self, uri: &str) -> bool {
        let removed = {
            let mut items = lock(&self.items);
            let removed = items.remove(uri);
            if let Some(identity) = removed.as_ref().and_then(Value::identity) {
                lock(&self.uris).remove(&identity);
            }
            removed
        };
        match removed {
            Some(value) => {
                debug!(uri = %uri, "Evicted reference");
                unlink(&value);
                true
            }
            None => false,
        }
    }

    /// Whether `uri` is currently exported.
    pub fn contains(&self, uri: &str) -> bool {
        lock(&self.items).contains_key(uri)
    }

    /// Number of exported values.
    pub fn exported_count(&self) -> usize {
        lock(&self.items).len()
    }

    /// Number of proxies still held somewhere.
    pub fn live_proxy_count(&self) -> usize {
        lock(&self.remotes)
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Drop every export and forget every proxy.
    pub(crate) fn unlink_all(&self) {
        let drained: Vec<Value> = {
            let mut items = lock(&self.items);
            lock(&self.uris).clear();
            items.drain().map(|(_, v)| v).collect()
        };
        lock(&self.remotes).clear();
        for value in &drained {
            unlink(value);
        }
        debug!(count = drained.len(), "Unlinked all references");
    }

    /// Remove the entry for a proxy that just died, unless it was replaced.
    pub(crate) fn forget_remote(&self, uri: &str) {
        let mut remotes = lock(&self.remotes);
        if remotes.get(uri).is_some_and(|w| w.strong_count() == 0) {
            remotes.remove(uri);
        }
    }
}

fn unlink(value: &Value) {
    if let Value::Object(object) = value {
        object.on_unlink();
    }
}

impl ExternScheme for References {
    fn claims(&self, value: &Value) -> bool {
        matches!(
            value,
            Value::Object(_) | Value::Function(_) | Value::Remote(_)
        )
    }

    fn get_uri(&self, value: &Value) -> LinkResult<String> {
        References::get_uri(self, value)
    }

    fn get_item(&self, uri: &str) -> LinkResult<Value> {
        Ok(References::get_item(self, uri))
    }
}

pub(crate) struct RemoteInner {
    uri: String,
    conn: Weak<Shared>,
}

impl Drop for RemoteInner {
    fn drop(&mut self) {
        if let Some(shared) = self.conn.upgrade() {
            shared.release_remote(&self.uri);
        }
    }
}

/// Handle to a value owned by the peer.
///
/// Operations on the handle run immediately as single round trips; use
/// [`RemoteRef::deferred`] to batch a chain of operations instead.
#[derive(Clone)]
pub struct RemoteRef {
    inner: Arc<RemoteInner>,
}

impl RemoteRef {
    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn ptr_eq(&self, other: &RemoteRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A deferred builder rooted at this handle.
    pub fn deferred(&self) -> Deferred {
        Deferred::new(self.clone())
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn belongs_to(&self, conn: &Weak<Shared>) -> bool {
        Weak::ptr_eq(&self.inner.conn, conn)
    }

    pub(crate) fn connection(&self) -> LinkResult<Arc<Shared>> {
        self.inner.conn.upgrade().ok_or(LinkError::ConnectionClosed)
    }

    async fn apply(&self, builtin: Builtin, extra: Vec<Value>) -> LinkResult<Value> {
        let program = Program::apply(builtin, extra);
        self.connection()?
            .resolve(program, Some(Value::Remote(self.clone())))
            .await
    }

    pub async fn get(&self, key: Value) -> LinkResult<Value> {
        self.apply(Builtin::Get, vec![key]).await
    }

    /// Read `key`, with functions bound to the remote receiver.
    pub async fn get_bind(&self, key: Value) -> LinkResult<Value> {
        self.apply(Builtin::GetBind, vec![key]).await
    }

    pub async fn set(&self, key: Value, value: Value) -> LinkResult<Value> {
        self.apply(Builtin::Set, vec![key, value]).await
    }

    pub async fn delete(&self, key: Value) -> LinkResult<Value> {
        self.apply(Builtin::Delete, vec![key]).await
    }

    pub async fn type_of(&self) -> LinkResult<Value> {
        self.apply(Builtin::TypeOf, vec![]).await
    }

    /// Invoke the remote value with `args`.
    pub async fn call(&self, args: Vec<Value>) -> LinkResult<Value> {
        let program = Program::call(Value::Remote(self.clone()), args);
        self.connection()?.resolve(program, None).await
    }
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Remote({})", self.inner.uri)
    }
}
