//! Dynamic values that cross a link.
//!
//! Data variants (`Null` .. `Map`) travel by value. `Object` and `Function`
//! values are published as references by the connection that sends them,
//! and `Remote` values stand in for things living on the peer.

use crate::error::{LinkError, LinkResult};
use crate::program::Builtin;
use crate::references::RemoteRef;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// A value that can be pushed on a program stack or sent to a peer.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A local object with identity.
    Object(Arc<dyn Object>),
    /// A callable.
    Function(Function),
    /// A handle to a value owned by the peer.
    Remote(RemoteRef),
}

impl Value {
    /// Wrap an [`Object`] implementation.
    pub fn object(object: impl Object) -> Self {
        Value::Object(Arc::new(object))
    }

    /// Short type name, as reported by the `type_of` helper.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Remote(_) => "remote",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteRef> {
        match self {
            Value::Remote(r) => Some(r),
            _ => None,
        }
    }

    /// Address identifying reference-like values; `None` for data.
    pub(crate) fn identity(&self) -> Option<usize> {
        match self {
            Value::Object(o) => Some(Arc::as_ptr(o) as *const () as usize),
            Value::Function(f) => Some(Arc::as_ptr(&f.inner) as usize),
            Value::Remote(r) => Some(r.identity()),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Value::Int(i) => f.debug_tuple("Int").field(i).finish(),
            Value::Float(x) => f.debug_tuple("Float").field(x).finish(),
            Value::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Value::List(l) => f.debug_tuple("List").field(l).finish(),
            Value::Map(m) => f.debug_tuple("Map").field(m).finish(),
            Value::Object(o) => write!(f, "Object({:p})", Arc::as_ptr(o) as *const ()),
            Value::Function(func) => write!(f, "{func:?}"),
            Value::Remote(r) => write!(f, "{r:?}"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(_), Value::Object(_))
            | (Value::Function(_), Value::Function(_))
            | (Value::Remote(_), Value::Remote(_)) => self.identity() == other.identity(),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<Function> for Value {
    fn from(v: Function) -> Self {
        Value::Function(v)
    }
}

impl From<RemoteRef> for Value {
    fn from(v: RemoteRef) -> Self {
        Value::Remote(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::object(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// An object that can be exported to a peer.
///
/// Only `get` is required. Everything else defaults to a read-only,
/// non-callable object.
#[async_trait]
pub trait Object: Send + Sync + 'static {
    /// Read a property. Missing properties read as [`Value::Null`].
    fn get(&self, key: &str) -> LinkResult<Value>;

    /// Assign a property.
    fn set(&self, key: &str, _value: Value) -> LinkResult<()> {
        Err(LinkError::execution(format!(
            "cannot assign '{key}' on a read-only object"
        )))
    }

    /// Delete a property, returning whether it existed.
    fn delete(&self, _key: &str) -> LinkResult<bool> {
        Ok(false)
    }

    /// Invoke the object itself.
    async fn call(&self, _this: Option<Value>, _args: Vec<Value>) -> LinkResult<Value> {
        Err(LinkError::execution("object is not callable"))
    }

    /// Called when the owning connection stops exporting this object.
    fn on_unlink(&self) {}
}

/// A plain mutable object backed by a string-keyed map.
#[derive(Default)]
pub struct Record {
    fields: RwLock<BTreeMap<String, Value>>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        {
            let mut fields = self.fields.write().unwrap_or_else(|e| e.into_inner());
            fields.insert(key.into(), value.into());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.fields.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let fields = self.fields.read().unwrap_or_else(|e| e.into_inner());
        fields.keys().cloned().collect()
    }
}

impl Object for Record {
    fn get(&self, key: &str) -> LinkResult<Value> {
        let fields = self.fields.read().unwrap_or_else(|e| e.into_inner());
        Ok(fields.get(key).cloned().unwrap_or(Value::Null))
    }

    fn set(&self, key: &str, value: Value) -> LinkResult<()> {
        let mut fields = self.fields.write().unwrap_or_else(|e| e.into_inner());
        fields.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> LinkResult<bool> {
        let mut fields = self.fields.write().unwrap_or_else(|e| e.into_inner());
        Ok(fields.remove(key).is_some())
    }
}

/// Native function body: `(this, args) -> future result`.
pub type NativeFn =
    Arc<dyn Fn(Option<Value>, Vec<Value>) -> BoxFuture<'static, LinkResult<Value>> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum FunctionKind {
    /// Protocol helper with a well-known name.
    Builtin(Builtin),
    /// Exported under a name both peers share (module + export).
    Named { name: String, body: NativeFn },
    /// Anonymous closure; crosses the wire only as a published reference.
    Native { body: NativeFn },
}

pub(crate) struct FunctionInner {
    pub(crate) kind: FunctionKind,
    pub(crate) this: Option<Value>,
}

/// A callable value with identity.
#[derive(Clone)]
pub struct Function {
    pub(crate) inner: Arc<FunctionInner>,
}

impl Function {
    fn from_kind(kind: FunctionKind) -> Self {
        Self {
            inner: Arc::new(FunctionInner { kind, this: None }),
        }
    }

    fn wrap<F, Fut>(f: F) -> NativeFn
    where
        F: Fn(Option<Value>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LinkResult<Value>> + Send + 'static,
    {
        Arc::new(move |this, args| f(this, args).boxed())
    }

    /// An anonymous async function.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LinkResult<Value>> + Send + 'static,
    {
        Self::from_kind(FunctionKind::Native {
            body: Self::wrap(move |_this, args| f(args)),
        })
    }

    /// An anonymous synchronous function.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> LinkResult<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |args| {
            let f = Arc::clone(&f);
            async move { f(args) }
        })
    }

    /// An anonymous async function that sees its bound receiver.
    pub fn method<F, Fut>(f: F) -> Self
    where
        F: Fn(Option<Value>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LinkResult<Value>> + Send + 'static,
    {
        Self::from_kind(FunctionKind::Native {
            body: Self::wrap(f),
        })
    }

    /// A function addressable by a stable `module::export` name.
    pub fn named<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LinkResult<Value>> + Send + 'static,
    {
        Self::from_kind(FunctionKind::Named {
            name: name.into(),
            body: Self::wrap(move |_this, args| f(args)),
        })
    }

    pub fn builtin(builtin: Builtin) -> Self {
        Self::from_kind(FunctionKind::Builtin(builtin))
    }

    /// Copy of this function with `this` bound to `receiver`.
    pub fn bind(&self, receiver: Value) -> Self {
        Self {
            inner: Arc::new(FunctionInner {
                kind: self.inner.kind.clone(),
                this: Some(receiver),
            }),
        }
    }

    pub fn as_builtin(&self) -> Option<Builtin> {
        match self.inner.kind {
            FunctionKind::Builtin(b) => Some(b),
            _ => None,
        }
    }

    /// Stable name, for builtins and named functions.
    pub fn name(&self) -> Option<&str> {
        match &self.inner.kind {
            FunctionKind::Builtin(b) => Some(b.name()),
            FunctionKind::Named { name, .. } => Some(name),
            FunctionKind::Native { .. } => None,
        }
    }

    /// True for named, non-builtin functions.
    pub fn is_named(&self) -> bool {
        matches!(self.inner.kind, FunctionKind::Named { .. })
    }

    pub fn is_bound(&self) -> bool {
        self.inner.this.is_some()
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Call the function with its bound receiver, if any.
    pub async fn invoke(&self, args: Vec<Value>) -> LinkResult<Value> {
        let this = self.inner.this.clone();
        match &self.inner.kind {
            FunctionKind::Builtin(b) => crate::program::run_builtin(*b, args).await,
            FunctionKind::Named { body, .. } | FunctionKind::Native { body } => {
                body(this, args).await
            }
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Function({name})"),
            None => write!(f, "Function({:p})", Arc::as_ptr(&self.inner)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_equality() {
        let record = Value::object(Record::new());
        let same = record.clone();
        let other = Value::object(Record::new());
        assert_eq!(record, same);
        assert_ne!(record, other);
        assert_eq!(Value::from(3), Value::Int(3));
        assert_ne!(Value::Int(3), Value::Float(3.0));
    }

    #[test]
    fn test_record_properties() {
        let record = Record::new().with("a", 1).with("b", "two");
        assert_eq!(record.get("a").unwrap(), Value::Int(1));
        assert_eq!(record.get("missing").unwrap(), Value::Null);
        record.set("a", Value::Int(5)).unwrap();
        assert_eq!(record.get("a").unwrap(), Value::Int(5));
        assert!(record.delete("b").unwrap());
        assert!(!record.delete("b").unwrap());
        assert_eq!(record.keys(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_bound_function_sees_receiver() {
        let f = Function::method(|this, _args| async move { Ok(this.unwrap_or(Value::Null)) });
        let bound = f.bind(Value::from("me"));
        assert!(bound.is_bound());
        assert!(!f.ptr_eq(&bound));
        assert_eq!(bound.invoke(vec![]).await.unwrap(), Value::from("me"));
        assert_eq!(f.invoke(vec![]).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_named_function_reports_name() {
        let add = Function::named("math::add", |args| async move {
            let a = args.first().and_then(Value::as_i64).unwrap_or(0);
            let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::Int(a + b))
        });
        assert!(add.is_named());
        assert_eq!(add.name(), Some("math::add"));
        assert_eq!(
            add.invoke(vec![Value::Int(2), Value::Int(3)]).await.unwrap(),
            Value::Int(5)
        );
    }
}
