//! Straight-line stack programs.
//!
//! A [`Program`] is a flat list of [`Node`]s: pushes and call markers. There
//! are no jumps. A call marker pops an integer count, then a function, then
//! that many arguments (kept in push order), invokes the function and pushes
//! its single result. Chains of derived accesses compose by concatenation.

use crate::error::{LinkError, LinkResult};
use crate::value::{Function, Value};

use std::fmt;
use std::sync::Arc;

/// Protocol helpers addressable by the same name on every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// `get(object, key)`
    Get,
    /// `get_bind(object, key)`: like `get`, binding functions to `object`.
    GetBind,
    /// `set(object, key, value)`
    Set,
    /// `delete(object, key)`
    Delete,
    /// `defined(value)`: value is not null.
    Defined,
    /// `type_of(value)`
    TypeOf,
}

impl Builtin {
    pub const ALL: [Builtin; 6] = [
        Builtin::Get,
        Builtin::GetBind,
        Builtin::Set,
        Builtin::Delete,
        Builtin::Defined,
        Builtin::TypeOf,
    ];

    /// Stable `module::export` name.
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Get => "stonefish::get",
            Builtin::GetBind => "stonefish::get_bind",
            Builtin::Set => "stonefish::set",
            Builtin::Delete => "stonefish::delete",
            Builtin::Defined => "stonefish::defined",
            Builtin::TypeOf => "stonefish::type_of",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::Get | Builtin::GetBind | Builtin::Delete => 2,
            Builtin::Set => 3,
            Builtin::Defined | Builtin::TypeOf => 1,
        }
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One program instruction.
#[derive(Debug, Clone)]
pub enum Node {
    /// Push a literal or reference.
    Push(Value),
    /// Pop `(count, function, ...args)`, push the result.
    Call,
}

impl Node {
    pub fn builtin(builtin: Builtin) -> Self {
        Node::Push(Value::Function(Function::builtin(builtin)))
    }

    pub fn int(n: usize) -> Self {
        Node::Push(Value::Int(n as i64))
    }

    /// The builtin pushed by this node, if any.
    pub fn as_builtin(&self) -> Option<Builtin> {
        match self {
            Node::Push(Value::Function(f)) => f.as_builtin(),
            _ => None,
        }
    }
}

/// An immutable instruction sequence.
#[derive(Debug, Clone)]
pub struct Program {
    nodes: Arc<[Node]>,
}

impl Default for Program {
    fn default() -> Self {
        Self::build(Vec::new())
    }
}

impl Program {
    pub fn build(nodes: Vec<Node>) -> Self {
        Self {
            nodes: nodes.into(),
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// A new program with `more` appended.
    pub fn concat(&self, more: impl IntoIterator<Item = Node>) -> Self {
        let mut nodes = self.nodes.to_vec();
        nodes.extend(more);
        Self::build(nodes)
    }

    /// Program calling `function` with literal `args`.
    pub fn call(function: Value, args: Vec<Value>) -> Self {
        let argc = args.len();
        let mut nodes: Vec<Node> = args.into_iter().map(Node::Push).collect();
        nodes.push(Node::Push(function));
        nodes.push(Node::int(argc));
        nodes.push(Node::Call);
        Self::build(nodes)
    }

    /// Program applying a builtin to the value already on the stack plus `extra` literals.
    pub fn apply(builtin: Builtin, extra: Vec<Value>) -> Self {
        let mut nodes: Vec<Node> = extra.into_iter().map(Node::Push).collect();
        nodes.push(Node::builtin(builtin));
        nodes.push(Node::int(builtin.arity()));
        nodes.push(Node::Call);
        Self::build(nodes)
    }

    /// Every value pushed by this program.
    pub fn literals(&self) -> impl Iterator<Item = &Value> {
        self.nodes.iter().filter_map(|n| match n {
            Node::Push(v) => Some(v),
            Node::Call => None,
        })
    }
}

impl FromIterator<Node> for Program {
    fn from_iter<I: IntoIterator<Item = Node>>(iter: I) -> Self {
        Self::build(iter.into_iter().collect())
    }
}

/// Run `program` starting from `initial`, returning the single value left.
pub async fn execute(program: &Program, initial: Vec<Value>) -> LinkResult<Value> {
    let mut stack = initial;
    for (pc, node) in program.iter().enumerate() {
        match node {
            Node::Push(value) => stack.push(value.clone()),
            Node::Call => {
                let count = match stack.pop() {
                    Some(Value::Int(n)) if n >= 0 => n as usize,
                    Some(other) => {
                        return Err(LinkError::execution(format!(
                            "call at {pc}: expected argument count, found {}",
                            other.type_name()
                        )))
                    }
                    None => return Err(underflow(pc)),
                };
                let function = stack.pop().ok_or_else(|| underflow(pc))?;
                if stack.len() < count {
                    return Err(underflow(pc));
                }
                let args = stack.split_off(stack.len() - count);
                let result = invoke(&function, args).await?;
                stack.push(result);
            }
        }
    }
    match stack.len() {
        1 => stack.pop().ok_or_else(|| underflow(program.len())),
        n => Err(LinkError::execution(format!(
            "program finished with {n} values on the stack, expected exactly 1"
        ))),
    }
}

fn underflow(pc: usize) -> LinkError {
    LinkError::execution(format!("stack underflow at instruction {pc}"))
}

/// Invoke any callable value.
pub async fn invoke(function: &Value, args: Vec<Value>) -> LinkResult<Value> {
    match function {
        Value::Function(f) => f.invoke(args).await,
        Value::Object(o) => o.call(None, args).await,
        Value::Remote(r) => r.call(args).await,
        other => Err(LinkError::execution(format!(
            "{} is not callable",
            other.type_name()
        ))),
    }
}

pub(crate) async fn run_builtin(builtin: Builtin, mut args: Vec<Value>) -> LinkResult<Value> {
    if args.len() != builtin.arity() {
        return Err(LinkError::execution(format!(
            "{builtin} expects {} arguments, got {}",
            builtin.arity(),
            args.len()
        )));
    }
    match builtin {
        Builtin::Get => get_property(&args[0], &args[1]).await,
        Builtin::GetBind => get_bound_property(&args[0], &args[1]).await,
        Builtin::Set => {
            let value = args.pop().unwrap_or(Value::Null);
            set_property(&args[0], &args[1], value).await
        }
        Builtin::Delete => delete_property(&args[0], &args[1]).await,
        Builtin::Defined => Ok(Value::Bool(!args[0].is_null())),
        Builtin::TypeOf => match &args[0] {
            Value::Remote(r) => r.type_of().await,
            other => Ok(Value::from(other.type_name())),
        },
    }
}

fn key_name(key: &Value) -> LinkResult<String> {
    match key {
        Value::Str(s) => Ok(s.clone()),
        Value::Int(i) => Ok(i.to_string()),
        other => Err(LinkError::execution(format!(
            "property key must be a string or integer, found {}",
            other.type_name()
        ))),
    }
}

/// Read `key` from `object`.
pub async fn get_property(object: &Value, key: &Value) -> LinkResult<Value> {
    match object {
        Value::Remote(r) => r.get(key.clone()).await,
        Value::Object(o) => o.get(&key_name(key)?),
        Value::Map(m) => Ok(m.get(&key_name(key)?).cloned().unwrap_or(Value::Null)),
        Value::List(items) => match key {
            Value::Int(i) => Ok(usize::try_from(*i)
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(Value::Null)),
            Value::Str(s) if s == "length" => Ok(Value::Int(items.len() as i64)),
            _ => Ok(Value::Null),
        },
        Value::Str(s) if key.as_str() == Some("length") => {
            Ok(Value::Int(s.chars().count() as i64))
        }
        Value::Null => Err(LinkError::execution(format!(
            "cannot read property '{}' of null",
            key_name(key)?
        ))),
        _ => Ok(Value::Null),
    }
}

/// Read `key` from `object`, binding functions to `object`.
pub async fn get_bound_property(object: &Value, key: &Value) -> LinkResult<Value> {
    if let Value::Remote(r) = object {
        return r.get_bind(key.clone()).await;
    }
    match get_property(object, key).await? {
        Value::Function(f) => Ok(Value::Function(f.bind(object.clone()))),
        other => Ok(other),
    }
}

/// Assign `key` on `object`, returning the assigned value.
pub async fn set_property(object: &Value, key: &Value, value: Value) -> LinkResult<Value> {
    match object {
        Value::Remote(r) => r.set(key.clone(), value).await,
        Value::Object(o) => {
            o.set(&key_name(key)?, value.clone())?;
            Ok(value)
        }
        other => Err(LinkError::execution(format!(
            "cannot assign '{}' on a {} value",
            key_name(key)?,
            other.type_name()
        ))),
    }
}

/// Delete `key` on `object`.
pub async fn delete_property(object: &Value, key: &Value) -> LinkResult<Value> {
    match object {
        Value::Remote(r) => r.delete(key.clone()).await,
        Value::Object(o) => Ok(Value::Bool(o.delete(&key_name(key)?)?)),
        _ => Ok(Value::Bool(false)),
    }
}
