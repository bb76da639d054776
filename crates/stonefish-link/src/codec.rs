//! Message encoding.
//!
//! The [`Codec`] trait turns messages into frames and back. Values that have
//! identity (objects, closures, remote handles) are not serialized; they are
//! handed to an [`ExternScheme`] registered under a tag, which maps them to a
//! uri on the way out and back to a value on the way in. The connection
//! registers its reference table under the `"link"` tag.
//!
//! [`JsonCodec`] is the default codec. Frames are JSON objects:
//!
//! ```text
//! {"header": "<well-known types>", "id": 42, "type": "resolve", "program": [...]}
//! ```
//!
//! Within values, `$`-keyed single-entry objects are reserved:
//! `{"$extern": {"tag", "uri"}}`, `{"$fn": "module::export"}`,
//! `{"$map": {...}}` (a map whose keys start with `$`) and, inside programs
//! only, `{"$call": null}`.

use crate::error::{ErrorPayload, LinkError, LinkResult};
use crate::message::{Message, MessageKind};
use crate::program::{Builtin, Node, Program};
use crate::value::{Function, Value};

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Protocol revision folded into the well-known types header.
pub const PROTOCOL_VERSION: u32 = 1;

/// Handler for one external-reference tag.
pub trait ExternScheme: Send + Sync + 'static {
    /// Whether this scheme encodes `value`.
    fn claims(&self, value: &Value) -> bool;
    /// Uri standing for `value` on the wire.
    fn get_uri(&self, value: &Value) -> LinkResult<String>;
    /// Value standing for `uri` on this side.
    fn get_item(&self, uri: &str) -> LinkResult<Value>;
}

/// Extern schemes by tag, consulted in registration order.
#[derive(Clone, Default)]
pub struct ExternRegistry {
    schemes: Vec<(String, Arc<dyn ExternScheme>)>,
}

impl ExternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `scheme` under `tag`, replacing any previous handler.
    pub fn register(&mut self, tag: impl Into<String>, scheme: Arc<dyn ExternScheme>) {
        let tag = tag.into();
        self.schemes.retain(|(t, _)| *t != tag);
        self.schemes.push((tag, scheme));
    }

    pub fn get(&self, tag: &str) -> Option<&Arc<dyn ExternScheme>> {
        self.schemes.iter().find(|(t, _)| t == tag).map(|(_, s)| s)
    }

    fn claiming(&self, value: &Value) -> Option<(&str, &Arc<dyn ExternScheme>)> {
        self.schemes
            .iter()
            .find(|(_, s)| s.claims(value))
            .map(|(t, s)| (t.as_str(), s))
    }
}

/// Named functions a peer may reference in programs.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Function>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function created with [`Function::named`].
    pub fn register(&mut self, function: Function) -> LinkResult<()> {
        if !function.is_named() {
            return Err(LinkError::Config(
                "only named functions can be registered".to_string(),
            ));
        }
        let name = function.name().unwrap_or_default().to_string();
        self.functions.insert(name, function);
        Ok(())
    }

    /// Builder-style [`FunctionRegistry::register`].
    pub fn with(mut self, function: Function) -> LinkResult<Self> {
        self.register(function)?;
        Ok(self)
    }

    /// Builtins first, then registered functions.
    pub fn resolve(&self, name: &str) -> Option<Function> {
        if let Some(b) = Builtin::from_name(name) {
            return Some(Function::builtin(b));
        }
        self.functions.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Header identifying the set of types both peers agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WellKnownTypes {
    fingerprint: String,
}

impl WellKnownTypes {
    /// Header over the message kinds, builtins and any extra type names.
    pub fn new<'a>(extra: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("stonefish-link/{PROTOCOL_VERSION}").as_bytes());
        let builtins = Builtin::ALL.iter().map(|b| b.name());
        for name in MessageKind::NAMES.into_iter().chain(builtins).chain(extra) {
            hasher.update(b"\n");
            hasher.update(name.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        Self {
            fingerprint: digest[..16].to_string(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl Default for WellKnownTypes {
    fn default() -> Self {
        Self::new([])
    }
}

/// Everything a codec needs besides the message itself.
#[derive(Clone, Copy)]
pub struct CodecContext<'a> {
    pub externs: &'a ExternRegistry,
    pub functions: &'a FunctionRegistry,
    pub header: &'a WellKnownTypes,
}

/// A frame that could not be decoded.
///
/// `id` and `kind` are filled in when the envelope itself was readable, so
/// the receiver can still settle or reject the matching request.
#[derive(Debug)]
pub struct DecodeFailure {
    pub id: Option<u64>,
    pub kind: Option<String>,
    pub error: LinkError,
}

impl DecodeFailure {
    fn bare(error: LinkError) -> Self {
        Self {
            id: None,
            kind: None,
            error,
        }
    }
}

/// Converts messages to frames and back.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, message: &Message, ctx: CodecContext<'_>) -> LinkResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8], ctx: CodecContext<'_>) -> Result<Message, DecodeFailure>;
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    header: String,
    id: u64,
    #[serde(flatten)]
    body: Body,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Body {
    Message,
    Request,
    Response {
        value: JsonValue,
    },
    Reject {
        error: ErrorPayload,
    },
    Authenticate {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api: Option<JsonValue>,
    },
    Resolve {
        program: Vec<JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<JsonValue>,
    },
    Deref {
        uri: String,
    },
}

const EXTERN_TAG: &str = "$extern";
const FN_TAG: &str = "$fn";
const MAP_TAG: &str = "$map";
const CALL_TAG: &str = "$call";

/// JSON codec built on `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }

    fn encode_value(&self, value: &Value, ctx: CodecContext<'_>) -> LinkResult<JsonValue> {
        Ok(match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .ok_or_else(|| LinkError::Encoding(format!("cannot encode float {f}")))?,
            Value::Str(s) => JsonValue::String(s.clone()),
            Value::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|v| self.encode_value(v, ctx))
                    .collect::<LinkResult<_>>()?,
            ),
            Value::Map(map) => {
                let mut out = JsonMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.encode_value(v, ctx)?);
                }
                if map.keys().any(|k| k.starts_with('$')) {
                    tagged(MAP_TAG, JsonValue::Object(out))
                } else {
                    JsonValue::Object(out)
                }
            }
            Value::Function(f) if !f.is_bound() && (f.as_builtin().is_some() || f.is_named()) => {
                tagged(FN_TAG, JsonValue::from(f.name().unwrap_or_default()))
            }
            Value::Function(_) | Value::Object(_) | Value::Remote(_) => {
                let (tag, scheme) = ctx.externs.claiming(value).ok_or_else(|| {
                    LinkError::Encoding(format!(
                        "no extern scheme can encode a {} value",
                        value.type_name()
                    ))
                })?;
                let uri = scheme.get_uri(value)?;
                tagged(EXTERN_TAG, serde_json::json!({ "tag": tag, "uri": uri }))
            }
        })
    }

    fn decode_value(&self, json: JsonValue, ctx: CodecContext<'_>) -> LinkResult<Value> {
        Ok(match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().ok_or_else(|| {
                    LinkError::Encoding(format!("unrepresentable number {n}"))
                })?),
            },
            JsonValue::String(s) => Value::Str(s),
            JsonValue::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.decode_value(v, ctx))
                    .collect::<LinkResult<_>>()?,
            ),
            JsonValue::Object(mut map) => {
                let tag = single_tag(&map);
                match tag.as_deref() {
                    Some(EXTERN_TAG) => {
                        let reference = map.remove(EXTERN_TAG).unwrap_or_default();
                        let tag = reference.get("tag").and_then(JsonValue::as_str);
                        let uri = reference.get("uri").and_then(JsonValue::as_str);
                        let (Some(tag), Some(uri)) = (tag, uri) else {
                            return Err(LinkError::Encoding(
                                "malformed extern reference".to_string(),
                            ));
                        };
                        let scheme = ctx.externs.get(tag).ok_or_else(|| {
                            LinkError::Encoding(format!("no extern scheme for tag '{tag}'"))
                        })?;
                        scheme.get_item(uri)?
                    }
                    Some(FN_TAG) => {
                        let name = map.remove(FN_TAG).unwrap_or_default();
                        let name = name.as_str().ok_or_else(|| {
                            LinkError::Encoding("function name must be a string".to_string())
                        })?;
                        Value::Function(ctx.functions.resolve(name).ok_or_else(|| {
                            LinkError::Encoding(format!("unknown function '{name}'"))
                        })?)
                    }
                    Some(MAP_TAG) => match map.remove(MAP_TAG) {
                        Some(JsonValue::Object(inner)) => self.decode_map(inner, ctx)?,
                        _ => {
                            return Err(LinkError::Encoding("malformed escaped map".to_string()))
                        }
                    },
                    Some(other) => {
                        return Err(LinkError::Encoding(format!("unexpected tag '{other}'")))
                    }
                    None => {
                        if map.keys().any(|k| k.starts_with('$')) {
                            return Err(LinkError::Encoding(
                                "unescaped '$' key in map".to_string(),
                            ));
                        }
                        self.decode_map(map, ctx)?
                    }
                }
            }
        })
    }

    fn decode_map(&self, map: JsonMap<String, JsonValue>, ctx: CodecContext<'_>) -> LinkResult<Value> {
        let mut out = BTreeMap::new();
        for (k, v) in map {
            out.insert(k, self.decode_value(v, ctx)?);
        }
        Ok(Value::Map(out))
    }

    fn encode_program(&self, program: &Program, ctx: CodecContext<'_>) -> LinkResult<Vec<JsonValue>> {
        program
            .iter()
            .map(|node| match node {
                Node::Push(v) => self.encode_value(v, ctx),
                Node::Call => Ok(tagged(CALL_TAG, JsonValue::Null)),
            })
            .collect()
    }

    fn decode_program(&self, nodes: Vec<JsonValue>, ctx: CodecContext<'_>) -> LinkResult<Program> {
        nodes
            .into_iter()
            .map(|json| {
                let is_call = matches!(
                    &json,
                    JsonValue::Object(map) if single_tag(map).as_deref() == Some(CALL_TAG)
                );
                if is_call {
                    Ok(Node::Call)
                } else {
                    self.decode_value(json, ctx).map(Node::Push)
                }
            })
            .collect()
    }

    fn encode_optional(&self, value: &Option<Value>, ctx: CodecContext<'_>) -> LinkResult<Option<JsonValue>> {
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(v) => self.encode_value(v, ctx).map(Some),
        }
    }

    fn decode_optional(&self, json: Option<JsonValue>, ctx: CodecContext<'_>) -> LinkResult<Option<Value>> {
        match json {
            None | Some(JsonValue::Null) => Ok(None),
            Some(v) => self.decode_value(v, ctx).map(Some),
        }
    }
}

impl Codec for JsonCodec {
    fn encode(&self, message: &Message, ctx: CodecContext<'_>) -> LinkResult<Vec<u8>> {
        let body = match &message.kind {
            MessageKind::Message => Body::Message,
            MessageKind::Request => Body::Request,
            MessageKind::Response { value } => Body::Response {
                value: self.encode_value(value, ctx)?,
            },
            MessageKind::Reject { error } => Body::Reject {
                error: error.clone(),
            },
            MessageKind::Authenticate { key, api } => Body::Authenticate {
                key: key.clone(),
                api: self.encode_optional(api, ctx)?,
            },
            MessageKind::Resolve { program, target } => Body::Resolve {
                program: self.encode_program(program, ctx)?,
                target: self.encode_optional(target, ctx)?,
            },
            MessageKind::Deref { uri } => Body::Deref { uri: uri.clone() },
        };
        let envelope = Envelope {
            header: ctx.header.fingerprint().to_string(),
            id: message.id,
            body,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn decode(&self, bytes: &[u8], ctx: CodecContext<'_>) -> Result<Message, DecodeFailure> {
        let json: JsonValue =
            serde_json::from_slice(bytes).map_err(|e| DecodeFailure::bare(e.into()))?;
        let id = json.get("id").and_then(JsonValue::as_u64);
        let kind = json
            .get("type")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let fail = |error: LinkError| DecodeFailure {
            id,
            kind: kind.clone(),
            error,
        };

        let header = json.get("header").and_then(JsonValue::as_str);
        if header != Some(ctx.header.fingerprint()) {
            return Err(fail(LinkError::Encoding(format!(
                "well-known types header mismatch: expected {}, got {}",
                ctx.header.fingerprint(),
                header.unwrap_or("<none>")
            ))));
        }

        let envelope: Envelope = serde_json::from_value(json).map_err(|e| fail(e.into()))?;
        let kind = match envelope.body {
            Body::Message => MessageKind::Message,
            Body::Request => MessageKind::Request,
            Body::Response { value } => MessageKind::Response {
                value: self.decode_value(value, ctx).map_err(fail)?,
            },
            Body::Reject { error } => MessageKind::Reject { error },
            Body::Authenticate { key, api } => MessageKind::Authenticate {
                key,
                api: self.decode_optional(api, ctx).map_err(fail)?,
            },
            Body::Resolve { program, target } => MessageKind::Resolve {
                program: self.decode_program(program, ctx).map_err(fail)?,
                target: self.decode_optional(target, ctx).map_err(fail)?,
            },
            Body::Deref { uri } => MessageKind::Deref { uri },
        };
        Ok(Message {
            id: envelope.id,
            kind,
        })
    }
}

fn tagged(tag: &str, inner: JsonValue) -> JsonValue {
    let mut map = JsonMap::new();
    map.insert(tag.to_string(), inner);
    JsonValue::Object(map)
}

fn single_tag(map: &JsonMap<String, JsonValue>) -> Option<String> {
    if map.len() != 1 {
        return None;
    }
    map.keys().next().filter(|k| k.starts_with('$')).cloned()
}
