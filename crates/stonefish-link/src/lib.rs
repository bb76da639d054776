//! Stonefish Link: transparent remote object handles over a framed channel.
//!
//! Two peers exchange typed messages over an ordered, message-framed duplex
//! transport. Values with identity cross the link as references; operations
//! on a remote handle are batched into a flat stack-machine program and sent
//! as a single `Resolve`, so a chain like `root.inc(root.value)` costs one
//! round trip.
//!
//! ## Architecture
//!
//! - **Connection**: one session, its pending requests and reference tables
//! - **Program**: flat instruction list and the stack machine that runs it
//! - **Deferred**: builder accumulating a program until it is awaited
//! - **References**: uri allocation, proxy caching and `Deref` on drop
//! - **Codec / Transport**: pluggable encoding and framing (JSON, TCP, memory)
//! - **Authenticator**: policies deciding incoming `Authenticate` requests
//! - **LinkNode**: TCP listener serving a root object

pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod deferred;
pub mod error;
pub mod message;
pub mod node;
pub mod program;
pub mod references;
pub mod transport;
pub mod value;

pub use auth::{AllowAll, AuthPolicy, Authenticator, DenyAll, IsLocal, KeyMatch};
pub use codec::{Codec, FunctionRegistry, JsonCodec, WellKnownTypes};
pub use config::{load_config, LinkConfig};
pub use connection::{Connection, ConnectionOptions, ConnectionState};
pub use deferred::{Arg, Deferred};
pub use error::{ErrorKind, LinkError, LinkResult};
pub use message::{Message, MessageKind};
pub use node::{connect, LinkNode};
pub use program::{execute, Builtin, Node, Program};
pub use references::{References, RemoteRef};
pub use transport::{memory, TcpTransport, Transport};
pub use value::{Function, Object, Record, Value};
