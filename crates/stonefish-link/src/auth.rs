//! Authenticators decide whether an incoming `Authenticate` succeeds.
//!
//! An authenticator sees the presented key, a builder on the API the peer
//! advertised (if any) and the headers of the underlying channel. It may call
//! back into the peer's API before deciding, as [`IsLocal`] does.

use crate::deferred::{Arg, Deferred};
use crate::value::{Function, Record, Value};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Pluggable authentication policy.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(
        &self,
        key: &str,
        peer_api: Option<Deferred>,
        headers: &HashMap<String, String>,
    ) -> bool;
}

/// Accepts every peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(
        &self,
        _key: &str,
        _peer_api: Option<Deferred>,
        _headers: &HashMap<String, String>,
    ) -> bool {
        true
    }
}

/// Rejects every peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl Authenticator for DenyAll {
    async fn authenticate(
        &self,
        _key: &str,
        _peer_api: Option<Deferred>,
        _headers: &HashMap<String, String>,
    ) -> bool {
        false
    }
}

/// Accepts peers presenting exactly `key`, compared in constant time.
#[derive(Clone)]
pub struct KeyMatch {
    key: String,
}

impl KeyMatch {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl std::fmt::Debug for KeyMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMatch").field("key", &"<redacted>").finish()
    }
}

#[async_trait]
impl Authenticator for KeyMatch {
    async fn authenticate(
        &self,
        key: &str,
        _peer_api: Option<Deferred>,
        _headers: &HashMap<String, String>,
    ) -> bool {
        self.key.as_bytes().ct_eq(key.as_bytes()).into()
    }
}

/// Name under which a client advertises its echo API.
pub const IS_LOCAL_API: &str = "IsLocal";

const LOOPBACK_HOSTS: [&str; 3] = ["127.0.0.1", "::1", "localhost"];

/// Heuristic "same host" check.
///
/// Requires a loopback `host` header, then pings the peer's
/// `IsLocal.ping` echo `ping_count` times. Every echo must match and come
/// back within `max_ping_ms`; the mean and population standard deviation of
/// the round trips must stay within `max_average_ms` and `max_stdev_ms`.
/// This is a weak signal, not proof of locality.
#[derive(Debug, Clone)]
pub struct IsLocal {
    pub ping_count: usize,
    pub max_average_ms: f64,
    pub max_stdev_ms: f64,
    pub max_ping_ms: f64,
}

impl Default for IsLocal {
    fn default() -> Self {
        Self {
            ping_count: 100,
            max_average_ms: 1.0,
            max_stdev_ms: 1.0,
            max_ping_ms: 10.0,
        }
    }
}

impl IsLocal {
    pub fn new() -> Self {
        Self::default()
    }

    /// The API a client advertises so this authenticator can ping it.
    pub fn client_api() -> Value {
        let ping = Function::new(|args: Vec<Value>| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        });
        Value::from(Record::new().with(IS_LOCAL_API, Record::new().with("ping", ping)))
    }

    /// Round-trip times in milliseconds, or `None` on any failed ping.
    async fn measure(&self, api: &Deferred) -> Option<Vec<f64>> {
        let ping = api.get(IS_LOCAL_API).get("ping");
        let mut samples = Vec::with_capacity(self.ping_count);
        for _ in 0..self.ping_count {
            let nonce = rand::random::<u32>();
            let start = Instant::now();
            let echoed = match ping.call([Arg::from(Value::from(nonce))]).await {
                Ok(value) => value,
                Err(e) => {
                    debug!(error = %e, "Ping failed");
                    return None;
                }
            };
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            if echoed.as_i64() != Some(i64::from(nonce)) {
                debug!("Ping echoed the wrong value");
                return None;
            }
            if elapsed > self.max_ping_ms {
                debug!(elapsed_ms = elapsed, "Ping over ceiling");
                return None;
            }
            samples.push(elapsed);
        }
        Some(samples)
    }
}

/// Mean and population standard deviation.
fn mean_stdev(samples: &[f64]) -> (f64, f64) {
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[async_trait]
impl Authenticator for IsLocal {
    async fn authenticate(
        &self,
        _key: &str,
        peer_api: Option<Deferred>,
        headers: &HashMap<String, String>,
    ) -> bool {
        let host = headers.get("host").map(String::as_str).unwrap_or_default();
        if !LOOPBACK_HOSTS.contains(&host) {
            debug!(host, "Peer is not on a loopback address");
            return false;
        }
        let Some(api) = peer_api else {
            return false;
        };
        match api.get(IS_LOCAL_API).defined().await {
            Ok(Value::Bool(true)) => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(error = %e, "Could not inspect peer API");
                return false;
            }
        }
        if self.ping_count == 0 {
            return false;
        }

        let Some(samples) = self.measure(&api).await else {
            return false;
        };
        let (mean, stdev) = mean_stdev(&samples);
        debug!(mean_ms = mean, stdev_ms = stdev, pings = samples.len(), "Measured peer latency");
        mean <= self.max_average_ms && stdev <= self.max_stdev_ms
    }
}

fn default_ping_count() -> usize {
    IsLocal::default().ping_count
}

fn default_max_average_ms() -> f64 {
    IsLocal::default().max_average_ms
}

fn default_max_stdev_ms() -> f64 {
    IsLocal::default().max_stdev_ms
}

fn default_max_ping_ms() -> f64 {
    IsLocal::default().max_ping_ms
}

/// Authentication policy as written in configuration.
///
/// ```toml
/// [auth]
/// policy = "key_match"
/// key = "secret"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AuthPolicy {
    AllowAll,
    #[default]
    DenyAll,
    KeyMatch {
        key: String,
    },
    IsLocal {
        #[serde(default = "default_ping_count")]
        ping_count: usize,
        #[serde(default = "default_max_average_ms")]
        max_average_ms: f64,
        #[serde(default = "default_max_stdev_ms")]
        max_stdev_ms: f64,
        #[serde(default = "default_max_ping_ms")]
        max_ping_ms: f64,
    },
}

impl AuthPolicy {
    pub fn build(&self) -> Arc<dyn Authenticator> {
        match self {
            AuthPolicy::AllowAll => Arc::new(AllowAll),
            AuthPolicy::DenyAll => Arc::new(DenyAll),
            AuthPolicy::KeyMatch { key } => Arc::new(KeyMatch::new(key.clone())),
            AuthPolicy::IsLocal {
                ping_count,
                max_average_ms,
                max_stdev_ms,
                max_ping_ms,
            } => Arc::new(IsLocal {
                ping_count: *ping_count,
                max_average_ms: *max_average_ms,
                max_stdev_ms: *max_stdev_ms,
                max_ping_ms: *max_ping_ms,
            }),
        }
    }
}
