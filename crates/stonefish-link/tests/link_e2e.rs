//! End-to-end tests: a client and a server connection over an in-memory pair.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stonefish_link::program::{get_property, set_property};
use stonefish_link::transport::{memory, FrameSink, FrameSource, Transport};
use stonefish_link::{
    Connection, ConnectionOptions, Deferred, Function, IsLocal, KeyMatch, LinkError, LinkResult,
    Record, Value,
};
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Outbound frame counts, by message type.
#[derive(Default)]
struct FrameCounts {
    resolve: AtomicUsize,
    response: AtomicUsize,
    total: AtomicUsize,
}

impl FrameCounts {
    fn reset(&self) {
        self.resolve.store(0, Ordering::SeqCst);
        self.response.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
    }
}

struct Counting<T> {
    inner: T,
    counts: Arc<FrameCounts>,
}

struct CountingSink {
    inner: Box<dyn FrameSink>,
    counts: Arc<FrameCounts>,
}

#[async_trait]
impl FrameSink for CountingSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> LinkResult<()> {
        let text = String::from_utf8_lossy(&frame);
        if text.contains(r#""type":"resolve""#) {
            self.counts.resolve.fetch_add(1, Ordering::SeqCst);
        }
        if text.contains(r#""type":"response""#) {
            self.counts.response.fetch_add(1, Ordering::SeqCst);
        }
        self.counts.total.fetch_add(1, Ordering::SeqCst);
        self.inner.send_frame(frame).await
    }

    async fn close(&mut self) -> LinkResult<()> {
        self.inner.close().await
    }
}

impl<T: Transport> Transport for Counting<T> {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let (sink, source) = self.inner.split();
        let sink = CountingSink {
            inner: sink,
            counts: self.counts,
        };
        (Box::new(sink), source)
    }
}

struct Session {
    client: Connection,
    server: Connection,
    root: Deferred,
    client_frames: Arc<FrameCounts>,
    server_frames: Arc<FrameCounts>,
}

fn server_root() -> Record {
    let inc = Function::new(|args: Vec<Value>| async move {
        let x = args
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| LinkError::execution("inc expects an integer"))?;
        Ok::<_, LinkError>(Value::Int(x + 1))
    });
    let incr = Function::method(|this: Option<Value>, _args: Vec<Value>| async move {
        let this = this.ok_or_else(|| LinkError::execution("incr needs a receiver"))?;
        let key = Value::from("count");
        let count = get_property(&this, &key).await?.as_i64().unwrap_or(0);
        set_property(&this, &key, Value::Int(count + 1)).await
    });
    Record::new()
        .with("value", 42)
        .with("inc", inc)
        .with("counter", Record::new().with("count", 0).with("incr", incr))
        .with("child", Record::new().with("name", "child"))
}

async fn session() -> Session {
    init_tracing();
    let (a, b) = memory::pair();
    let client_frames = Arc::new(FrameCounts::default());
    let server_frames = Arc::new(FrameCounts::default());
    let client = Connection::open(
        Counting {
            inner: a,
            counts: Arc::clone(&client_frames),
        },
        ConnectionOptions::default(),
    );
    let server = Connection::open(
        Counting {
            inner: b,
            counts: Arc::clone(&server_frames),
        },
        ConnectionOptions::default()
            .with_root(server_root())
            .with_authenticator(KeyMatch::new("secret")),
    );
    let root = assert_ok!(client.authenticate("secret", None).await);
    client_frames.reset();
    server_frames.reset();
    Session {
        client,
        server,
        root,
        client_frames,
        server_frames,
    }
}

#[tokio::test]
async fn test_chained_call_is_one_round_trip() {
    let s = session().await;
    let result = s.root.get("inc").call([s.root.get("value")]).await;
    assert_eq!(assert_ok!(result), Value::Int(43));

    assert_eq!(s.client_frames.resolve.load(Ordering::SeqCst), 1);
    assert_eq!(s.client_frames.total.load(Ordering::SeqCst), 1);
    assert_eq!(s.server_frames.response.load(Ordering::SeqCst), 1);
    assert_eq!(s.server_frames.total.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_builder_caching_and_bare_handle() {
    let s = session().await;
    let ab1 = s.root.get("a").get("b");
    let ab2 = s.root.get("a").get("b");
    assert!(ab1.ptr_eq(&ab2));

    assert!(!s.root.is_thenable());
    assert!(s.root.then().is_none());
    let bare = assert_ok!(s.root.resolve().await);
    assert!(matches!(bare, Value::Remote(_)));
    assert_eq!(s.client_frames.total.load(Ordering::SeqCst), 0);

    // Missing properties read as null; reading through null fails remotely.
    assert!(assert_ok!(s.root.get("a").await).is_null());
    let err = assert_err!(ab1.await);
    assert!(matches!(err, LinkError::Execution(_)));
    assert!(!s.client.is_closed());
}

#[tokio::test]
async fn test_method_call_sees_receiver() {
    let s = session().await;
    let counter = s.root.get("counter");
    assert_eq!(assert_ok!(counter.get("incr").call(Vec::<Value>::new()).await), Value::Int(1));
    assert_eq!(assert_ok!(counter.get("incr").call(Vec::<Value>::new()).await), Value::Int(2));
    assert_eq!(assert_ok!(counter.get("count").await), Value::Int(2));
}

#[tokio::test]
async fn test_assignment_and_deletion() {
    let s = session().await;
    s.root.set("value", 7);
    // Already on the wire, ahead of anything issued afterwards.
    assert_eq!(s.client.pending_requests(), 1);
    assert_eq!(assert_ok!(s.root.get("value").await), Value::Int(7));

    assert_eq!(assert_ok!(s.root.delete_now("value").await), Value::Bool(true));
    assert_eq!(assert_ok!(s.root.get("value").defined().await), Value::Bool(false));
    assert_eq!(
        assert_ok!(s.root.get("inc").type_of().await),
        Value::from("function")
    );
}

#[tokio::test]
async fn test_fire_and_forget_delete_precedes_later_reads() {
    let s = session().await;
    s.root.get("child").delete("name");
    assert_eq!(
        assert_ok!(s.root.get("child").get("name").defined().await),
        Value::Bool(false)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requests_take_effect_in_arrival_order() {
    let s = session().await;
    for i in 0..200i64 {
        let (set, read) = tokio::join!(s.root.set_now("value", i), s.root.get("value"));
        assert_ok!(set);
        assert_eq!(assert_ok!(read), Value::Int(i), "round {i}");
    }
}

#[tokio::test]
async fn test_execution_errors_keep_connection_open() {
    let s = session().await;
    let err = assert_err!(s.root.get("inc").call(["not a number"]).await);
    assert!(matches!(err, LinkError::Execution(_)));
    assert!(!s.client.is_closed());
    assert_eq!(assert_ok!(s.root.get("value").await), Value::Int(42));
}

#[tokio::test]
async fn test_dropped_proxy_is_dereferenced() {
    let s = session().await;
    let child = assert_ok!(s.root.get("child").await);
    let uri = match &child {
        Value::Remote(remote) => remote.uri().to_string(),
        other => panic!("Expected a remote handle, got {other:?}"),
    };
    assert!(s.server.references().contains(&uri));

    drop(child);
    timeout(Duration::from_secs(5), async {
        while s.server.references().contains(&uri) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    // The root itself is still held by the client.
    assert_eq!(s.server.references().exported_count(), 1);
}

#[tokio::test]
async fn test_is_local_over_memory_pair() {
    init_tracing();
    let (a, b) = memory::pair();
    let client = Connection::open(a, ConnectionOptions::default());
    let _server = Connection::open(
        b,
        ConnectionOptions::default()
            .with_root(Record::new().with("local", true))
            .with_authenticator(IsLocal {
                ping_count: 20,
                max_average_ms: 250.0,
                max_stdev_ms: 250.0,
                max_ping_ms: 1000.0,
            })
            .with_header("host", "127.0.0.1"),
    );

    let root = assert_ok!(client.authenticate("", Some(IsLocal::client_api())).await);
    assert_eq!(assert_ok!(root.get("local").await), Value::Bool(true));
}
