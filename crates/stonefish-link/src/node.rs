//! LinkNode: TCP listener that serves a root object to authenticated peers.
//!
//! Every accepted stream becomes a [`Connection`] whose `host` header is the
//! peer's IP address, so address-based authenticators such as
//! [`IsLocal`](crate::auth::IsLocal) can inspect it. The node tracks live
//! connections and forgets each one once it closes.

use crate::config::LinkConfig;
use crate::connection::{Connection, ConnectionOptions};
use crate::deferred::Deferred;
use crate::error::LinkResult;
use crate::transport::TcpTransport;
use crate::value::Value;

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A listening endpoint.
pub struct LinkNode {
    config: LinkConfig,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    connections: DashMap<String, Connection>,
}

impl LinkNode {
    /// Bind `config.listen_addr` and start accepting peers.
    ///
    /// Each accepted connection is opened with a copy of `options`.
    pub async fn start(
        config: LinkConfig,
        options: ConnectionOptions,
    ) -> LinkResult<(Arc<Self>, JoinHandle<()>)> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Link node listening");

        let node = Arc::new(Self {
            config,
            local_addr,
            connections: DashMap::new(),
        });

        let node_clone = Arc::clone(&node);
        let accept_handle = tokio::spawn(async move {
            node_clone.accept_loop(listener, options).await;
        });

        Ok((node, accept_handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Handles to every open connection.
    pub fn connections(&self) -> Vec<Connection> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, options: ConnectionOptions) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "Accepted connection");
                    self.serve(stream, addr, options.clone());
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn serve(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, options: ConnectionOptions) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
        }
        let transport = TcpTransport::new(stream).with_max_message_size(self.config.max_message_size);
        let options = options.with_header("host", addr.ip().to_string());
        let connection = Connection::open(transport, options);
        let id = connection.id().to_string();
        self.connections.insert(id.clone(), connection.clone());

        let node = Arc::clone(self);
        tokio::spawn(async move {
            connection.closed().await;
            node.connections.remove(&id);
            debug!(peer = %addr, connection = %id, "Connection released");
        });
    }
}

/// Dial a node, authenticate with `key` and return the session and its root.
pub async fn connect(
    addr: SocketAddr,
    config: &LinkConfig,
    options: ConnectionOptions,
    key: &str,
    api: Option<Value>,
) -> LinkResult<(Connection, Deferred)> {
    let transport = TcpTransport::connect(addr)
        .await?
        .with_max_message_size(config.max_message_size);
    let connection = Connection::open(transport, options);
    match connection.authenticate(key, api).await {
        Ok(root) => {
            info!(peer = %addr, "Connected");
            Ok((connection, root))
        }
        Err(e) => {
            connection.close();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthPolicy;
    use crate::error::LinkError;
    use crate::value::{Function, Record};
    use std::time::Duration;
    use tokio::time::timeout;

    fn server_config() -> LinkConfig {
        LinkConfig {
            auth: AuthPolicy::KeyMatch {
                key: "secret".to_string(),
            },
            ..LinkConfig::default()
        }
    }

    async fn start_node() -> Arc<LinkNode> {
        let config = server_config();
        let root = Record::new()
            .with("greeting", "hello")
            .with(
                "add",
                Function::sync(|args| {
                    let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
                    Ok(Value::Int(sum))
                }),
            );
        let options = ConnectionOptions::from_config(&config).with_root(root);
        let (node, _task) = LinkNode::start(config, options).await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_connect_and_resolve_over_tcp() {
        let node = start_node().await;
        let (conn, root) = connect(
            node.local_addr(),
            &LinkConfig::default(),
            ConnectionOptions::default(),
            "secret",
            None,
        )
        .await
        .unwrap();

        assert_eq!(root.get("greeting").await.unwrap(), Value::from("hello"));
        let sum = root.get("add").call([2i64, 3, 4]).await.unwrap();
        assert_eq!(sum, Value::Int(9));
        assert_eq!(node.connection_count(), 1);
        let server_side = node.connections().pop().unwrap();
        assert_eq!(server_side.headers().get("host").map(String::as_str), Some("127.0.0.1"));

        conn.close();
        timeout(Duration::from_secs(5), async {
            while node.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let node = start_node().await;
        let result = connect(
            node.local_addr(),
            &LinkConfig::default(),
            ConnectionOptions::default(),
            "guess",
            None,
        )
        .await;
        assert!(matches!(result, Err(LinkError::Authentication(_))));
    }
}
