use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use savestate_protocol::{Access, HostInfo, OscQueryNode, AVATAR_CHANGE_ADDRESS};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What the local endpoint describes about itself.
#[derive(Debug, Clone)]
pub struct Description {
    pub root: OscQueryNode,
    pub host_info: HostInfo,
}

impl Description {
    /// The endpoints this client listens on: only `/avatar/change`.
    pub fn for_listener(service_name: &str, osc_ip: IpAddr, osc_port: u16) -> Self {
        let change = OscQueryNode {
            full_path: AVATAR_CHANGE_ADDRESS.to_string(),
            access: Access::WriteOnly,
            osc_type: Some("s".to_string()),
            ..OscQueryNode::default()
        };
        let avatar = OscQueryNode {
            full_path: "/avatar".to_string(),
            contents: Some([("change".to_string(), change)].into_iter().collect()),
            ..OscQueryNode::default()
        };
        let root = OscQueryNode {
            full_path: "/".to_string(),
            description: Some("root node".to_string()),
            contents: Some([("avatar".to_string(), avatar)].into_iter().collect()),
            ..OscQueryNode::default()
        };

        let extensions = ["ACCESS", "VALUE", "TYPE", "DESCRIPTION"]
            .into_iter()
            .map(|k| (k.to_string(), true))
            .chain([("RANGE".to_string(), false), ("CLIPMODE".to_string(), false)])
            .collect();
        let host_info = HostInfo {
            name: service_name.to_string(),
            osc_ip: osc_ip.to_string(),
            osc_port,
            osc_transport: "UDP".to_string(),
            extensions,
        };
        Self { root, host_info }
    }
}

pub fn router(description: Arc<Description>) -> Router {
    Router::new().fallback(describe).with_state(description)
}

async fn describe(State(desc): State<Arc<Description>>, uri: Uri) -> Response {
    if uri
        .query()
        .is_some_and(|q| q.split('&').any(|p| p == "HOST_INFO"))
    {
        return Json(desc.host_info.clone()).into_response();
    }
    match desc.root.node_at(uri.path()) {
        Some(node) => Json(node.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// HTTP description endpoint on its own thread and single-threaded runtime.
pub struct QueryServer {
    local_addr: SocketAddr,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueryServer {
    pub fn start(addr: SocketAddr, description: Description) -> io::Result<Self> {
        Self::serve(addr, router(Arc::new(description)))
    }

    /// Runs any router on the server thread.
    pub fn serve(addr: SocketAddr, app: Router) -> io::Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let join_handle = thread::Builder::new()
            .name("oscquery-http".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(std_listener) {
                        Ok(l) => l,
                        Err(e) => {
                            warn!(error = %e, "description server listener failed");
                            return;
                        }
                    };
                    let shutdown = async {
                        let _ = shutdown_rx.await;
                    };
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown)
                        .await
                    {
                        warn!(error = %e, "description server stopped");
                    }
                });
            })?;
        debug!(%local_addr, "description server listening");

        Ok(Self {
            local_addr,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        if let Ok(mut tx) = self.shutdown_tx.lock() {
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
        }
        if let Ok(mut h) = self.join_handle.lock() {
            if let Some(h) = h.take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for QueryServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
