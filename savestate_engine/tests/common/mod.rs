#![allow(dead_code)]

use savestate_engine::discovery::ServiceDirectory;
use savestate_engine::net::{ParameterSink, TransportError};
use savestate_engine::osc::OscArg;
use savestate_engine::tree::{normalize_tree, FetchError, TreeFetcher};
use savestate_protocol::{Access, OscQueryNode, ParameterNode, RemoteEndpoint};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn leaf(path: &str, tag: &str, access: Access, value: serde_json::Value) -> OscQueryNode {
    OscQueryNode {
        full_path: path.to_string(),
        access,
        osc_type: Some(tag.to_string()),
        value: Some(vec![value]),
        ..OscQueryNode::default()
    }
}

pub fn container(path: &str, children: Vec<(&str, OscQueryNode)>) -> OscQueryNode {
    OscQueryNode {
        full_path: path.to_string(),
        contents: Some(
            children
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        ),
        ..OscQueryNode::default()
    }
}

/// A remote description with `/avatar/change` and three parameters.
pub fn avatar_doc(avatar: &str, hue: f64) -> OscQueryNode {
    let params = container(
        "/avatar/parameters",
        vec![
            (
                "Hue",
                leaf("/avatar/parameters/Hue", "f", Access::ReadWrite, serde_json::json!(hue)),
            ),
            (
                "Outfit",
                leaf("/avatar/parameters/Outfit", "i", Access::ReadWrite, serde_json::json!(2)),
            ),
            (
                "Visible",
                leaf("/avatar/parameters/Visible", "T", Access::ReadOnly, serde_json::json!(true)),
            ),
        ],
    );
    let change = leaf("/avatar/change", "s", Access::ReadWrite, serde_json::json!(avatar));
    let avatar_node = container("/avatar", vec![("change", change), ("parameters", params)]);
    container("/", vec![("avatar", avatar_node)])
}

/// Serves a shared in-memory document. `None` behaves like an unreachable remote.
#[derive(Clone, Default)]
pub struct MockFetcher {
    pub doc: Arc<Mutex<Option<OscQueryNode>>>,
    pub calls: Arc<AtomicUsize>,
}

impl MockFetcher {
    pub fn serving(doc: OscQueryNode) -> Self {
        let fetcher = Self::default();
        fetcher.set(Some(doc));
        fetcher
    }

    pub fn set(&self, doc: Option<OscQueryNode>) {
        *self.doc.lock().unwrap() = doc;
    }
}

impl TreeFetcher for MockFetcher {
    fn fetch_tree(&self, endpoint: &RemoteEndpoint) -> Result<ParameterNode, FetchError> {
        self.fetch_subtree(endpoint, "/")
    }

    fn fetch_subtree(&self, _endpoint: &RemoteEndpoint, path: &str) -> Result<ParameterNode, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let doc = self.doc.lock().unwrap();
        let node = doc
            .as_ref()
            .and_then(|d| d.node_at(path))
            .ok_or_else(|| FetchError::MissingPath(path.to_string()))?;
        normalize_tree(node)
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    pub sent: Arc<Mutex<Vec<(String, OscArg)>>>,
    /// Fails every send after this many have succeeded.
    pub fail_after: Arc<Mutex<Option<usize>>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<(String, OscArg)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ParameterSink for RecordingSink {
    fn send(&self, address: &str, arg: OscArg) -> Result<(), TransportError> {
        let mut sent = self.sent.lock().unwrap();
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if sent.len() >= limit {
                return Err(TransportError::Send {
                    address: address.to_string(),
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "mock refused"),
                });
            }
        }
        sent.push((address.to_string(), arg));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct CountingDirectory {
    pub refreshes: Arc<AtomicUsize>,
}

impl CountingDirectory {
    pub fn count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl ServiceDirectory for CountingDirectory {
    fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}
