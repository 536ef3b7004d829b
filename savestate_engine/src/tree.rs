use reqwest::blocking::Client;
use reqwest::StatusCode;
use savestate_protocol::{OscQueryNode, ParameterNode, RemoteEndpoint, AVATAR_CHANGE_ADDRESS};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const MAX_TREE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("description request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("description request to {url} returned {status}")]
    BadStatus { url: String, status: StatusCode },
    #[error("invalid description url: {0}")]
    Url(#[from] url::ParseError),
    #[error("malformed description document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("path {0} not present in remote tree")]
    MissingPath(String),
    #[error("parameter tree deeper than {MAX_TREE_DEPTH} levels")]
    TooDeep,
    #[error("node {0} carries no value")]
    NotALeaf(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStrategy {
    /// One request for the whole document, navigated locally.
    #[default]
    WholeTree,
    /// One request per path, plus one per container that came back without children.
    PerPath,
}

pub trait TreeFetcher {
    fn fetch_tree(&self, endpoint: &RemoteEndpoint) -> Result<ParameterNode, FetchError>;
    fn fetch_subtree(
        &self,
        endpoint: &RemoteEndpoint,
        path: &str,
    ) -> Result<ParameterNode, FetchError>;
}

pub struct HttpTreeFetcher {
    client: Client,
    strategy: FetchStrategy,
}

impl HttpTreeFetcher {
    pub fn new(timeout: Duration, strategy: FetchStrategy) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, strategy })
    }

    fn get_document(&self, endpoint: &RemoteEndpoint, path: &str) -> Result<OscQueryNode, FetchError> {
        let url = Url::parse(&endpoint.base_url())?.join(path)?;
        debug!(%url, "fetching description");
        let resp = self.client.get(url.clone()).send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::BadStatus {
                url: url.to_string(),
                status,
            });
        }
        let body = resp.text()?;
        Ok(serde_json::from_str(&body)?)
    }

    fn expand(
        &self,
        endpoint: &RemoteEndpoint,
        node: ParameterNode,
        depth: usize,
    ) -> Result<ParameterNode, FetchError> {
        if depth > MAX_TREE_DEPTH {
            return Err(FetchError::TooDeep);
        }
        let (full_path, children) = match node {
            ParameterNode::Container {
                full_path,
                children,
            } => (full_path, children),
            leaf => return Ok(leaf),
        };

        let children = if children.is_empty() && depth > 0 {
            debug!(path = %full_path, "refetching unresolved container");
            match normalize_at(&self.get_document(endpoint, &full_path)?, depth)? {
                ParameterNode::Container { children, .. } => children,
                leaf => return Ok(leaf),
            }
        } else {
            children
        };

        let children = children
            .into_iter()
            .map(|(name, child)| Ok((name, self.expand(endpoint, child, depth + 1)?)))
            .collect::<Result<Vec<_>, FetchError>>()?;
        Ok(ParameterNode::Container {
            full_path,
            children,
        })
    }
}

impl TreeFetcher for HttpTreeFetcher {
    fn fetch_tree(&self, endpoint: &RemoteEndpoint) -> Result<ParameterNode, FetchError> {
        self.fetch_subtree(endpoint, "/")
    }

    fn fetch_subtree(
        &self,
        endpoint: &RemoteEndpoint,
        path: &str,
    ) -> Result<ParameterNode, FetchError> {
        match self.strategy {
            FetchStrategy::WholeTree => {
                let doc = self.get_document(endpoint, "/")?;
                let node = doc
                    .node_at(path)
                    .ok_or_else(|| FetchError::MissingPath(path.to_string()))?;
                normalize_tree(node)
            }
            FetchStrategy::PerPath => {
                let node = normalize_tree(&self.get_document(endpoint, path)?)?;
                self.expand(endpoint, node, 0)
            }
        }
    }
}

/// Converts a wire node into the tagged tree. A present `VALUE` makes a leaf,
/// anything else is a container.
pub fn normalize_tree(raw: &OscQueryNode) -> Result<ParameterNode, FetchError> {
    normalize_at(raw, 0)
}

fn normalize_at(raw: &OscQueryNode, depth: usize) -> Result<ParameterNode, FetchError> {
    if depth > MAX_TREE_DEPTH {
        return Err(FetchError::TooDeep);
    }
    if let Some(value) = raw.first_value() {
        return Ok(ParameterNode::Leaf {
            full_path: raw.full_path.clone(),
            value: value.clone(),
            type_tag: raw.osc_type.clone().unwrap_or_default(),
            access: raw.access,
        });
    }
    let children = raw
        .contents
        .iter()
        .flatten()
        .map(|(name, child)| Ok((name.clone(), normalize_at(child, depth + 1)?)))
        .collect::<Result<Vec<_>, FetchError>>()?;
    Ok(ParameterNode::Container {
        full_path: raw.full_path.clone(),
        children,
    })
}

/// Reads the identity currently reported at `/avatar/change`.
pub fn fetch_current_avatar(
    fetcher: &dyn TreeFetcher,
    endpoint: &RemoteEndpoint,
) -> Result<String, FetchError> {
    let node = fetcher.fetch_subtree(endpoint, AVATAR_CHANGE_ADDRESS)?;
    node.value_string()
        .ok_or_else(|| FetchError::NotALeaf(AVATAR_CHANGE_ADDRESS.to_string()))
}
