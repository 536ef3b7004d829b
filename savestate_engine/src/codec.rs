use crate::net::{ParameterSink, TransportError};
use crate::osc::OscArg;
use crate::tree::{FetchError, MAX_TREE_DEPTH};
use savestate_protocol::{ParameterNode, Snapshot, SnapshotEntry};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenOptions {
    /// Drop leaves the remote does not accept writes for.
    pub writable_only: bool,
}

pub fn flatten(root: &ParameterNode) -> Result<Snapshot, FetchError> {
    flatten_with(root, FlattenOptions::default())
}

pub fn flatten_with(root: &ParameterNode, opts: FlattenOptions) -> Result<Snapshot, FetchError> {
    let mut snapshot = Snapshot::new();
    walk(root, 0, opts, &mut snapshot)?;
    Ok(snapshot)
}

fn walk(
    node: &ParameterNode,
    depth: usize,
    opts: FlattenOptions,
    out: &mut Snapshot,
) -> Result<(), FetchError> {
    if depth > MAX_TREE_DEPTH {
        return Err(FetchError::TooDeep);
    }
    match node {
        ParameterNode::Leaf {
            full_path,
            type_tag,
            access,
            ..
        } => {
            if opts.writable_only && !access.is_writable() {
                return Ok(());
            }
            let value = node.value_string().unwrap_or_default();
            out.insert(full_path.clone(), value, type_tag.clone());
        }
        ParameterNode::Container { children, .. } => {
            for (_, child) in children {
                walk(child, depth + 1, opts, out)?;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    UnknownTypeTag(String),
    InvalidValue(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEntry {
    pub address: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    pub sent: usize,
    pub skipped: Vec<SkippedEntry>,
}

impl ReplayReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Maps one stored entry to the typed argument it replays as.
pub fn typed_arg(entry: &SnapshotEntry) -> Result<OscArg, SkipReason> {
    let raw = entry.value.trim();
    let invalid = || SkipReason::InvalidValue(entry.value.clone());
    match entry.type_tag.as_str() {
        "f" => raw.parse::<f32>().map(OscArg::Float).map_err(|_| invalid()),
        "i" => raw.parse::<i32>().map(OscArg::Int).map_err(|_| invalid()),
        "T" => parse_bool(raw).map(OscArg::Bool).ok_or_else(invalid),
        other => Err(SkipReason::UnknownTypeTag(other.to_string())),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    if raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Sends every entry in insertion order. Entries that cannot be typed are
/// skipped and reported; a transport failure aborts the rest.
pub fn replay(snapshot: &Snapshot, sink: &dyn ParameterSink) -> Result<ReplayReport, TransportError> {
    let mut report = ReplayReport::default();
    for entry in snapshot.iter() {
        match typed_arg(entry) {
            Ok(arg) => {
                sink.send(&entry.address, arg)?;
                report.sent += 1;
            }
            Err(reason) => {
                warn!(address = %entry.address, tag = %entry.type_tag, ?reason, "skipping entry");
                report.skipped.push(SkippedEntry {
                    address: entry.address.clone(),
                    reason,
                });
            }
        }
    }
    debug!(sent = report.sent, skipped = report.skipped.len(), "replay finished");
    Ok(report)
}
