use crate::codec::{flatten_with, replay, FlattenOptions, ReplayReport};
use crate::net::{ParameterSink, TransportError};
use crate::tree::{FetchError, TreeFetcher};
use savestate_protocol::{RemoteEndpoint, Snapshot};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PROFILES_DIR: &str = "Profiles";
/// Reserved per-avatar file holding the custom avatar display name.
pub const NAME_FILE: &str = "Name";
pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no avatar selected")]
    NoAvatar,
    #[error("no previous avatar to copy from")]
    NoPreviousAvatar,
    #[error("not connected to a remote service")]
    NoConnection,
    #[error("profile {0:?} not found")]
    ProfileNotFound(String),
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("profile name {0:?} already in use")]
    NameTaken(String),
    #[error("cannot copy profiles of {0} onto itself")]
    SameAvatar(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed profile {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileEntry {
    /// Assigned once at save time. `None` for files not named `{index}_{name}`.
    pub index: Option<u32>,
    pub display_name: String,
    pub path: PathBuf,
}

impl ProfileEntry {
    fn from_path(path: PathBuf) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let (index, display_name) = parse_file_name(file_name);
        Some(Self {
            index,
            display_name,
            path,
        })
    }

    fn sort_key(&self) -> (u32, &str) {
        (self.index.unwrap_or(u32::MAX), self.display_name.as_str())
    }
}

/// Splits `"{index}_{displayName}"`. Anything else keeps the whole name.
pub fn parse_file_name(file_name: &str) -> (Option<u32>, String) {
    if let Some((prefix, rest)) = file_name.split_once('_') {
        if !prefix.is_empty() {
            if let Ok(index) = prefix.parse::<u32>() {
                return (Some(index), rest.to_string());
            }
        }
    }
    (None, file_name.to_string())
}

fn file_name_for(index: Option<u32>, display_name: &str) -> String {
    match index {
        Some(i) => format!("{i}_{display_name}"),
        None => display_name.to_string(),
    }
}

fn validate_component(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Where a new snapshot comes from when saving or overriding.
pub struct Capture<'a> {
    pub fetcher: &'a dyn TreeFetcher,
    pub endpoint: Option<&'a RemoteEndpoint>,
    pub path: &'a str,
    pub options: FlattenOptions,
}

impl Capture<'_> {
    fn take(&self) -> Result<Snapshot, StoreError> {
        let endpoint = self.endpoint.ok_or(StoreError::NoConnection)?;
        let root = self.fetcher.fetch_subtree(endpoint, self.path)?;
        Ok(flatten_with(&root, self.options)?)
    }
}

/// Named, indexed snapshots per avatar, one file each.
#[derive(Debug)]
pub struct ProfileStore {
    profiles_root: PathBuf,
    page_size: usize,
    avatar_id: Option<String>,
    entries: Vec<ProfileEntry>,
    current_page: usize,
}

impl ProfileStore {
    pub fn new(storage_root: impl AsRef<Path>, page_size: usize) -> Self {
        Self {
            profiles_root: storage_root.as_ref().join(PROFILES_DIR),
            page_size: page_size.max(1),
            avatar_id: None,
            entries: Vec::new(),
            current_page: 0,
        }
    }

    pub fn avatar_dir(&self, avatar_id: &str) -> Result<PathBuf, StoreError> {
        if avatar_id.trim().is_empty() {
            return Err(StoreError::NoAvatar);
        }
        validate_component(avatar_id)?;
        Ok(self.profiles_root.join(avatar_id))
    }

    pub fn avatar_id(&self) -> Option<&str> {
        self.avatar_id.as_deref()
    }

    pub fn entries(&self) -> &[ProfileEntry] {
        &self.entries
    }

    pub fn load_profiles(&mut self, avatar_id: &str) -> Result<&[ProfileEntry], StoreError> {
        let dir = self.avatar_dir(avatar_id)?;
        if self.avatar_id.as_deref() != Some(avatar_id) {
            self.avatar_id = Some(avatar_id.to_string());
            self.current_page = 0;
        }
        self.entries = list_entries(&dir)?;
        self.current_page = self.current_page.min(self.total_pages().saturating_sub(1));
        debug!(avatar = %avatar_id, count = self.entries.len(), "loaded profiles");
        Ok(&self.entries)
    }

    fn ensure_loaded(&mut self, avatar_id: &str) -> Result<(), StoreError> {
        if self.avatar_id.as_deref() != Some(avatar_id) {
            self.load_profiles(avatar_id)?;
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn total_pages(&self) -> usize {
        self.entries.len().div_ceil(self.page_size)
    }

    pub fn current_page_profiles(&self) -> &[ProfileEntry] {
        let start = (self.current_page * self.page_size).min(self.entries.len());
        let end = (start + self.page_size).min(self.entries.len());
        &self.entries[start..end]
    }

    pub fn next_page(&mut self) -> bool {
        if self.current_page + 1 < self.total_pages() {
            self.current_page += 1;
            return true;
        }
        false
    }

    pub fn prev_page(&mut self) -> bool {
        if self.current_page > 0 {
            self.current_page -= 1;
            return true;
        }
        false
    }

    pub fn set_page(&mut self, page: usize) -> bool {
        if page < self.total_pages() && page != self.current_page {
            self.current_page = page;
            return true;
        }
        false
    }

    /// Max existing index plus one, or 1 for an avatar without indexed profiles.
    pub fn next_index(&self) -> u32 {
        self.entries
            .iter()
            .filter_map(|e| e.index)
            .max()
            .map_or(1, |m| m.saturating_add(1))
    }

    pub fn find(&self, display_name: &str) -> Option<&ProfileEntry> {
        self.entries.iter().find(|e| e.display_name == display_name)
    }

    pub fn find_index(&self, index: u32) -> Option<&ProfileEntry> {
        self.entries.iter().find(|e| e.index == Some(index))
    }

    pub fn save_profile(
        &mut self,
        avatar_id: &str,
        proposed_name: &str,
        capture: &Capture<'_>,
    ) -> Result<ProfileEntry, StoreError> {
        let dir = self.avatar_dir(avatar_id)?;
        if capture.endpoint.is_none() {
            return Err(StoreError::NoConnection);
        }
        self.load_profiles(avatar_id)?;

        let index = self.next_index();
        let name = match proposed_name.trim() {
            "" => format!("Profile {index}"),
            n => n.to_string(),
        };
        validate_component(&name)?;

        let snapshot = capture.take()?;
        let json = snapshot.to_json_pretty().map_err(|source| StoreError::Malformed {
            path: dir.clone(),
            source,
        })?;

        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let path = dir.join(file_name_for(Some(index), &name));
        write_atomic(&path, json.as_bytes())?;
        info!(avatar = %avatar_id, index, name = %name, params = snapshot.len(), "saved profile");

        self.load_profiles(avatar_id)?;
        Ok(ProfileEntry {
            index: Some(index),
            display_name: name,
            path,
        })
    }

    /// Re-captures into an existing entry, keeping its index and name.
    pub fn override_profile(
        &mut self,
        avatar_id: &str,
        display_name: &str,
        capture: &Capture<'_>,
    ) -> Result<ProfileEntry, StoreError> {
        self.load_profiles(avatar_id)?;
        let entry = self
            .find(display_name)
            .cloned()
            .ok_or_else(|| StoreError::ProfileNotFound(display_name.to_string()))?;
        let snapshot = capture.take()?;
        let json = snapshot.to_json_pretty().map_err(|source| StoreError::Malformed {
            path: entry.path.clone(),
            source,
        })?;
        write_atomic(&entry.path, json.as_bytes())?;
        info!(avatar = %avatar_id, name = %display_name, params = snapshot.len(), "overrode profile");
        Ok(entry)
    }

    pub fn read_snapshot(&self, entry: &ProfileEntry) -> Result<Snapshot, StoreError> {
        let json = match fs::read_to_string(&entry.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::ProfileNotFound(entry.display_name.clone()))
            }
            Err(e) => return Err(io_err(&entry.path)(e)),
        };
        Snapshot::from_json(&json).map_err(|source| StoreError::Malformed {
            path: entry.path.clone(),
            source,
        })
    }

    /// First entry with a matching display name wins.
    pub fn apply_profile(
        &mut self,
        avatar_id: &str,
        display_name: &str,
        sink: &dyn ParameterSink,
    ) -> Result<ReplayReport, StoreError> {
        self.ensure_loaded(avatar_id)?;
        let entry = self
            .find(display_name)
            .cloned()
            .ok_or_else(|| StoreError::ProfileNotFound(display_name.to_string()))?;
        self.apply_entry(avatar_id, &entry, sink)
    }

    pub fn apply_profile_at(
        &mut self,
        avatar_id: &str,
        index: u32,
        sink: &dyn ParameterSink,
    ) -> Result<ReplayReport, StoreError> {
        self.ensure_loaded(avatar_id)?;
        let entry = self
            .find_index(index)
            .cloned()
            .ok_or_else(|| StoreError::ProfileNotFound(format!("#{index}")))?;
        self.apply_entry(avatar_id, &entry, sink)
    }

    fn apply_entry(
        &self,
        avatar_id: &str,
        entry: &ProfileEntry,
        sink: &dyn ParameterSink,
    ) -> Result<ReplayReport, StoreError> {
        let snapshot = self.read_snapshot(entry)?;
        let report = replay(&snapshot, sink)?;
        info!(
            avatar = %avatar_id,
            name = %entry.display_name,
            sent = report.sent,
            skipped = report.skipped.len(),
            "applied profile"
        );
        Ok(report)
    }

    /// Indices of the remaining entries are left as they are.
    pub fn delete_profile(&mut self, avatar_id: &str, display_name: &str) -> Result<bool, StoreError> {
        self.ensure_loaded(avatar_id)?;
        let Some(entry) = self.find(display_name).cloned() else {
            warn!(avatar = %avatar_id, name = %display_name, "profile not found");
            return Ok(false);
        };
        self.delete_entry(avatar_id, &entry)
    }

    pub fn delete_profile_at(&mut self, avatar_id: &str, index: u32) -> Result<bool, StoreError> {
        self.ensure_loaded(avatar_id)?;
        let Some(entry) = self.find_index(index).cloned() else {
            warn!(avatar = %avatar_id, index, "profile not found");
            return Ok(false);
        };
        self.delete_entry(avatar_id, &entry)
    }

    fn delete_entry(&mut self, avatar_id: &str, entry: &ProfileEntry) -> Result<bool, StoreError> {
        let deleted = match fs::remove_file(&entry.path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(io_err(&entry.path)(e)),
        };
        if deleted {
            info!(avatar = %avatar_id, name = %entry.display_name, "deleted profile");
        }
        self.load_profiles(avatar_id)?;
        Ok(deleted)
    }

    pub fn rename_profile(
        &mut self,
        avatar_id: &str,
        display_name: &str,
        new_name: &str,
    ) -> Result<ProfileEntry, StoreError> {
        let new_name = new_name.trim();
        validate_component(new_name)?;
        self.load_profiles(avatar_id)?;

        let entry = self
            .find(display_name)
            .cloned()
            .ok_or_else(|| StoreError::ProfileNotFound(display_name.to_string()))?;
        if new_name == entry.display_name {
            return Ok(entry);
        }
        if self.find(new_name).is_some() {
            return Err(StoreError::NameTaken(new_name.to_string()));
        }

        let target = entry.path.with_file_name(file_name_for(entry.index, new_name));
        fs::rename(&entry.path, &target).map_err(io_err(&entry.path))?;
        info!(avatar = %avatar_id, from = %display_name, to = %new_name, "renamed profile");

        self.load_profiles(avatar_id)?;
        Ok(ProfileEntry {
            index: entry.index,
            display_name: new_name.to_string(),
            path: target,
        })
    }

    /// Copies every stored file, the display-name record included, overwriting
    /// collisions. A source without files copies nothing and is not an error.
    pub fn copy_profiles_from_avatar(
        &mut self,
        source_avatar_id: &str,
        target_avatar_id: &str,
    ) -> Result<usize, StoreError> {
        let source = self.avatar_dir(source_avatar_id)?;
        let target = self.avatar_dir(target_avatar_id)?;
        if source == target {
            return Err(StoreError::SameAvatar(source_avatar_id.to_string()));
        }

        let files = match stored_files(&source) {
            Ok(files) => files,
            Err(StoreError::Io { source: e, .. }) if e.kind() == io::ErrorKind::NotFound => {
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        if files.is_empty() {
            warn!(source = %source_avatar_id, "no stored profiles to copy");
            return Ok(0);
        }

        fs::create_dir_all(&target).map_err(io_err(&target))?;
        for file in &files {
            let Some(name) = file.file_name() else { continue };
            let dest = target.join(name);
            fs::copy(file, &dest).map_err(io_err(&dest))?;
        }
        info!(
            source = %source_avatar_id,
            target = %target_avatar_id,
            files = files.len(),
            "copied profiles"
        );

        if self.avatar_id.as_deref() == Some(target_avatar_id) {
            self.load_profiles(target_avatar_id)?;
        }
        Ok(files.len())
    }

    pub fn load_avatar_name(&self, avatar_id: &str) -> Result<Option<String>, StoreError> {
        let path = self.avatar_dir(avatar_id)?.join(NAME_FILE);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    pub fn save_avatar_name(&self, avatar_id: &str, name: &str) -> Result<(), StoreError> {
        let dir = self.avatar_dir(avatar_id)?;
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        write_atomic(&dir.join(NAME_FILE), name.as_bytes())
    }
}

/// Regular, non-hidden files in `dir`.
fn stored_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if is_file && !hidden {
            out.push(entry.path());
        }
    }
    Ok(out)
}

fn list_entries(dir: &Path) -> Result<Vec<ProfileEntry>, StoreError> {
    let files = match stored_files(dir) {
        Ok(files) => files,
        Err(StoreError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            return Ok(Vec::new())
        }
        Err(e) => return Err(e),
    };
    let mut entries: Vec<ProfileEntry> = files
        .into_iter()
        .filter(|p| p.file_name().is_some_and(|n| n != NAME_FILE))
        .filter_map(ProfileEntry::from_path)
        .collect();
    entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    Ok(entries)
}

/// Writes next to the target and renames into place.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    if let Err(e) = fs::write(&tmp, contents) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(&tmp)(e));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(path)(e));
    }
    Ok(())
}
