//! Shared fixtures for the engine integration tests
//!
//! [`FakeRemote`] keeps the remote tree in memory and appends every change
//! to a log; a cursor is the log length at the time it was handed out.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tempfile::TempDir;

use skysync_cache::{DatabasePool, SqliteHashCache, SqliteStateStore, SqliteSyncIndex};
use skysync_core::config::SyncConfig;
use skysync_core::domain::{
    ContentHash, Cursor, DeletedMetadata, FileMetadata, FolderMetadata, Metadata, RemotePath,
    Revision,
};
use skysync_core::ports::{
    IRemoteClient, ListFolderResult, LongPollResult, NamespaceInfo, ProgressCallback, RemoteError,
    WriteMode,
};
use skysync_sync::{hash_reader, SyncEngine};

// ============================================================================
// Fake remote
// ============================================================================

#[derive(Clone)]
enum Item {
    File { md: FileMetadata, content: Vec<u8> },
    Folder(FolderMetadata),
}

impl Item {
    fn metadata(&self) -> Metadata {
        match self {
            Item::File { md, .. } => Metadata::File(md.clone()),
            Item::Folder(md) => Metadata::Folder(md.clone()),
        }
    }

    fn path(&self) -> &RemotePath {
        match self {
            Item::File { md, .. } => &md.path_display,
            Item::Folder(md) => &md.path_display,
        }
    }
}

struct FakeState {
    /// Keyed by lower-cased path
    items: BTreeMap<String, Item>,
    log: Vec<Metadata>,
    next_rev: u64,
    next_id: u64,
    namespace: NamespaceInfo,
    offline: bool,
    downloads_blocked: bool,
}

pub struct FakeRemote {
    state: Mutex<FakeState>,
}

fn path(p: &str) -> RemotePath {
    RemotePath::new(p.to_string()).unwrap()
}

fn is_below(key: &str, folder: &str) -> bool {
    if folder == "/" {
        key != "/"
    } else {
        key.starts_with(&format!("{folder}/"))
    }
}

impl FakeState {
    fn rev(&mut self) -> Revision {
        self.next_rev += 1;
        Revision::new(format!("rev{:04}", self.next_rev)).unwrap()
    }

    fn id(&mut self) -> String {
        self.next_id += 1;
        format!("id:{}", self.next_id)
    }

    fn cursor(&self) -> Cursor {
        Cursor::new(self.log.len().to_string()).unwrap()
    }

    fn ensure_parents(&mut self, p: &RemotePath) {
        let mut missing = Vec::new();
        let mut current = p.parent();
        while let Some(parent) = current {
            if parent.is_root() || self.items.contains_key(&parent.lower()) {
                break;
            }
            missing.push(parent.clone());
            current = parent.parent();
        }
        for folder in missing.into_iter().rev() {
            self.insert_folder(folder);
        }
    }

    fn insert_folder(&mut self, p: RemotePath) -> FolderMetadata {
        self.ensure_parents(&p);
        let md = FolderMetadata {
            id: self.id(),
            path_display: p.clone(),
        };
        self.items.insert(p.lower(), Item::Folder(md.clone()));
        self.log.push(Metadata::Folder(md.clone()));
        md
    }

    fn insert_file(&mut self, p: RemotePath, content: Vec<u8>) -> FileMetadata {
        self.ensure_parents(&p);
        let existing = match self.items.get(&p.lower()) {
            Some(Item::File { md, .. }) => Some(md.id.clone()),
            _ => None,
        };
        let id = existing.unwrap_or_else(|| self.id());
        let md = FileMetadata {
            id,
            path_display: p.clone(),
            rev: self.rev(),
            content_hash: hash_reader(&content[..]).unwrap(),
            size: content.len() as u64,
            client_modified: Utc::now(),
            server_modified: Utc::now(),
            modified_by: None,
        };
        self.items.insert(
            p.lower(),
            Item::File {
                md: md.clone(),
                content,
            },
        );
        self.log.push(Metadata::File(md.clone()));
        md
    }

    fn delete_tree(&mut self, p: &RemotePath) -> bool {
        let key = p.lower();
        if self.items.remove(&key).is_none() {
            return false;
        }
        self.items.retain(|k, _| !is_below(k, &key));
        self.log.push(Metadata::Deleted(DeletedMetadata {
            path_display: p.clone(),
        }));
        true
    }

    fn listing(&self, folder: &RemotePath, recursive: bool) -> Vec<Metadata> {
        let key = folder.lower();
        self.items
            .iter()
            .filter(|(k, _)| is_below(k, &key))
            .filter(|(_, item)| recursive || item.path().parent().map(|p| p.lower()) == Some(key.clone()))
            .map(|(_, item)| item.metadata())
            .collect()
    }
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                items: BTreeMap::new(),
                log: Vec::new(),
                next_rev: 0,
                next_id: 0,
                namespace: NamespaceInfo {
                    root_namespace_id: "ns:home".to_string(),
                    home_namespace_id: "ns:home".to_string(),
                    home_path: None,
                },
                offline: false,
                downloads_blocked: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn online(&self) -> Result<MutexGuard<'_, FakeState>, RemoteError> {
        let state = self.lock();
        if state.offline {
            return Err(RemoteError::Connection("offline".to_string()));
        }
        Ok(state)
    }

    pub fn put_file(&self, p: &str, content: &[u8]) -> FileMetadata {
        self.lock().insert_file(path(p), content.to_vec())
    }

    pub fn put_folder(&self, p: &str) -> FolderMetadata {
        self.lock().insert_folder(path(p))
    }

    pub fn delete(&self, p: &str) {
        self.lock().delete_tree(&path(p));
    }

    pub fn file_content(&self, p: &str) -> Option<Vec<u8>> {
        match self.lock().items.get(&p.to_lowercase()) {
            Some(Item::File { content, .. }) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn file_metadata(&self, p: &str) -> Option<FileMetadata> {
        match self.lock().items.get(&p.to_lowercase()) {
            Some(Item::File { md, .. }) => Some(md.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, p: &str) -> bool {
        self.lock().items.contains_key(&p.to_lowercase())
    }

    /// Display paths of every remote item, sorted
    pub fn paths(&self) -> Vec<String> {
        self.lock()
            .items
            .values()
            .map(|item| item.path().to_string())
            .collect()
    }

    pub fn change_count(&self) -> usize {
        self.lock().log.len()
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Makes every download fail with a per-item error
    pub fn block_downloads(&self, blocked: bool) {
        self.lock().downloads_blocked = blocked;
    }

    /// Switches to a team space: every item moves below `home` and the old
    /// change log becomes unusable
    pub fn join_team(&self, home: &str) {
        let mut state = self.lock();
        let home = path(home);
        let items = std::mem::take(&mut state.items);
        state.insert_folder(home.clone());
        for item in items.into_values() {
            let relative = item.path().as_str().to_string();
            let moved = path(&format!("{}{}", home.as_str(), relative));
            match item {
                Item::File { mut md, content } => {
                    md.path_display = moved.clone();
                    state.items.insert(moved.lower(), Item::File { md, content });
                }
                Item::Folder(mut md) => {
                    md.path_display = moved.clone();
                    state.items.insert(moved.lower(), Item::Folder(md));
                }
            }
        }
        state.namespace = NamespaceInfo {
            root_namespace_id: "ns:team".to_string(),
            home_namespace_id: "ns:home".to_string(),
            home_path: Some(home),
        };
    }

    /// Moves the home folder's contents back to the root; the rest of the
    /// team space disappears
    pub fn leave_team(&self) {
        let mut state = self.lock();
        let Some(home) = state.namespace.home_path.clone() else {
            return;
        };
        let items = std::mem::take(&mut state.items);
        for (key, item) in items {
            if !is_below(&key, &home.lower()) {
                continue;
            }
            let moved = path(&item.path().as_str()[home.as_str().len()..]);
            let item = match item {
                Item::File { mut md, content } => {
                    md.path_display = moved.clone();
                    Item::File { md, content }
                }
                Item::Folder(mut md) => {
                    md.path_display = moved.clone();
                    Item::Folder(md)
                }
            };
            state.items.insert(moved.lower(), item);
        }
        state.namespace = NamespaceInfo {
            root_namespace_id: "ns:home".to_string(),
            home_namespace_id: "ns:home".to_string(),
            home_path: None,
        };
    }
}

#[async_trait::async_trait]
impl IRemoteClient for FakeRemote {
    async fn list_folder(&self, folder: &RemotePath, recursive: bool) -> Result<ListFolderResult, RemoteError> {
        let state = self.online()?;
        if !folder.is_root() && !matches!(state.items.get(&folder.lower()), Some(Item::Folder(_))) {
            return Err(RemoteError::NotFound(folder.to_string()));
        }
        Ok(ListFolderResult {
            entries: state.listing(folder, recursive),
            cursor: state.cursor(),
            has_more: false,
        })
    }

    async fn list_remote_changes(&self, cursor: &Cursor) -> Result<ListFolderResult, RemoteError> {
        let state = self.online()?;
        let start: usize = cursor.as_str().parse().map_err(|_| RemoteError::CursorReset)?;
        if start > state.log.len() {
            return Err(RemoteError::CursorReset);
        }
        Ok(ListFolderResult {
            entries: state.log[start..].to_vec(),
            cursor: state.cursor(),
            has_more: false,
        })
    }

    async fn get_latest_cursor(&self, _path: &RemotePath) -> Result<Cursor, RemoteError> {
        Ok(self.online()?.cursor())
    }

    async fn wait_for_remote_changes(&self, cursor: &Cursor, timeout: Duration) -> Result<LongPollResult, RemoteError> {
        let start: usize = cursor.as_str().parse().map_err(|_| RemoteError::CursorReset)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = self.online()?.log.len() > start;
            if changed {
                return Ok(LongPollResult {
                    changes: true,
                    backoff: None,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(LongPollResult {
                    changes: false,
                    backoff: None,
                });
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &RemotePath,
        mode: WriteMode,
        progress: Option<ProgressCallback>,
    ) -> Result<FileMetadata, RemoteError> {
        let content = std::fs::read(local_path).map_err(|e| RemoteError::NotFound(e.to_string()))?;
        let mut state = self.online()?;
        let key = remote_path.lower();
        match (state.items.get(&key), &mode) {
            (Some(Item::Folder(_)), _) => return Err(RemoteError::Conflict(remote_path.to_string())),
            (Some(_), WriteMode::Add) => return Err(RemoteError::Conflict(remote_path.to_string())),
            (Some(Item::File { md, .. }), WriteMode::Update(rev)) if md.rev != *rev => {
                return Err(RemoteError::Conflict(remote_path.to_string()))
            }
            (None, WriteMode::Update(_)) => return Err(RemoteError::Conflict(remote_path.to_string())),
            _ => {}
        }
        let size = content.len() as u64;
        let md = state.insert_file(remote_path.clone(), content);
        drop(state);
        if let Some(progress) = progress {
            progress(size, size);
        }
        Ok(md)
    }

    async fn download(
        &self,
        remote_path: &RemotePath,
        local_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<FileMetadata, RemoteError> {
        let (md, content) = {
            let state = self.online()?;
            if state.downloads_blocked {
                return Err(RemoteError::RestrictedContent(remote_path.to_string()));
            }
            match state.items.get(&remote_path.lower()) {
                Some(Item::File { md, content }) => (md.clone(), content.clone()),
                _ => return Err(RemoteError::NotFound(remote_path.to_string())),
            }
        };
        std::fs::write(local_path, &content).map_err(|e| RemoteError::ServerError(e.to_string()))?;
        if let Some(progress) = progress {
            progress(md.size, md.size);
        }
        Ok(md)
    }

    async fn move_item(&self, from: &RemotePath, to: &RemotePath) -> Result<Metadata, RemoteError> {
        let mut state = self.online()?;
        let from_key = from.lower();
        let to_key = to.lower();
        if !state.items.contains_key(&from_key) {
            return Err(RemoteError::NotFound(from.to_string()));
        }
        if from_key != to_key && state.items.contains_key(&to_key) {
            return Err(RemoteError::Conflict(to.to_string()));
        }
        state.ensure_parents(to);

        let moved: Vec<(String, Item)> = state
            .items
            .iter()
            .filter(|(k, _)| **k == from_key || is_below(k, &from_key))
            .map(|(k, item)| (k.clone(), item.clone()))
            .collect();
        let mut result = None;
        for (key, _) in &moved {
            state.items.remove(key);
        }
        state.log.push(Metadata::Deleted(DeletedMetadata {
            path_display: from.clone(),
        }));
        for (_, item) in moved {
            let Some(new_path) = item.path().replace_prefix(from, to) else {
                continue;
            };
            let item = match item {
                Item::File { mut md, content } => {
                    md.path_display = new_path.clone();
                    Item::File { md, content }
                }
                Item::Folder(mut md) => {
                    md.path_display = new_path.clone();
                    Item::Folder(md)
                }
            };
            let md = item.metadata();
            if new_path.lower() == to_key {
                result = Some(md.clone());
            }
            state.log.push(md);
            state.items.insert(new_path.lower(), item);
        }
        result.ok_or_else(|| RemoteError::NotFound(from.to_string()))
    }

    async fn remove(&self, p: &RemotePath, expected_rev: Option<&Revision>) -> Result<Metadata, RemoteError> {
        let mut state = self.online()?;
        match (state.items.get(&p.lower()), expected_rev) {
            (None, _) => return Err(RemoteError::NotFound(p.to_string())),
            (Some(Item::File { md, .. }), Some(rev)) if md.rev != *rev => {
                return Err(RemoteError::Conflict(p.to_string()))
            }
            _ => {}
        }
        state.delete_tree(p);
        Ok(Metadata::Deleted(DeletedMetadata {
            path_display: p.clone(),
        }))
    }

    async fn make_dir(&self, p: &RemotePath) -> Result<FolderMetadata, RemoteError> {
        let mut state = self.online()?;
        if state.items.contains_key(&p.lower()) {
            return Err(RemoteError::Conflict(p.to_string()));
        }
        Ok(state.insert_folder(p.clone()))
    }

    async fn get_metadata(&self, p: &RemotePath) -> Result<Option<Metadata>, RemoteError> {
        Ok(self.online()?.items.get(&p.lower()).map(Item::metadata))
    }

    async fn get_namespace_info(&self) -> Result<NamespaceInfo, RemoteError> {
        Ok(self.online()?.namespace.clone())
    }

    async fn check_connection(&self) -> Result<(), RemoteError> {
        self.online().map(|_| ())
    }
}

// ============================================================================
// Engine fixture
// ============================================================================

/// A sync root, its databases and an engine over a shared fake remote
pub struct Fixture {
    pub dir: TempDir,
    pub root: PathBuf,
    pub remote: Arc<FakeRemote>,
    pub engine: SyncEngine,
}

pub fn test_config(root: &Path) -> SyncConfig {
    SyncConfig {
        root: root.to_path_buf(),
        local_event_delay_ms: 50,
        max_retries: 2,
        connection_check_interval: 1,
        use_polling_watcher: true,
        polling_interval: 1,
        ..SyncConfig::default()
    }
}

pub async fn fixture(remote: Arc<FakeRemote>) -> Fixture {
    fixture_with(remote, |_| {}).await
}

/// Like [`fixture`], with `adjust` applied to the test configuration
pub async fn fixture_with(remote: Arc<FakeRemote>, adjust: impl FnOnce(&mut SyncConfig)) -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("SkySync");
    std::fs::create_dir(&root).unwrap();
    let mut config = test_config(&root);
    adjust(&mut config);

    let index_db = DatabasePool::new(&dir.path().join("index.db")).await.unwrap();
    let cache_db = DatabasePool::new(&dir.path().join("hash_cache.db")).await.unwrap();
    let engine = SyncEngine::new(
        config,
        Arc::clone(&remote) as Arc<dyn IRemoteClient>,
        Arc::new(SqliteSyncIndex::new(index_db.pool().clone())),
        Arc::new(SqliteHashCache::new(cache_db.pool().clone())),
        Arc::new(SqliteStateStore::new(index_db.pool().clone())),
    )
    .await
    .unwrap();

    Fixture {
        dir,
        root,
        remote,
        engine,
    }
}

static MTIME: AtomicU64 = AtomicU64::new(1_700_000_000);

/// Writes a local file with a modification time no other write in this
/// process used, so cached fingerprints never mask the change
pub fn write_local(root: &Path, relative: &str, content: &[u8]) -> PathBuf {
    let target = root.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&target, content).unwrap();
    let secs = MTIME.fetch_add(1, Ordering::SeqCst);
    let file = std::fs::File::options().write(true).open(&target).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
    target
}

pub fn read_local(root: &Path, relative: &str) -> Vec<u8> {
    std::fs::read(root.join(relative)).unwrap()
}

pub fn hash_of(content: &[u8]) -> ContentHash {
    hash_reader(content).unwrap()
}
