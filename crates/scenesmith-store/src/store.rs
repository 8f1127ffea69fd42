use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use scenesmith_types::Session;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::io::{atomic_write, ArtifactIo, FsArtifactIo};

const STATE_FILE: &str = "session_state.json";
const CONCEPT_FILE: &str = "concept.md";
const METADATA_FILE: &str = "metadata.json";
const SCRIPTS_DIR: &str = "scripts";
const RENDERS_DIR: &str = "renders";

fn wrap(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Per-session directory layout and write-once artifact persistence
/// (spec.md §4.1). Every write goes through `atomic_write` (tmp, fsync,
/// rename, fsync dir); state writes additionally take a per-session lock so
/// concurrent transitions serialize instead of racing each other's rename.
pub struct ArtifactStore {
    root: PathBuf,
    io: Arc<dyn ArtifactIo>,
    state_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_io(root, Arc::new(FsArtifactIo))
    }

    pub fn with_io(root: impl Into<PathBuf>, io: Arc<dyn ArtifactIo>) -> Self {
        Self {
            root: root.into(),
            io,
            state_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn scripts_dir(&self, id: Uuid) -> PathBuf {
        self.session_dir(id).join(SCRIPTS_DIR)
    }

    pub fn renders_dir(&self, id: Uuid) -> PathBuf {
        self.session_dir(id).join(RENDERS_DIR)
    }

    pub fn concept_path(&self, id: Uuid) -> PathBuf {
        self.session_dir(id).join(CONCEPT_FILE)
    }

    pub fn metadata_path(&self, id: Uuid) -> PathBuf {
        self.session_dir(id).join(METADATA_FILE)
    }

    pub fn state_path(&self, id: Uuid) -> PathBuf {
        self.session_dir(id).join(STATE_FILE)
    }

    pub fn render_path(&self, id: Uuid, iteration: u32) -> PathBuf {
        self.renders_dir(id).join(format!("render_iter{iteration}.png"))
    }

    pub fn combined_script_path(&self, id: Uuid, iteration: u32) -> PathBuf {
        self.scripts_dir(id).join(format!("combined_iter{iteration}.py"))
    }

    pub fn stage_script_path(&self, id: Uuid, filename: &str) -> PathBuf {
        self.scripts_dir(id).join(filename)
    }

    /// Creates the session's directory (idempotent).
    pub async fn open_session(&self, id: Uuid) -> Result<PathBuf> {
        let dir = self.session_dir(id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| wrap(&dir, e))?;
        Ok(dir)
    }

    /// Writes an immutable artifact at `path` atomically. Unlike state
    /// writes, artifact filenames are unique per (stage, iteration), so no
    /// locking is needed: two writers never target the same path.
    pub async fn write_artifact(&self, path: &Path, bytes: Vec<u8>) -> Result<PathBuf> {
        let io = self.io.clone();
        let target = path.to_path_buf();
        let written = target.clone();
        tokio::task::spawn_blocking(move || atomic_write(io.as_ref(), &target, &bytes))
            .await??;
        Ok(written)
    }

    pub async fn read_artifact(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|e| wrap(path, e))
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.state_locks.lock().await;
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Serializes `session` and writes `session_state.json` atomically,
    /// holding the per-session lock for the duration of the write+rename so
    /// concurrent state transitions never interleave (spec.md §5).
    pub async fn atomic_write_state(&self, session: &Session) -> Result<()> {
        let lock = self.lock_for(session.id).await;
        let _guard = lock.lock().await;
        self.open_session(session.id).await?;
        let bytes = serde_json::to_vec_pretty(session)?;
        let path = self.state_path(session.id);
        let io = self.io.clone();
        tokio::task::spawn_blocking(move || atomic_write(io.as_ref(), &path, &bytes)).await??;
        Ok(())
    }

    /// Returns `None`, not an error, when the session directory or its
    /// state file is missing (spec.md §4.1's "directory missing ... returns
    /// none").
    pub async fn load_state(&self, id: Uuid) -> Result<Option<Session>> {
        let path = self.state_path(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(wrap(&path, e)),
        }
    }

    /// Every session-id-shaped directory under the store root, regardless
    /// of whether it has a state file (the recovery pass may still be able
    /// to reconstruct a status from the artifacts present).
    pub async fn list_sessions(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(wrap(&self.root, e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| wrap(&self.root, e))? {
            if !entry.file_type().await.map_err(|e| wrap(&self.root, e))?.is_dir() {
                continue;
            }
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<Uuid>() {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Latest iteration number for which a render image exists, if any.
    pub async fn latest_render_iteration(&self, id: Uuid) -> Option<u32> {
        let dir = self.renders_dir(id);
        let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
        let mut best = None;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("render_iter").and_then(|s| s.strip_suffix(".png")) {
                if let Ok(n) = rest.parse::<u32>() {
                    best = Some(best.map_or(n, |b: u32| b.max(n)));
                }
            }
        }
        best
    }

    pub async fn has_blend_file(&self, id: Uuid) -> bool {
        self.blend_file_path(id).await.is_some()
    }

    /// First `.blend` file found directly under the session directory, if
    /// any. The Save stage's generated script chooses its own filename, so
    /// this is a scan rather than a fixed path.
    pub async fn blend_file_path(&self, id: Uuid) -> Option<PathBuf> {
        let dir = self.session_dir(id);
        let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().ends_with(".blend") {
                return Some(entry.path());
            }
        }
        None
    }

    pub async fn has_concept(&self, id: Uuid) -> bool {
        tokio::fs::metadata(self.concept_path(id)).await.is_ok()
    }

    /// Most recent modification time across the whole session directory
    /// tree, used by the staleness check (spec.md §4.1).
    pub async fn last_modified(&self, id: Uuid) -> Option<std::time::SystemTime> {
        let dir = self.session_dir(id);
        let mut stack = vec![dir];
        let mut latest: Option<std::time::SystemTime> = None;
        while let Some(current) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(meta) = entry.metadata().await else { continue };
                if meta.is_dir() {
                    stack.push(entry.path());
                }
                if let Ok(modified) = meta.modified() {
                    latest = Some(latest.map_or(modified, |l| l.max(modified)));
                }
            }
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenesmith_types::{Role, SessionStatus};

    #[tokio::test]
    async fn write_then_read_artifact_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let id = Uuid::new_v4();
        store.open_session(id).await.unwrap();
        let path = store.stage_script_path(id, "01_builder_iter1.py");
        store.write_artifact(&path, b"print(1)".to_vec()).await.unwrap();
        assert_eq!(store.read_artifact(&path).await.unwrap(), b"print(1)");
    }

    #[tokio::test]
    async fn load_state_on_missing_session_returns_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let result = store.load_state(Uuid::new_v4()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn state_round_trips_byte_for_byte_on_canonical_reserialize() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let mut session = Session::new("a red cube", vec![Role::Concept, Role::Builder], dir.path().to_string_lossy(), 3);
        session.set_status(SessionStatus::Running);
        store.atomic_write_state(&session).await.unwrap();
        let loaded = store.load_state(session.id).await.unwrap().unwrap();
        let reserialized = serde_json::to_vec_pretty(&loaded).unwrap();
        let original = serde_json::to_vec_pretty(&session).unwrap();
        assert_eq!(reserialized, original);
    }

    #[tokio::test]
    async fn list_sessions_finds_every_uuid_named_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.open_session(a).await.unwrap();
        store.open_session(b).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("not-a-uuid")).await.unwrap();
        let mut ids = store.list_sessions().await.unwrap();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn latest_render_iteration_picks_the_highest_k() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let id = Uuid::new_v4();
        tokio::fs::create_dir_all(store.renders_dir(id)).await.unwrap();
        store.write_artifact(&store.render_path(id, 1), b"x".to_vec()).await.unwrap();
        store.write_artifact(&store.render_path(id, 3), b"x".to_vec()).await.unwrap();
        store.write_artifact(&store.render_path(id, 2), b"x".to_vec()).await.unwrap();
        assert_eq!(store.latest_render_iteration(id).await, Some(3));
    }
}
