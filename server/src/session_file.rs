use std::fs;
use std::path::{Path, PathBuf};

use mindmap_system::{
    GraphRepository, PersistedChange, RepositoryError, SessionCatalog, SessionId, SessionMeta,
    StoredSession,
};
use parking_lot::Mutex;

const EXTENSION: &str = "json";

/// One JSON document per session, `<dir>/<id>.json`. The whole catalog is
/// kept in memory and each change rewrites the file of its session.
#[derive(Debug)]
pub struct FileRepository {
    dir: PathBuf,
    catalog: Mutex<SessionCatalog>,
}

impl FileRepository {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut catalog = SessionCatalog::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if session_id_of(&path).is_none() {
                continue;
            }
            match read_session_file(&path) {
                Ok(stored) => catalog.insert(stored),
                Err(err) => log::warn!("Skipping unreadable session file {:?}: {}", path, err),
            }
        }
        log::info!(
            "Loaded {} sessions from {:?}",
            catalog.metas().len(),
            dir
        );

        Ok(Self {
            dir,
            catalog: Mutex::new(catalog),
        })
    }

    fn file_name(&self, session_id: SessionId) -> PathBuf {
        self.dir.join(format!("{}.{}", session_id, EXTENSION))
    }

    fn write(&self, stored: &StoredSession) -> Result<(), RepositoryError> {
        let path = self.file_name(stored.meta.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(stored)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl GraphRepository for FileRepository {
    fn load(&self, session_id: SessionId) -> Result<Option<StoredSession>, RepositoryError> {
        Ok(self.catalog.lock().get(&session_id).cloned())
    }

    fn persist(
        &self,
        session_id: SessionId,
        change: &PersistedChange,
    ) -> Result<(), RepositoryError> {
        let stored = self.catalog.lock().apply(session_id, change)?.clone();
        self.write(&stored)
    }

    fn sessions(&self) -> Result<Vec<SessionMeta>, RepositoryError> {
        Ok(self.catalog.lock().metas())
    }

    fn create_session(&self, title: &str) -> Result<SessionMeta, RepositoryError> {
        let stored = {
            let mut catalog = self.catalog.lock();
            let stored = StoredSession::new(SessionMeta::new(catalog.next_session_id()?, title));
            catalog.insert(stored.clone());
            stored
        };
        self.write(&stored)?;
        Ok(stored.meta)
    }
}

fn session_id_of(path: &Path) -> Option<SessionId> {
    if path.extension()? != EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn read_session_file(path: &Path) -> Result<StoredSession, RepositoryError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
