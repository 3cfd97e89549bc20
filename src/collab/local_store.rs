use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task;

use super::{ObjectStore, RemoteObject, SideChannelError, SideResult};

/// Object store backed by a directory, addressed by flat object ids.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalDirStore { root: root.into() }
    }

    fn object_path(&self, id: &str) -> SideResult<PathBuf> {
        let valid = !id.is_empty()
            && !id.contains(['/', '\\'])
            && id != "."
            && id != "..";
        if !valid {
            return Err(SideChannelError::Storage(format!("invalid object id {id:?}")));
        }
        Ok(self.root.join(id))
    }
}

fn storage_err(op: &str, path: &Path, err: impl std::fmt::Display) -> SideChannelError {
    SideChannelError::Storage(format!("{op} {}: {err}", path.display()))
}

fn url_for(path: &Path) -> String {
    format!("file://{}", path.display())
}

async fn blocking<T, F>(f: F) -> SideResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> SideResult<T> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| SideChannelError::Storage(format!("storage task failed: {err}")))?
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    async fn upload(&self, bytes: &[u8], destination_id: &str) -> SideResult<String> {
        let root = self.root.clone();
        let path = self.object_path(destination_id)?;
        let bytes = bytes.to_vec();
        blocking(move || {
            fs::create_dir_all(&root).map_err(|e| storage_err("create", &root, e))?;
            let partial = path.with_extension("upload");
            fs::write(&partial, &bytes).map_err(|e| storage_err("write", &partial, e))?;
            fs::rename(&partial, &path).map_err(|e| storage_err("rename", &path, e))?;
            Ok(url_for(&path))
        })
        .await
    }

    async fn download(&self, destination_id: &str) -> SideResult<Vec<u8>> {
        let path = self.object_path(destination_id)?;
        blocking(move || fs::read(&path).map_err(|e| storage_err("read", &path, e))).await
    }

    async fn list(&self, prefix: &str) -> SideResult<Vec<RemoteObject>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        blocking(move || {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let entries = fs::read_dir(&root).map_err(|e| storage_err("list", &root, e))?;
            let mut objects = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| storage_err("list", &root, e))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.starts_with(&prefix) || name.ends_with(".upload") {
                    continue;
                }
                let meta = entry
                    .metadata()
                    .map_err(|e| storage_err("stat", &entry.path(), e))?;
                if !meta.is_file() {
                    continue;
                }
                let created_at = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                objects.push(RemoteObject {
                    url: url_for(&entry.path()),
                    id: name,
                    size: meta.len(),
                    created_at,
                });
            }
            objects.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(objects)
        })
        .await
    }
}
