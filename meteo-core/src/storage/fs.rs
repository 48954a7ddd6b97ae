use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::{
    error::StorageError,
    storage::{ObjectLocation, ObjectStore},
};

/// Local directory laid out as `<root>/<bucket>/<key>`.
///
/// Writes go to a sibling temp file that is renamed into place, so a reader sees either
/// the previous object or the new one.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, location: &ObjectLocation) -> Result<PathBuf, StorageError> {
        let relative = Path::new(&location.bucket).join(&location.key);
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(StorageError::Rejected {
                status: 400,
                message: format!("object location {location} escapes the store root"),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn ensure_access(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn put_object(
        &self,
        location: &ObjectLocation,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let path = self.path_for(location)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".part");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
