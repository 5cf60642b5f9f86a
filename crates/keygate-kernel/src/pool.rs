//! Directory-backed pool of single-use credential files.
//!
//! Two directories partition the pool: files in `available_dir` can still be
//! handed out, files in `issued_dir` already were. Reservation is not a pool
//! mutation; callers pass the set of ids they hold open and `reserve_next`
//! skips them. The only mutation is [`ResourcePool::commit`].

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use keygate_contracts::ResourceId;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("resource {0} is not in the available partition")]
    NotFound(ResourceId),
    #[error("invalid resource id {0:?}")]
    InvalidId(String),
    #[error("pool storage error: {0}")]
    Storage(String),
}

/// One credential file with its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: ResourceId,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub available: usize,
    pub issued: usize,
}

#[derive(Debug, Clone)]
pub struct ResourcePool {
    available_dir: PathBuf,
    issued_dir: PathBuf,
    extension: String,
}

impl ResourcePool {
    /// Opens the pool, creating both directories when they are missing.
    pub fn open(
        available_dir: impl Into<PathBuf>,
        issued_dir: impl Into<PathBuf>,
        extension: &str,
    ) -> Result<Self, PoolError> {
        let available_dir = available_dir.into();
        let issued_dir = issued_dir.into();
        for dir in [&available_dir, &issued_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                PoolError::Storage(format!("create {} failed: {e}", dir.display()))
            })?;
        }
        Ok(Self {
            available_dir,
            issued_dir,
            extension: extension.trim_start_matches('.').to_string(),
        })
    }

    pub fn available_dir(&self) -> &Path {
        &self.available_dir
    }

    /// Available ids in lexicographic order. Empty is a normal result.
    pub fn list_available(&self) -> Result<Vec<ResourceId>, PoolError> {
        let ids = self.list(&self.available_dir)?;
        info!(available = ids.len(), "pool listed");
        Ok(ids)
    }

    pub fn list_issued(&self) -> Result<Vec<ResourceId>, PoolError> {
        self.list(&self.issued_dir)
    }

    pub fn counts(&self) -> Result<PoolCounts, PoolError> {
        Ok(PoolCounts {
            available: self.list(&self.available_dir)?.len(),
            issued: self.list(&self.issued_dir)?.len(),
        })
    }

    /// First available id not already held by an open reservation.
    pub fn reserve_next(
        &self,
        reserved: &BTreeSet<ResourceId>,
    ) -> Result<Option<ResourceId>, PoolError> {
        Ok(self
            .list_available()?
            .into_iter()
            .find(|id| !reserved.contains(id)))
    }

    pub fn read(&self, id: &ResourceId) -> Result<Resource, PoolError> {
        let path = self.available_path(id)?;
        match fs::read(&path) {
            Ok(content) => Ok(Resource {
                id: id.clone(),
                content,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(PoolError::NotFound(id.clone())),
            Err(e) => Err(PoolError::Storage(format!(
                "read {} failed: {e}",
                path.display()
            ))),
        }
    }

    /// Moves `id` from available to issued. A second commit of the same id
    /// fails with `NotFound`.
    pub fn commit(&self, id: &ResourceId) -> Result<(), PoolError> {
        let src = self.available_path(id)?;
        if !src.is_file() {
            return Err(PoolError::NotFound(id.clone()));
        }
        let dest = self.issued_dir.join(id.as_str());
        move_file(&src, &dest).map_err(|e| {
            PoolError::Storage(format!(
                "move {} -> {} failed: {e}",
                src.display(),
                dest.display()
            ))
        })?;
        debug!(resource_id = %id, "resource committed");
        Ok(())
    }

    fn available_path(&self, id: &ResourceId) -> Result<PathBuf, PoolError> {
        let name = id.as_str();
        let valid = !name.is_empty()
            && !name.contains(['/', '\\'])
            && name != "."
            && name != ".."
            && self.has_extension(name);
        if !valid {
            return Err(PoolError::InvalidId(name.to_string()));
        }
        Ok(self.available_dir.join(name))
    }

    fn has_extension(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext == self.extension)
            .unwrap_or(false)
    }

    fn list(&self, dir: &Path) -> Result<Vec<ResourceId>, PoolError> {
        let entries = fs::read_dir(dir)
            .map_err(|e| PoolError::Storage(format!("list {} failed: {e}", dir.display())))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| PoolError::Storage(format!("list {} failed: {e}", dir.display())))?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if self.has_extension(name) {
                    ids.push(ResourceId::new(name));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// rename fails across filesystems; fall back to copy + remove.
fn move_file(src: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => copy_then_remove(src, dest, |p| fs::remove_file(p)),
    }
}

// The file must end up in exactly one partition: a failed source removal
// takes the copy back out.
fn copy_then_remove<F>(src: &Path, dest: &Path, remove: F) -> io::Result<()>
where
    F: Fn(&Path) -> io::Result<()>,
{
    fs::copy(src, dest)?;
    if let Err(e) = remove(src) {
        if let Err(cleanup) = fs::remove_file(dest) {
            warn!(dest = %dest.display(), error = %cleanup, "copied resource left in issued partition");
        }
        return Err(e);
    }
    Ok(())
}
