use std::path::{Component, Path, PathBuf};

use crate::tftp::error::ResolveError;

use super::Payload;
use super::packer::pack_directory;

/// Names starting with this prefix designate a directory to archive
pub const DIR_PREFIX: &str = "dir:";

/// Resolves requested names to payloads under a root directory
#[derive(Debug, Clone)]
pub struct Storage {
    root_dir: PathBuf,
}

impl Storage {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Create the root directory if it does not exist yet
    pub fn ensure_root(&self) -> anyhow::Result<()> {
        if !self.root_dir.exists() {
            std::fs::create_dir_all(&self.root_dir).map_err(|e| {
                log::error!("Could not create root directory {}: {}", self.root_dir.display(), e);
                anyhow::anyhow!("Could not create root directory {}: {}", self.root_dir.display(), e)
            })?;
        }
        if !self.root_dir.is_dir() {
            anyhow::bail!("Root path is not a directory: {}", self.root_dir.display());
        }
        Ok(())
    }

    /// Load the payload for a requested name
    ///
    /// `dir:<name>` packs the directory `<name>`; anything else reads a file.
    pub fn load(&self, name: &str) -> Result<Payload, ResolveError> {
        match name.strip_prefix(DIR_PREFIX) {
            Some(dir_name) => {
                let dir_path = self.resolve(dir_name)?;
                // `dir:`, `dir:.` and `dir:./` would archive the whole root
                let Some(base_name) = Path::new(dir_name).file_name() else {
                    return Err(ResolveError::RootArchive(name.to_string()));
                };
                pack_directory(&dir_path, Path::new(base_name))
            }
            None => self.load_file(name),
        }
    }

    fn load_file(&self, name: &str) -> Result<Payload, ResolveError> {
        let path = self.resolve(name)?;
        if !path.is_file() {
            return Err(ResolveError::NotAFile(path));
        }
        let data = std::fs::read(&path).map_err(|source| ResolveError::Io { path, source })?;
        Ok(Payload::new(data))
    }

    /// Map a requested name to a path that stays inside the root directory
    fn resolve(&self, name: &str) -> Result<PathBuf, ResolveError> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ResolveError::PathTraversal(name.to_string()));
        }

        let path = self.root_dir.join(relative);
        if !path.exists() {
            return Err(ResolveError::ResourceNotFound(path));
        }

        // Symlinks may still point outside the root
        let root = self.root_dir.canonicalize().map_err(|source| ResolveError::Io {
            path: self.root_dir.clone(),
            source,
        })?;
        let canonical = path
            .canonicalize()
            .map_err(|source| ResolveError::Io { path: path.clone(), source })?;
        if !canonical.starts_with(&root) {
            return Err(ResolveError::PathTraversal(name.to_string()));
        }

        Ok(canonical)
    }
}
