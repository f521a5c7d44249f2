//! Directory packing
//!
//! A directory is sent as a single tar archive whose entries live under the
//! directory's own name, so unpacking it recreates the directory.

use std::path::Path;

use crate::tftp::error::ResolveError;

use super::Payload;

/// Archive the directory at `dir_path` with entries rooted at `base_name`
pub fn pack_directory(dir_path: &Path, base_name: &Path) -> Result<Payload, ResolveError> {
    if !dir_path.exists() {
        return Err(ResolveError::ResourceNotFound(dir_path.to_path_buf()));
    }
    if !dir_path.is_dir() {
        return Err(ResolveError::NotADirectory(dir_path.to_path_buf()));
    }

    let io_err = |source| ResolveError::Io {
        path: dir_path.to_path_buf(),
        source,
    };

    let mut builder = tar::Builder::new(Vec::new());
    // Links are stored as links so nothing outside the tree is read
    builder.follow_symlinks(false);
    builder.append_dir_all(base_name, dir_path).map_err(io_err)?;
    let data = builder.into_inner().map_err(io_err)?;

    log::debug!("Packed {} into {} bytes", dir_path.display(), data.len());
    Ok(Payload::new(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Read;
    use tempfile::tempdir;

    fn unpack(data: &[u8]) -> BTreeMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(data);
        let mut files = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.header().entry_type().is_file() {
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                files.insert(path, content);
            }
        }
        files
    }

    #[test]
    fn test_pack_preserves_relative_paths() {
        let temp = tempdir().unwrap();
        let photos = temp.path().join("photos");
        std::fs::create_dir_all(photos.join("2024/summer")).unwrap();
        std::fs::write(photos.join("cover.jpg"), b"jpeg bytes").unwrap();
        std::fs::write(photos.join("2024/summer/beach.png"), b"png bytes").unwrap();

        let payload = pack_directory(&photos, Path::new("photos")).unwrap();
        assert_eq!(payload.size, payload.data.len() as u64);

        let files = unpack(&payload.data);
        assert_eq!(files.get("photos/cover.jpg").unwrap(), b"jpeg bytes");
        assert_eq!(files.get("photos/2024/summer/beach.png").unwrap(), b"png bytes");
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_pack_empty_directory() {
        let temp = tempdir().unwrap();
        let empty = temp.path().join("empty");
        std::fs::create_dir(&empty).unwrap();

        let payload = pack_directory(&empty, Path::new("empty")).unwrap();
        assert!(!payload.data.is_empty());
        assert!(unpack(&payload.data).is_empty());
    }

    #[test]
    fn test_pack_missing_or_not_a_directory() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("missing");
        assert!(matches!(
            pack_directory(&missing, Path::new("missing")),
            Err(ResolveError::ResourceNotFound(_))
        ));

        let file = temp.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            pack_directory(&file, Path::new("file.txt")),
            Err(ResolveError::NotADirectory(_))
        ));
    }
}
