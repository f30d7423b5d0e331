//! Directory-backed storage for rendered artifacts.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::ForgeError;

/// Maps artifact ids (`<uuid>.<ext>`) to files in one directory.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ForgeError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// `$TMPDIR/traitforge`.
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("traitforge")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocates a fresh id and the path an exporter should write to.
    pub fn reserve(&self, ext: &str) -> (String, PathBuf) {
        let id = format!("{}.{}", Uuid::new_v4(), ext.trim_start_matches('.'));
        let path = self.dir.join(&id);
        (id, path)
    }

    pub fn put(&self, bytes: &[u8], ext: &str) -> Result<String, ForgeError> {
        let (id, path) = self.reserve(ext);
        std::fs::write(&path, bytes)?;
        Ok(id)
    }

    /// Removes whatever was written for a reserved id that will not be
    /// published. Missing files are fine.
    pub fn discard(&self, id: &str) {
        let Ok(path) = self.path_of(id) else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(artifact = %id, "discarded partial artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(artifact = %id, error = %e, "failed to discard partial artifact"),
        }
    }

    /// Bytes and media type of a stored artifact.
    pub fn get(&self, id: &str) -> Result<(Vec<u8>, &'static str), ForgeError> {
        let path = self.path_of(id)?;
        let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ForgeError::ArtifactNotFound(id.to_string()),
            _ => ForgeError::Io(e),
        })?;
        Ok((bytes, media_type(id)))
    }

    /// Path for `id`, rejecting anything that could leave the directory.
    pub fn path_of(&self, id: &str) -> Result<PathBuf, ForgeError> {
        let invalid = id.is_empty()
            || id.contains('/')
            || id.contains('\\')
            || id.contains("..")
            || id.contains('\0');
        if invalid {
            return Err(ForgeError::ArtifactNotFound(id.to_string()));
        }
        Ok(self.dir.join(id))
    }

    /// Public URL under which `id` is served.
    pub fn url_for(public_url: &str, id: &str) -> String {
        format!("{}/rendered/{id}", public_url.trim_end_matches('/'))
    }
}

/// Media type by file extension.
pub fn media_type(id: &str) -> &'static str {
    let ext = Path::new(id)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "glb" | "vrm" => "model/gltf-binary",
        "gltf" => "model/gltf+json",
        "usdz" => "model/vnd.usdz+zip",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "gif" => "image/gif",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}
