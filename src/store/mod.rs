//! The on-disk model store.
//!
//! Content-addressed blobs under `blobs/` (`sha256-<hex>` filenames) and
//! JSON manifests under `manifests/<host>/<namespace>/<model>/<tag>`.
//! Blobs are immutable: writes of an existing digest are no-ops, and the
//! core references GGUF model blobs by digest only.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("blob {0} not found")]
    BlobNotFound(String),

    #[error("blob {digest} is corrupt: content hashes to {actual}")]
    DigestMismatch { digest: String, actual: String },

    #[error("malformed digest {0:?}")]
    BadDigest(String),

    #[error("manifest not found for {0}")]
    ManifestNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One layer reference in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// A model manifest: config plus content layers. The GGUF weights layer is
/// found by media type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Layer,
    pub layers: Vec<Layer>,
}

impl Manifest {
    /// The model-weights layer, if present.
    pub fn model_layer(&self) -> Option<&Layer> {
        self.layers
            .iter()
            .find(|l| l.media_type.ends_with("model") || l.media_type.contains("gguf"))
    }
}

/// Handle on a store root (`$OLLAMA_MODELS`).
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Compute the digest string for a byte slice.
    pub fn digest(data: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(data)))
    }

    /// Filesystem path of a blob. Digests use `sha256:<hex>` notation;
    /// filenames swap the colon for a dash.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf, StoreError> {
        let hex_part = digest
            .strip_prefix("sha256:")
            .or_else(|| digest.strip_prefix("sha256-"))
            .ok_or_else(|| StoreError::BadDigest(digest.to_string()))?;
        if hex_part.len() != 64 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StoreError::BadDigest(digest.to_string()));
        }
        Ok(self.root.join("blobs").join(format!("sha256-{hex_part}")))
    }

    pub fn manifest_path(&self, host: &str, namespace: &str, model: &str, tag: &str) -> PathBuf {
        self.root
            .join("manifests")
            .join(host)
            .join(namespace)
            .join(model)
            .join(tag)
    }

    /// Store a blob, returning its digest. Existing blobs are immutable
    /// and left untouched.
    pub fn write_blob(&self, data: &[u8]) -> Result<String, StoreError> {
        let digest = Self::digest(data);
        let path = self.blob_path(&digest)?;
        if path.exists() {
            debug!(digest, "blob already present");
            return Ok(digest);
        }
        fs::create_dir_all(path.parent().expect("blobs dir"))?;
        // Write-then-rename so a crashed write never leaves a partial blob
        // under its final name.
        let tmp = path.with_extension("partial");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        debug!(digest, bytes = data.len(), "wrote blob");
        Ok(digest)
    }

    /// Open a blob for reading.
    pub fn open_blob(&self, digest: &str) -> Result<fs::File, StoreError> {
        let path = self.blob_path(digest)?;
        fs::File::open(&path).map_err(|_| StoreError::BlobNotFound(digest.to_string()))
    }

    /// Re-hash a blob and compare against its name.
    pub fn verify_blob(&self, digest: &str) -> Result<(), StoreError> {
        let mut file = self.open_blob(digest)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        let expected = digest.replace("sha256-", "sha256:");
        if actual != expected {
            return Err(StoreError::DigestMismatch {
                digest: digest.to_string(),
                actual,
            });
        }
        Ok(())
    }

    pub fn read_manifest(
        &self,
        host: &str,
        namespace: &str,
        model: &str,
        tag: &str,
    ) -> Result<Manifest, StoreError> {
        let path = self.manifest_path(host, namespace, model, tag);
        let name = format!("{host}/{namespace}/{model}:{tag}");
        let data = fs::read_to_string(&path).map_err(|_| StoreError::ManifestNotFound(name))?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn write_manifest(
        &self,
        host: &str,
        namespace: &str,
        model: &str,
        tag: &str,
        manifest: &Manifest,
    ) -> Result<(), StoreError> {
        let path = self.manifest_path(host, namespace, model, tag);
        fs::create_dir_all(path.parent().expect("manifest dir"))?;
        fs::write(&path, serde_json::to_vec_pretty(manifest)?)?;
        Ok(())
    }

    /// Resolve a manifest's model layer to a blob path.
    pub fn resolve_model(
        &self,
        host: &str,
        namespace: &str,
        model: &str,
        tag: &str,
    ) -> Result<PathBuf, StoreError> {
        let manifest = self.read_manifest(host, namespace, model, tag)?;
        let layer = manifest
            .model_layer()
            .ok_or_else(|| StoreError::ManifestNotFound(format!("{model}:{tag} model layer")))?;
        let path = self.blob_path(&layer.digest)?;
        if !path.exists() {
            return Err(StoreError::BlobNotFound(layer.digest.clone()));
        }
        Ok(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_blob_roundtrip_and_immutability() {
        let (_dir, store) = store();
        let digest = store.write_blob(b"weights").unwrap();
        assert!(digest.starts_with("sha256:"));

        // Second write is a no-op.
        let again = store.write_blob(b"weights").unwrap();
        assert_eq!(digest, again);

        let mut data = String::new();
        store.open_blob(&digest).unwrap().read_to_string(&mut data).unwrap();
        assert_eq!(data, "weights");
        store.verify_blob(&digest).unwrap();
    }

    #[test]
    fn test_blob_path_shape() {
        let (_dir, store) = store();
        let digest = BlobStore::digest(b"x");
        let path = store.blob_path(&digest).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("sha256-"));
        assert_eq!(name.len(), "sha256-".len() + 64);
    }

    #[test]
    fn test_bad_digest_rejected() {
        let (_dir, store) = store();
        assert!(matches!(
            store.blob_path("md5:abcd"),
            Err(StoreError::BadDigest(_))
        ));
        assert!(matches!(
            store.blob_path("sha256:zzzz"),
            Err(StoreError::BadDigest(_))
        ));
    }

    #[test]
    fn test_manifest_resolution() {
        let (_dir, store) = store();
        let digest = store.write_blob(b"gguf bytes").unwrap();
        let manifest = Manifest {
            schema_version: 2,
            media_type: "application/vnd.docker.distribution.manifest.v2+json".to_string(),
            config: Layer {
                media_type: "application/vnd.docker.container.image.v1+json".to_string(),
                digest: digest.clone(),
                size: 9,
            },
            layers: vec![Layer {
                media_type: "application/vnd.ollama.image.model".to_string(),
                digest: digest.clone(),
                size: 9,
            }],
        };
        store
            .write_manifest("registry.local", "library", "tiny", "latest", &manifest)
            .unwrap();

        let path = store
            .resolve_model("registry.local", "library", "tiny", "latest")
            .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_corrupt_blob_detected() {
        let (_dir, store) = store();
        let digest = store.write_blob(b"good").unwrap();
        let path = store.blob_path(&digest).unwrap();
        std::fs::write(&path, b"evil").unwrap();
        assert!(matches!(
            store.verify_blob(&digest),
            Err(StoreError::DigestMismatch { .. })
        ));
    }
}
