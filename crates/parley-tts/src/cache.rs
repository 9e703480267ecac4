use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use sha2::{Digest, Sha256};

/// Everything that alters synthesis output participates in the key; two
/// sessions with different voices must never share an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub text: String,
    pub voice: String,
    pub style: String,
    pub speed_millis: u32,
    pub model: String,
}

impl ArtifactKey {
    /// Hex of a stable hash over the full key tuple; doubles as the cache
    /// file name.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.text.as_str(),
            self.voice.as_str(),
            self.style.as_str(),
            &self.speed_millis.to_string(),
            self.model.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

#[derive(Debug, Clone)]
struct ArtifactEntry {
    path: PathBuf,
    #[allow(dead_code)]
    generated_at: Instant,
}

/// Flat directory of audio files named by fingerprint, mirrored by an
/// in-memory map. No subdirectories, no index file.
#[derive(Debug)]
pub struct ArtifactCache {
    dir: PathBuf,
    entries: Mutex<HashMap<String, ArtifactEntry>>,
}

impl ArtifactCache {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cached path for a fingerprint, verifying the file still exists (the
    /// cache directory lives under /tmp and may be swept externally).
    pub fn lookup(&self, fingerprint: &str) -> Option<PathBuf> {
        let mut entries = self.entries.lock().expect("artifact cache lock poisoned");
        match entries.get(fingerprint) {
            Some(entry) if entry.path.is_file() => Some(entry.path.clone()),
            Some(_) => {
                entries.remove(fingerprint);
                None
            }
            None => {
                let path = self.artifact_path(fingerprint);
                if path.is_file() {
                    entries.insert(
                        fingerprint.to_owned(),
                        ArtifactEntry {
                            path: path.clone(),
                            generated_at: Instant::now(),
                        },
                    );
                    Some(path)
                } else {
                    None
                }
            }
        }
    }

    pub fn artifact_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.wav"))
    }

    pub fn temp_path(&self, fingerprint: &str, nonce: u64) -> PathBuf {
        self.dir.join(format!("{fingerprint}.{nonce}.tmp"))
    }

    /// Atomically move a generated temp file into its cache slot.
    pub fn commit(&self, fingerprint: &str, temp: &Path) -> std::io::Result<PathBuf> {
        let path = self.artifact_path(fingerprint);
        std::fs::rename(temp, &path)?;
        self.entries
            .lock()
            .expect("artifact cache lock poisoned")
            .insert(
                fingerprint.to_owned(),
                ArtifactEntry {
                    path: path.clone(),
                    generated_at: Instant::now(),
                },
            );
        Ok(path)
    }

    /// Drop every cached artifact (voice or speed changed).
    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("artifact cache lock poisoned");
        for entry in entries.values() {
            let _ = std::fs::remove_file(&entry.path);
        }
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("artifact cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
