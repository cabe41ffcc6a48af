//! On-disk cache of compiled shader bytecode.
//!
//! Compiling HLSL is the slowest step of the first dispatch of a kernel, so
//! bytecode is kept on disk for later processes. Entries live under
//! `<dir>/<profile>/<kernel id>.cso` and start with a header that binds the
//! bytecode to the kernel it was compiled from:
//!
//! ```text
//! magic "CKSB" | format u32 | id len u16 | kernel id
//!   | binding digest [32] | bytecode len u64 | bytecode digest [32] | bytecode
//! ```
//!
//! The binding digest covers the entry point, the canonical layout description
//! and the emitted source. A load only succeeds for a definition that hashes to
//! the same binding, so bytecode is never handed to a kernel whose registers
//! differ. Entries failing any check are deleted and reported; the caller
//! recompiles and stores a fresh one.
//!
//! Default location: `$XDG_CACHE_HOME/computekit/shaders` or
//! `~/.cache/computekit/shaders`, overridden by `COMPUTEKIT_SHADER_CACHE_DIR`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use computekit_codegen::{KernelDefinition, KernelId};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

/// Entry format version. Entries written with another version are stale.
pub const FORMAT_VERSION: u32 = 2;

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "COMPUTEKIT_SHADER_CACHE_DIR";

const MAGIC: &[u8; 4] = b"CKSB";
const EXTENSION: &str = "cso";

/// Error types for bytecode cache operations.
#[derive(Debug, thiserror::Error)]
pub enum ShaderCacheError {
    /// Filesystem access failed.
    #[error("Shader cache I/O on {}: {source}", path.display())]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The entry is damaged: bad magic, truncated, or failing its digest.
    #[error("Cache entry {} corrupted: {reason}", path.display())]
    Corrupted {
        /// Removed entry.
        path: PathBuf,
        /// What failed.
        reason: String,
    },

    /// The entry is intact but was written for another format or binding.
    #[error("Cache entry {} stale: {reason}", path.display())]
    Stale {
        /// Removed entry.
        path: PathBuf,
        /// What differed.
        reason: String,
    },
}

impl ShaderCacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the entry was rejected on load.
    pub fn is_rejected_entry(&self) -> bool {
        matches!(self, Self::Corrupted { .. } | Self::Stale { .. })
    }
}

/// Result type for bytecode cache operations.
pub type ShaderCacheResult<T> = Result<T, ShaderCacheError>;

/// File-based cache of compiled shader bytecode.
#[derive(Debug)]
pub struct ShaderBytecodeCache {
    root: Option<PathBuf>,
    stored: AtomicU64,
    rejected: AtomicU64,
}

impl Default for ShaderBytecodeCache {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::disabled())
    }
}

impl ShaderBytecodeCache {
    /// Creates a cache in the default or environment-configured directory.
    pub fn new() -> ShaderCacheResult<Self> {
        Self::with_dir(Self::default_cache_dir())
    }

    /// Creates a cache rooted at `dir`, creating it if needed.
    pub fn with_dir(dir: impl Into<PathBuf>) -> ShaderCacheResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| ShaderCacheError::io(&dir, err))?;
        tracing::debug!(dir = %dir.display(), "shader bytecode cache opened");
        Ok(Self {
            root: Some(dir),
            stored: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// A cache that never stores or returns anything.
    pub fn disabled() -> Self {
        Self {
            root: None,
            stored: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Whether entries are read and written.
    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    /// Root directory, when enabled.
    pub fn cache_dir(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Path of the entry for a kernel under a profile.
    pub fn entry_path(&self, id: &KernelId, profile: &str) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(profile).join(format!("{}.{EXTENSION}", id.as_str())))
    }

    /// Load the bytecode stored for `definition` under `profile`.
    ///
    /// Returns `Ok(None)` when nothing is stored. A rejected entry is deleted
    /// before the error is returned.
    pub fn load(
        &self,
        definition: &KernelDefinition,
        profile: &str,
    ) -> ShaderCacheResult<Option<Vec<u8>>> {
        let Some(path) = self.entry_path(&definition.id, profile) else {
            return Ok(None);
        };
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ShaderCacheError::io(&path, err)),
        };

        match decode_entry(&bytes, &definition.id, &binding_digest(definition)) {
            Ok(bytecode) => {
                tracing::trace!(
                    kernel = %definition.id.short(),
                    profile,
                    len = bytecode.len(),
                    "bytecode loaded from disk"
                );
                Ok(Some(bytecode.to_vec()))
            }
            Err(rejection) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = fs::remove_file(&path) {
                    tracing::debug!(path = %path.display(), error = %err, "could not remove rejected entry");
                }
                Err(rejection.into_error(path))
            }
        }
    }

    /// Store bytecode for `definition` under `profile`.
    ///
    /// The entry is written to a temporary file and renamed into place, so a
    /// concurrent reader sees either the old entry or the complete new one.
    pub fn store(
        &self,
        definition: &KernelDefinition,
        profile: &str,
        bytecode: &[u8],
    ) -> ShaderCacheResult<()> {
        let Some(path) = self.entry_path(&definition.id, profile) else {
            return Ok(());
        };
        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).map_err(|err| ShaderCacheError::io(dir, err))?;

        let entry = encode_entry(&definition.id, &binding_digest(definition), bytecode);
        let mut file = NamedTempFile::new_in(dir).map_err(|err| ShaderCacheError::io(dir, err))?;
        file.write_all(&entry)
            .map_err(|err| ShaderCacheError::io(file.path(), err))?;
        file.persist(&path)
            .map_err(|err| ShaderCacheError::io(&path, err.error))?;

        self.stored.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(kernel = %definition.id.short(), profile, len = bytecode.len(), "bytecode stored");
        Ok(())
    }

    /// Remove every entry for a kernel, across all profiles.
    ///
    /// Returns the number of files removed.
    pub fn evict(&self, id: &KernelId) -> ShaderCacheResult<usize> {
        let mut removed = 0;
        for profile_dir in self.profile_dirs()? {
            let path = profile_dir.join(format!("{}.{EXTENSION}", id.as_str()));
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(ShaderCacheError::io(&path, err)),
            }
        }
        if removed > 0 {
            tracing::debug!(kernel = %id.short(), removed, "bytecode evicted");
        }
        Ok(removed)
    }

    /// Remove every entry.
    pub fn clear(&self) -> ShaderCacheResult<usize> {
        let mut removed = 0;
        for profile_dir in self.profile_dirs()? {
            for path in entries_in(&profile_dir)? {
                fs::remove_file(&path).map_err(|err| ShaderCacheError::io(&path, err))?;
                removed += 1;
            }
        }
        tracing::debug!(removed, "shader bytecode cache cleared");
        Ok(removed)
    }

    /// Cache statistics.
    pub fn stats(&self) -> ShaderCacheResult<ShaderCacheStats> {
        let mut stats = ShaderCacheStats {
            cache_dir: self.root.clone(),
            stored: self.stored.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            ..ShaderCacheStats::default()
        };
        for profile_dir in self.profile_dirs()? {
            let entries = entries_in(&profile_dir)?;
            if entries.is_empty() {
                continue;
            }
            for path in &entries {
                let metadata = fs::metadata(path).map_err(|err| ShaderCacheError::io(path, err))?;
                stats.bytes += metadata.len();
            }
            stats.entries += entries.len();
            if let Some(name) = profile_dir.file_name() {
                stats.profiles.push(name.to_string_lossy().into_owned());
            }
        }
        stats.profiles.sort();
        Ok(stats)
    }

    fn profile_dirs(&self) -> ShaderCacheResult<Vec<PathBuf>> {
        let Some(root) = &self.root else {
            return Ok(Vec::new());
        };
        let read = match fs::read_dir(root) {
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ShaderCacheError::io(root, err)),
        };
        let mut dirs = Vec::new();
        for entry in read {
            let entry = entry.map_err(|err| ShaderCacheError::io(root, err))?;
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    /// Directory used when no explicit one is configured.
    pub fn default_cache_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV) {
            return PathBuf::from(dir);
        }
        let base = std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
            .or_else(|| std::env::var_os("LOCALAPPDATA").map(PathBuf::from))
            .unwrap_or_else(std::env::temp_dir);
        base.join("computekit").join("shaders")
    }
}

fn entries_in(dir: &Path) -> ShaderCacheResult<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| ShaderCacheError::io(dir, err))? {
        let path = entry.map_err(|err| ShaderCacheError::io(dir, err))?.path();
        if path.extension().is_some_and(|ext| ext == EXTENSION) {
            entries.push(path);
        }
    }
    Ok(entries)
}

/// Shader bytecode cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderCacheStats {
    /// Entries on disk.
    pub entries: usize,
    /// Total size of all entries.
    pub bytes: u64,
    /// Profiles with at least one entry, sorted.
    pub profiles: Vec<String>,
    /// Entries written by this cache.
    pub stored: u64,
    /// Entries rejected and deleted on load.
    pub rejected: u64,
    /// Root directory, when enabled.
    pub cache_dir: Option<PathBuf>,
}

/// Digest binding bytecode to the definition it was compiled from.
fn binding_digest(definition: &KernelDefinition) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(definition.entry_point.as_bytes());
    hasher.update([0]);
    hasher.update(definition.layout.describe().as_bytes());
    hasher.update([0]);
    hasher.update(definition.source.as_bytes());
    hasher.finalize().into()
}

fn encode_entry(id: &KernelId, binding: &[u8; 32], bytecode: &[u8]) -> Vec<u8> {
    let id = id.as_str().as_bytes();
    let id_len = u16::try_from(id.len()).unwrap_or(u16::MAX);
    let digest: [u8; 32] = Sha256::digest(bytecode).into();

    let mut entry = Vec::with_capacity(4 + 4 + 2 + id.len() + 32 + 8 + 32 + bytecode.len());
    entry.extend_from_slice(MAGIC);
    entry.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    entry.extend_from_slice(&id_len.to_le_bytes());
    entry.extend_from_slice(&id[..usize::from(id_len)]);
    entry.extend_from_slice(binding);
    entry.extend_from_slice(&(bytecode.len() as u64).to_le_bytes());
    entry.extend_from_slice(&digest);
    entry.extend_from_slice(bytecode);
    entry
}

enum Rejection {
    Corrupted(String),
    Stale(String),
}

impl Rejection {
    fn into_error(self, path: PathBuf) -> ShaderCacheError {
        match self {
            Self::Corrupted(reason) => ShaderCacheError::Corrupted { path, reason },
            Self::Stale(reason) => ShaderCacheError::Stale { path, reason },
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], Rejection> {
        if self.bytes.len() < n {
            return Err(Rejection::Corrupted(format!("truncated {what}")));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], Rejection> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }
}

fn decode_entry<'a>(
    bytes: &'a [u8],
    id: &KernelId,
    binding: &[u8; 32],
) -> Result<&'a [u8], Rejection> {
    let mut reader = Reader { bytes };

    if reader.array::<4>("magic")? != *MAGIC {
        return Err(Rejection::Corrupted("bad magic".to_string()));
    }
    let version = u32::from_le_bytes(reader.array("format version")?);
    if version != FORMAT_VERSION {
        return Err(Rejection::Stale(format!(
            "format version {version}, expected {FORMAT_VERSION}"
        )));
    }
    let id_len = u16::from_le_bytes(reader.array("kernel id length")?);
    let stored_id = reader.take(usize::from(id_len), "kernel id")?;
    if stored_id != id.as_str().as_bytes() {
        return Err(Rejection::Corrupted(format!(
            "header names kernel {}",
            String::from_utf8_lossy(stored_id)
        )));
    }
    if reader.array::<32>("binding digest")? != *binding {
        return Err(Rejection::Stale(
            "entry point, layout or source differ from the stored binding".to_string(),
        ));
    }
    let len = u64::from_le_bytes(reader.array("bytecode length")?);
    let digest = reader.array::<32>("bytecode digest")?;
    if len == 0 || reader.bytes.len() as u64 != len {
        return Err(Rejection::Corrupted(format!(
            "bytecode is {} bytes, header says {len}",
            reader.bytes.len()
        )));
    }
    let actual: [u8; 32] = Sha256::digest(reader.bytes).into();
    if actual != digest {
        return Err(Rejection::Corrupted("bytecode digest mismatch".to_string()));
    }
    Ok(reader.bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use computekit_codegen::{
        compile_kernel, CapturedMember, KernelSource, ResourceHandle, ShaderType,
    };
    use tempfile::TempDir;

    struct Host;

    fn definition(body: &str) -> KernelDefinition {
        let source = KernelSource::parse("fill", body)
            .unwrap()
            .with_capture(CapturedMember::static_field::<Host, _>(
                "out",
                ShaderType::read_write_buffer(ShaderType::UINT),
                || ResourceHandle(3).into(),
            ));
        compile_kernel(&source).unwrap()
    }

    fn fill() -> KernelDefinition {
        definition("|id| { out[id.x] = id.x; }")
    }

    fn open() -> (TempDir, ShaderBytecodeCache) {
        let dir = TempDir::new().unwrap();
        let cache = ShaderBytecodeCache::with_dir(dir.path()).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_store_and_load() {
        let (_dir, cache) = open();
        let kernel = fill();
        assert!(cache.load(&kernel, "cs_6_0").unwrap().is_none());

        cache.store(&kernel, "cs_6_0", b"DXBC-bytecode").unwrap();
        assert_eq!(
            cache.load(&kernel, "cs_6_0").unwrap().as_deref(),
            Some(&b"DXBC-bytecode"[..])
        );

        let path = cache.entry_path(&kernel.id, "cs_6_0").unwrap();
        assert!(path.ends_with(format!("cs_6_0/{}.cso", kernel.id)));
        let raw = fs::read(&path).unwrap();
        assert_eq!(&raw[..4], MAGIC);
    }

    #[test]
    fn test_profiles_are_separate() {
        let (_dir, cache) = open();
        let kernel = fill();
        cache.store(&kernel, "cs_6_0", b"six").unwrap();
        assert!(cache.load(&kernel, "cs_5_1").unwrap().is_none());

        cache.store(&kernel, "cs_5_1", b"five").unwrap();
        assert_eq!(cache.load(&kernel, "cs_6_0").unwrap().unwrap(), b"six");
        assert_eq!(cache.load(&kernel, "cs_5_1").unwrap().unwrap(), b"five");
        assert_eq!(cache.stats().unwrap().profiles, vec!["cs_5_1", "cs_6_0"]);
    }

    #[test]
    fn test_truncated_entry_rejected_and_removed() {
        let (_dir, cache) = open();
        let kernel = fill();
        cache.store(&kernel, "cs_6_0", b"DXBC-bytecode").unwrap();
        let path = cache.entry_path(&kernel.id, "cs_6_0").unwrap();
        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() - 3]).unwrap();

        let err = cache.load(&kernel, "cs_6_0").unwrap_err();
        assert!(matches!(err, ShaderCacheError::Corrupted { .. }), "{err}");
        assert!(!path.exists());
        assert!(cache.load(&kernel, "cs_6_0").unwrap().is_none());
        assert_eq!(cache.stats().unwrap().rejected, 1);
    }

    #[test]
    fn test_flipped_bytecode_fails_digest() {
        let (_dir, cache) = open();
        let kernel = fill();
        cache.store(&kernel, "cs_6_0", b"DXBC-bytecode").unwrap();
        let path = cache.entry_path(&kernel.id, "cs_6_0").unwrap();
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, &raw).unwrap();

        match cache.load(&kernel, "cs_6_0").unwrap_err() {
            ShaderCacheError::Corrupted { reason, .. } => assert!(reason.contains("digest")),
            other => panic!("expected corruption, got {other}"),
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_changed_binding_is_stale() {
        let (_dir, cache) = open();
        let kernel = fill();
        cache.store(&kernel, "cs_6_0", b"DXBC-bytecode").unwrap();

        // Same id, different entry point: the stored bytecode exports another symbol.
        let mut renamed = kernel.clone();
        renamed.entry_point = "Main".to_string();
        let err = cache.load(&renamed, "cs_6_0").unwrap_err();
        assert!(matches!(err, ShaderCacheError::Stale { .. }), "{err}");
        assert!(err.is_rejected_entry());
        assert!(cache.load(&kernel, "cs_6_0").unwrap().is_none());
    }

    #[test]
    fn test_old_format_version_is_stale() {
        let (_dir, cache) = open();
        let kernel = fill();
        cache.store(&kernel, "cs_6_0", b"DXBC-bytecode").unwrap();
        let path = cache.entry_path(&kernel.id, "cs_6_0").unwrap();
        let mut raw = fs::read(&path).unwrap();
        raw[4..8].copy_from_slice(&1u32.to_le_bytes());
        fs::write(&path, &raw).unwrap();

        match cache.load(&kernel, "cs_6_0").unwrap_err() {
            ShaderCacheError::Stale { reason, .. } => assert!(reason.contains("version 1")),
            other => panic!("expected stale, got {other}"),
        }
    }

    #[test]
    fn test_entry_for_other_kernel_rejected() {
        let (_dir, cache) = open();
        let a = fill();
        let b = definition("|id| { out[id.x] = 0u; }");
        cache.store(&b, "cs_6_0", b"other").unwrap();
        let from = cache.entry_path(&b.id, "cs_6_0").unwrap();
        let to = cache.entry_path(&a.id, "cs_6_0").unwrap();
        fs::rename(from, &to).unwrap();

        let err = cache.load(&a, "cs_6_0").unwrap_err();
        assert!(matches!(err, ShaderCacheError::Corrupted { .. }), "{err}");
        assert!(!to.exists());
    }

    #[test]
    fn test_evict_removes_all_profiles() {
        let (_dir, cache) = open();
        let kernel = fill();
        let other = definition("|id| { out[id.x] = 7u; }");
        cache.store(&kernel, "cs_6_0", b"a").unwrap();
        cache.store(&kernel, "cs_5_1", b"b").unwrap();
        cache.store(&other, "cs_6_0", b"c").unwrap();

        assert_eq!(cache.evict(&kernel.id).unwrap(), 2);
        assert_eq!(cache.evict(&kernel.id).unwrap(), 0);
        assert!(cache.load(&kernel, "cs_6_0").unwrap().is_none());
        assert_eq!(cache.load(&other, "cs_6_0").unwrap().unwrap(), b"c");
    }

    #[test]
    fn test_stats_and_clear() {
        let (dir, cache) = open();
        cache.store(&fill(), "cs_6_0", b"12345").unwrap();
        cache
            .store(&definition("|id| { out[id.x] = 2u; }"), "cs_6_0", b"678")
            .unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.stored, 2);
        assert!(stats.bytes > 8);
        assert_eq!(stats.cache_dir.as_deref(), Some(dir.path()));

        assert_eq!(cache.clear().unwrap(), 2);
        assert_eq!(cache.stats().unwrap().entries, 0);
    }

    #[test]
    fn test_disabled_cache() {
        let cache = ShaderBytecodeCache::disabled();
        let kernel = fill();
        assert!(!cache.is_enabled());
        assert!(cache.cache_dir().is_none());
        cache.store(&kernel, "cs_6_0", b"ignored").unwrap();
        assert!(cache.load(&kernel, "cs_6_0").unwrap().is_none());
        assert_eq!(cache.evict(&kernel.id).unwrap(), 0);
        assert_eq!(cache.stats().unwrap(), ShaderCacheStats::default());
    }

    #[test]
    fn test_creates_nested_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let cache = ShaderBytecodeCache::with_dir(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(cache.cache_dir(), Some(nested.as_path()));
    }
}
