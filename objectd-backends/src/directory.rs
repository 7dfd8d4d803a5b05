//! A mount-rooted directory tier. `storage_path` mirrors the URI it was
//! created from (minus the leading slash), which is what lets
//! [`enumerate`](Tier::enumerate) at startup hand the manager a
//! `relative_path` it can turn straight back into the original URI
//! (`objectd::manager::TierManager::scan` does exactly that) without a
//! second, separately-maintained mapping.

use objectd::{
    config::TierConfig,
    index::TierId,
    tier::{OpenMode, PlacementRoles, Policy, ScanEntry, Tier, TierError},
};
use scc::HashMap as SccHashMap;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

pub struct DirectoryTier {
    id: TierId,
    name: String,
    mount_root: PathBuf,
    capacity_bytes: u64,
    used_bytes: AtomicU64,
    object_count: AtomicU64,
    policy: Policy,
    placement_roles: PlacementRoles,
    weight: u32,
    aux_index: SccHashMap<String, (PathBuf, u64, i64)>,
}

impl DirectoryTier {
    /// Creates the mount root if missing and walks it once to seed
    /// capacity accounting and the tier's auxiliary URI index (see
    /// `Tier::aux_lookup`). A second scan after construction is not
    /// supported — same one-shot contract as the manager's own startup
    /// scan.
    pub fn new(config: TierConfig) -> io::Result<Arc<Self>> {
        fs::create_dir_all(&config.mount_root)?;
        let placement_roles = config.placement_roles();
        let tier = Self {
            id: config.id,
            name: config.name,
            mount_root: config.mount_root,
            capacity_bytes: config.capacity_bytes,
            used_bytes: AtomicU64::new(0),
            object_count: AtomicU64::new(0),
            policy: config.policy.into(),
            placement_roles,
            weight: config.weight,
            aux_index: SccHashMap::new(),
        };
        tier.rebuild_aux_index()?;
        Ok(Arc::new(tier))
    }

    fn rebuild_aux_index(&self) -> io::Result<()> {
        let mut used = 0u64;
        let mut count = 0u64;
        let root = self.mount_root.clone();
        walk(&root, &root, &mut |relative, meta| {
            let uri = relative_path_to_uri(relative);
            let size = meta.len();
            let mtime = mtime_unix(meta);
            used += size;
            count += 1;
            let _ = self
                .aux_index
                .insert(uri, (relative.to_path_buf(), size, mtime));
        })?;
        self.used_bytes.store(used, Ordering::Relaxed);
        self.object_count.store(count, Ordering::Relaxed);
        tracing::debug!(tier = self.id, objects = count, used, "directory tier scanned");
        Ok(())
    }
}

impl Tier for DirectoryTier {
    fn id(&self) -> TierId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    fn policy(&self) -> Policy {
        self.policy
    }

    fn placement_roles(&self) -> PlacementRoles {
        self.placement_roles
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn create(&self, uri: &str, hint_bytes: u64) -> objectd::tier::Result<(PathBuf, File)> {
        if self.used_bytes.load(Ordering::Relaxed) + hint_bytes > self.capacity_bytes {
            return Err(TierError::NoSpace(self.id));
        }
        let relative = uri_to_relative_path(uri)
            .ok_or_else(|| TierError::NotFound(PathBuf::from(uri)))?;
        let full = self.mount_root.join(&relative);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)?;

        self.used_bytes.fetch_add(hint_bytes, Ordering::Relaxed);
        self.object_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(tier = self.id, uri, "created object");
        Ok((relative, file))
    }

    fn open(&self, storage_path: &Path, mode: OpenMode) -> objectd::tier::Result<File> {
        let full = self.mount_root.join(storage_path);
        let opened = match mode {
            OpenMode::Read => OpenOptions::new().read(true).open(&full),
            OpenMode::Write => OpenOptions::new().read(true).write(true).open(&full),
        };
        opened.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                TierError::NotFound(full.clone())
            } else {
                TierError::Io(e)
            }
        })
    }

    fn delete(&self, storage_path: &Path, recorded_size: u64) -> objectd::tier::Result<()> {
        let full = self.mount_root.join(storage_path);
        fs::remove_file(&full)?;
        saturating_sub(&self.used_bytes, recorded_size);
        saturating_sub(&self.object_count, 1);
        tracing::debug!(tier = self.id, path = %storage_path.display(), "deleted object");
        Ok(())
    }

    fn enumerate(&self, visit: &mut dyn FnMut(ScanEntry)) -> objectd::tier::Result<()> {
        let root = self.mount_root.clone();
        walk(&root, &root, &mut |relative, meta| {
            visit(ScanEntry {
                relative_path: relative.to_path_buf(),
                size: meta.len(),
                mtime: mtime_unix(meta),
            });
        })
        .map_err(TierError::Io)
    }

    fn status(&self) -> objectd::tier::TierStatus {
        objectd::tier::TierStatus {
            capacity_bytes: self.capacity_bytes,
            used_bytes: self.used_bytes.load(Ordering::Relaxed),
            object_count: self.object_count.load(Ordering::Relaxed),
        }
    }

    fn aux_lookup(&self, uri: &str) -> Option<(PathBuf, u64, i64)> {
        self.aux_index.read(uri, |_, v| v.clone())
    }
}

fn saturating_sub(atomic: &AtomicU64, delta: u64) {
    let mut current = atomic.load(Ordering::Relaxed);
    loop {
        let new = current.saturating_sub(delta);
        match atomic.compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

/// `/tmp/x.dat` -> `tmp/x.dat`, rejecting `..` components so a crafted
/// URI can't escape the mount root.
fn uri_to_relative_path(uri: &str) -> Option<PathBuf> {
    let trimmed = uri.strip_prefix('/').unwrap_or(uri);
    let mut out = PathBuf::new();
    for part in trimmed.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Inverse of [`uri_to_relative_path`]: `tmp/x.dat` -> `/tmp/x.dat`.
fn relative_path_to_uri(relative: &Path) -> String {
    let mut uri = String::from("/");
    let mut first = true;
    for component in relative.components() {
        if let Component::Normal(part) = component {
            if !first {
                uri.push('/');
            }
            uri.push_str(&part.to_string_lossy());
            first = false;
        }
    }
    uri
}

fn mtime_unix(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn walk(root: &Path, dir: &Path, visit: &mut dyn FnMut(&Path, &fs::Metadata)) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let path = entry.path();
        if meta.is_dir() {
            walk(root, &path, visit)?;
        } else if meta.is_file() {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            visit(relative, &meta);
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use objectd::config::TierPolicyConfig;
    use tempfile::tempdir;

    fn config(dir: &Path, id: u16) -> TierConfig {
        TierConfig {
            id,
            name: "test".into(),
            mount_root: dir.to_path_buf(),
            capacity_bytes: 1024,
            policy: TierPolicyConfig::Persistent,
            roles: vec!["default-target".into()],
            weight: id as u32,
        }
    }

    #[test]
    fn create_open_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let tier = DirectoryTier::new(config(dir.path(), 0)).unwrap();

        let (rel, mut file) = tier.create("/tmp/x.dat", 5).unwrap();
        use std::io::Write;
        file.write_all(b"hello").unwrap();
        drop(file);

        let mut reopened = tier.open(&rel, OpenMode::Read).unwrap();
        let mut buf = Vec::new();
        use std::io::Read;
        reopened.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");

        tier.delete(&rel, 5).unwrap();
        assert!(matches!(
            tier.open(&rel, OpenMode::Read).unwrap_err(),
            TierError::NotFound(_)
        ));
    }

    #[test]
    fn create_refuses_once_capacity_exhausted() {
        let dir = tempdir().unwrap();
        let tier = DirectoryTier::new(config(dir.path(), 0)).unwrap();
        tier.create("/a", 1024).unwrap();
        assert!(matches!(
            tier.create("/b", 1).unwrap_err(),
            TierError::NoSpace(0)
        ));
    }

    #[test]
    fn create_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let tier = DirectoryTier::new(config(dir.path(), 0)).unwrap();
        assert!(tier.create("/../escape", 1).is_err());
    }

    #[test]
    fn enumerate_recovers_same_relative_path_used_at_create() {
        let dir = tempdir().unwrap();
        let tier = DirectoryTier::new(config(dir.path(), 0)).unwrap();
        let (rel, _file) = tier.create("/a/b/c.bin", 3).unwrap();

        let mut found = Vec::new();
        tier.enumerate(&mut |entry| found.push(entry.relative_path)).unwrap();
        assert_eq!(found, vec![rel]);
    }

    #[test]
    fn scan_on_construction_populates_aux_index() {
        let dir = tempdir().unwrap();
        {
            let tier = DirectoryTier::new(config(dir.path(), 0)).unwrap();
            tier.create("/pre/existing.dat", 4).unwrap();
        }

        let tier = DirectoryTier::new(config(dir.path(), 1)).unwrap();
        let (path, size, _mtime) = tier.aux_lookup("/pre/existing.dat").unwrap();
        assert_eq!(path, PathBuf::from("pre/existing.dat"));
        assert_eq!(size, 4);
        assert_eq!(tier.status().object_count, 1);
    }
}
