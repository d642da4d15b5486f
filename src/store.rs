//! Bounded on-disk store of positive detection images.
//!
//! The in-memory index is authoritative: it holds at most `capacity` entries,
//! newest first, and a file is only deleted after its entry has left the
//! index. Files are written to a temporary name and renamed into place, and
//! the index is only touched once the rename succeeded.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::Frame;
use crate::now_ms;

const FILE_PREFIX: &str = "detection_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

/// One persisted detection image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavedEntry {
    pub filename: String,
    /// Milliseconds since the Unix epoch (file mtime for recovered entries).
    pub created_at_ms: u64,
}

pub struct DetectionStore {
    dir: PathBuf,
    capacity: AtomicUsize,
    jpeg_quality: u8,
    index: RwLock<VecDeque<SavedEntry>>,
    writer: Mutex<()>,
}

impl DetectionStore {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize, jpeg_quality: u8) -> Self {
        Self {
            dir: dir.into(),
            capacity: AtomicUsize::new(capacity.max(1)),
            jpeg_quality,
            index: RwLock::new(VecDeque::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Change the capacity. Excess entries are evicted by the next insert.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Release);
    }

    /// Create the directory if needed and rebuild the index from disk.
    ///
    /// Image files are ordered by modification time, newest first, ties broken
    /// by filename (descending). Only the newest `capacity` are indexed; older
    /// files are left on disk untouched. Returns the number of indexed entries.
    pub fn initialize(&self) -> Result<usize> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create detection directory {}", self.dir.display()))?;

        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("scan detection directory {}", self.dir.display()))?
        {
            let entry = entry?;
            let Ok(filename) = entry.file_name().into_string() else {
                continue;
            };
            if !is_image_name(&filename) {
                continue;
            }
            // Files can vanish mid-scan; recovery skips whatever cannot be stat'ed.
            let metadata = match fs::metadata(entry.path()) {
                Ok(metadata) => metadata,
                Err(err) => {
                    log::warn!("skipping {} during startup scan: {}", filename, err);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
            found.push((modified, filename));
        }
        let total = found.len();
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        found.truncate(self.capacity());

        let entries: VecDeque<SavedEntry> = found
            .into_iter()
            .map(|(modified, filename)| SavedEntry {
                filename,
                created_at_ms: system_time_ms(modified),
            })
            .collect();
        let indexed = entries.len();
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = entries;

        log::info!(
            "detection store {}: indexed {} of {} image(s), capacity {}",
            self.dir.display(),
            indexed,
            total,
            self.capacity()
        );
        Ok(indexed)
    }

    /// Persist a positive frame and return the saved filename.
    pub fn insert(&self, frame: &Frame, label_hint: &str) -> Result<String> {
        self.insert_at(frame, label_hint, Local::now())
    }

    pub(crate) fn insert_at(
        &self,
        frame: &Frame,
        label_hint: &str,
        now: DateTime<Local>,
    ) -> Result<String> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let jpeg = frame.jpeg(self.jpeg_quality)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create detection directory {}", self.dir.display()))?;

        let stem = format!(
            "{}{}_{}",
            FILE_PREFIX,
            sanitize_label(label_hint),
            now.format(TIMESTAMP_FORMAT)
        );
        let filename = self.unique_name(&stem);
        let path = self.dir.join(&filename);
        let tmp = self.dir.join(format!(".{filename}.tmp"));
        if let Err(err) = fs::write(&tmp, jpeg).and_then(|_| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(anyhow!("write detection image {}: {}", path.display(), err));
        }

        let evicted = {
            let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
            index.push_front(SavedEntry {
                filename: filename.clone(),
                created_at_ms: now.timestamp_millis().max(0) as u64,
            });
            let capacity = self.capacity();
            let mut evicted = Vec::new();
            while index.len() > capacity {
                if let Some(oldest) = index.pop_back() {
                    evicted.push(oldest);
                }
            }
            evicted
        };

        log::info!("saved detection image {}", filename);
        for entry in evicted {
            self.remove_file(&entry);
        }
        Ok(filename)
    }

    /// Filenames, newest first.
    pub fn list(&self) -> Vec<String> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.filename.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|entry| entry.filename == filename)
    }

    /// On-disk path of an indexed file; `None` when the name is not indexed.
    pub fn path_for(&self, filename: &str) -> Option<PathBuf> {
        if self.contains(filename) {
            Some(self.dir.join(filename))
        } else {
            None
        }
    }

    fn unique_name(&self, stem: &str) -> String {
        let mut candidate = format!("{stem}.jpg");
        let mut suffix = 1u32;
        while self.contains(&candidate) || self.dir.join(&candidate).exists() {
            candidate = format!("{stem}_{suffix}.jpg");
            suffix += 1;
        }
        candidate
    }

    fn remove_file(&self, entry: &SavedEntry) {
        let filename = &entry.filename;
        let age_secs = now_ms().saturating_sub(entry.created_at_ms) / 1000;
        match fs::remove_file(self.dir.join(filename)) {
            Ok(()) => log::info!("evicted detection image {} (age {}s)", filename, age_secs),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::warn!("evicted detection image {} was already missing", filename)
            }
            Err(err) => log::warn!("failed to delete evicted image {}: {}", filename, err),
        }
    }
}

fn is_image_name(name: &str) -> bool {
    if name.starts_with('.') {
        return false;
    }
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".jpg") || lower.ends_with(".jpeg")
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "object".to_string()
    } else {
        cleaned
    }
}

fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::tempdir;

    fn frame() -> Frame {
        Frame::new(vec![200u8; 8 * 8 * 3], 8, 8, 1).unwrap()
    }

    fn files_on_disk(dir: &Path) -> HashSet<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect()
    }

    fn at(ms: i64) -> DateTime<Local> {
        Local.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn index_stays_bounded_and_evicts_oldest_first() -> Result<()> {
        let dir = tempdir()?;
        let store = DetectionStore::new(dir.path(), 3, 80);
        store.initialize()?;

        let mut inserted = Vec::new();
        for i in 0..7 {
            inserted.push(store.insert_at(&frame(), "with card", at(i * 10))?);
            assert!(store.len() <= 3);
        }

        let expected: Vec<String> = inserted.iter().rev().take(3).cloned().collect();
        assert_eq!(store.list(), expected);
        assert_eq!(files_on_disk(dir.path()), expected.into_iter().collect());
        Ok(())
    }

    #[test]
    fn filenames_carry_label_and_millisecond_stamp() -> Result<()> {
        let dir = tempdir()?;
        let store = DetectionStore::new(dir.path(), 5, 80);
        let name = store.insert_at(&frame(), "with card", at(123))?;
        assert!(name.starts_with("detection_with_card_"), "{name}");
        assert!(name.ends_with(".jpg"));
        let expected_stamp = at(123).format(TIMESTAMP_FORMAT).to_string();
        assert!(name.contains(&expected_stamp), "{name}");
        Ok(())
    }

    #[test]
    fn same_millisecond_inserts_get_distinct_names() -> Result<()> {
        let dir = tempdir()?;
        let store = DetectionStore::new(dir.path(), 5, 80);
        let first = store.insert_at(&frame(), "with_card", at(0))?;
        let second = store.insert_at(&frame(), "with_card", at(0))?;
        let third = store.insert_at(&frame(), "with_card", at(0))?;
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert!(second.ends_with("_1.jpg"), "{second}");
        assert!(third.ends_with("_2.jpg"), "{third}");
        assert_eq!(files_on_disk(dir.path()).len(), 3);
        Ok(())
    }

    #[test]
    fn initialize_recovers_newest_files_without_deleting_excess() -> Result<()> {
        let dir = tempdir()?;
        let capacity = 4;
        let base = SystemTime::now() - Duration::from_secs(3600);
        let mut names = Vec::new();
        for i in 0..capacity + 5 {
            let name = format!("detection_with_card_{i:02}.jpg");
            let path = dir.path().join(&name);
            fs::write(&path, b"jpeg")?;
            let file = fs::File::options().write(true).open(&path)?;
            file.set_modified(base + Duration::from_secs(i as u64 * 10))?;
            names.push(name);
        }
        fs::write(dir.path().join("notes.txt"), b"ignored")?;

        let store = DetectionStore::new(dir.path(), capacity, 80);
        assert_eq!(store.initialize()?, capacity);

        let expected: Vec<String> = names.iter().rev().take(capacity).cloned().collect();
        assert_eq!(store.list(), expected);
        assert_eq!(files_on_disk(dir.path()).len(), capacity + 6);
        Ok(())
    }

    #[test]
    fn initialize_breaks_mtime_ties_by_name() -> Result<()> {
        let dir = tempdir()?;
        let stamp = SystemTime::now() - Duration::from_secs(60);
        for name in ["b.jpg", "a.jpg", "c.jpg"] {
            let path = dir.path().join(name);
            fs::write(&path, b"jpeg")?;
            fs::File::options().write(true).open(&path)?.set_modified(stamp)?;
        }
        let store = DetectionStore::new(dir.path(), 10, 80);
        store.initialize()?;
        assert_eq!(store.list(), vec!["c.jpg", "b.jpg", "a.jpg"]);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn initialize_skips_files_that_vanish_during_scan() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("kept.jpg"), b"jpeg")?;
        // Listed by read_dir, but stat on the target fails like a file removed mid-scan.
        std::os::unix::fs::symlink(
            dir.path().join("already_gone.jpg"),
            dir.path().join("vanished.jpg"),
        )?;

        let store = DetectionStore::new(dir.path(), 10, 80);
        assert_eq!(store.initialize()?, 1);
        assert_eq!(store.list(), vec!["kept.jpg"]);
        Ok(())
    }

    #[test]
    fn initialize_creates_missing_directory() -> Result<()> {
        let dir = tempdir()?;
        let nested = dir.path().join("saved").join("detections");
        let store = DetectionStore::new(&nested, 2, 80);
        assert_eq!(store.initialize()?, 0);
        assert!(nested.is_dir());
        Ok(())
    }

    #[test]
    fn capacity_reduction_evicts_on_next_insert() -> Result<()> {
        let dir = tempdir()?;
        let store = DetectionStore::new(dir.path(), 5, 80);
        for i in 0..5 {
            store.insert_at(&frame(), "with_card", at(i))?;
        }
        store.set_capacity(2);
        let newest = store.insert_at(&frame(), "with_card", at(100))?;
        assert_eq!(store.len(), 2);
        assert_eq!(store.list()[0], newest);
        assert_eq!(files_on_disk(dir.path()).len(), 2);
        Ok(())
    }

    #[test]
    fn missing_file_during_eviction_is_tolerated() -> Result<()> {
        let dir = tempdir()?;
        let store = DetectionStore::new(dir.path(), 1, 80);
        let first = store.insert_at(&frame(), "with_card", at(0))?;
        fs::remove_file(dir.path().join(&first))?;
        let second = store.insert_at(&frame(), "with_card", at(1))?;
        assert_eq!(store.list(), vec![second]);
        Ok(())
    }

    #[test]
    fn write_failure_leaves_index_unchanged() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("saved");
        let store = DetectionStore::new(&target, 3, 80);
        store.initialize()?;
        let kept = store.insert_at(&frame(), "with_card", at(0))?;

        fs::remove_dir_all(&target)?;
        fs::write(&target, b"not a directory")?;
        assert!(store.insert_at(&frame(), "with_card", at(1)).is_err());
        assert_eq!(store.list(), vec![kept]);
        Ok(())
    }

    #[test]
    fn path_for_only_resolves_indexed_names() -> Result<()> {
        let dir = tempdir()?;
        let store = DetectionStore::new(dir.path(), 3, 80);
        let name = store.insert_at(&frame(), "with_card", at(0))?;
        assert_eq!(store.path_for(&name), Some(dir.path().join(&name)));
        assert_eq!(store.path_for("other.jpg"), None);
        Ok(())
    }

    #[test]
    fn labels_are_made_filename_safe() {
        assert_eq!(sanitize_label("with card"), "with_card");
        assert_eq!(sanitize_label("../etc"), "___etc");
        assert_eq!(sanitize_label("  "), "object");
    }
}
