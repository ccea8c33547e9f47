// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size-based file rotation with backup housekeeping.
//!
//! When the next write would push the active file past its size limit the
//! file is renamed to `<stem>-<UTC timestamp>.<ext>` and a fresh file is
//! opened in its place. Afterwards backups are optionally gzip-compressed,
//! and the oldest ones are removed once there are more than `max_backups` or
//! they are older than `max_age_days`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::{write::GzEncoder, Compression};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::RotationSettings;
use crate::proc::clock;

const MEGABYTE: u64 = 1024 * 1024;
/// Size limit used when rotation is enabled only through age or backup count.
pub const DEFAULT_MAX_SIZE_MEGABYTES: u64 = 100;
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
const GZIP_SUFFIX: &str = ".gz";

#[derive(Debug)]
pub struct RotatingWriter {
    path: PathBuf,
    settings: RotationSettings,
    max_bytes: u64,
    file: File,
    size: u64,
}

impl RotatingWriter {
    /// Opens (or creates) the active file at `path` in append mode.
    pub fn open(path: &Path, settings: &RotationSettings) -> io::Result<Self> {
        let file = open_append(path)?;
        let size = file.metadata()?.len();
        let megabytes = match settings.max_size_megabytes() {
            0 => DEFAULT_MAX_SIZE_MEGABYTES,
            mb => mb,
        };
        Ok(RotatingWriter {
            path: path.to_path_buf(),
            settings: settings.clone(),
            max_bytes: megabytes * MEGABYTE,
            file,
            size,
        })
    }

    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Writes `buf` as one unit, rotating first if it would not fit.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let len = buf.len() as u64;
        if self.size > 0 && self.size + len > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(buf)?;
        self.size += len;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    /// Moves the active file aside and starts a new one.
    pub fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let backup = backup_path(&self.path, OffsetDateTime::now_utc());
        fs::rename(&self.path, &backup)?;
        self.file = open_append(&self.path)?;
        self.size = 0;
        debug!(path = %self.path.display(), backup = %backup.display(), "rotated log file");

        if self.settings.compress {
            if let Err(e) = compress(&backup) {
                warn!(backup = %backup.display(), error = %e, "failed to compress backup");
            }
        }
        if let Err(e) = self.remove_expired_backups() {
            warn!(path = %self.path.display(), error = %e, "failed to clean up backups");
        }
        Ok(())
    }

    fn remove_expired_backups(&self) -> io::Result<()> {
        let mut backups = list_backups(&self.path)?;
        // Newest first; the timestamp in the name sorts chronologically.
        backups.sort_by(|a, b| b.cmp(a));

        let max_age = (self.settings.max_age_days > 0)
            .then(|| Duration::from_secs(self.settings.max_age_days * SECONDS_PER_DAY));
        let now = SystemTime::now();

        for (index, backup) in backups.iter().enumerate() {
            let over_count = self.settings.max_backups > 0 && index >= self.settings.max_backups;
            let too_old = max_age.is_some_and(|max_age| {
                fs::metadata(backup)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .is_some_and(|age| age > max_age)
            });
            if over_count || too_old {
                fs::remove_file(backup)?;
                debug!(backup = %backup.display(), "removed old backup");
            }
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn split_name(path: &Path) -> (String, Option<String>) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    (stem, ext)
}

/// `<dir>/<stem>-<timestamp>.<ext>` for the active file at `path`.
#[must_use]
pub fn backup_path(path: &Path, at: OffsetDateTime) -> PathBuf {
    let (stem, ext) = split_name(path);
    let name = match ext {
        Some(ext) => format!("{stem}-{}.{ext}", clock::compact_timestamp(at)),
        None => format!("{stem}-{}", clock::compact_timestamp(at)),
    };
    path.with_file_name(name)
}

/// Backups of the active file at `path`, compressed or not. Only names
/// carrying a rotation timestamp qualify, so sibling files such as
/// `events-errors.log` are never touched.
pub fn list_backups(path: &Path) -> io::Result<Vec<PathBuf>> {
    let (stem, ext) = split_name(path);
    let prefix = format!("{stem}-");
    let suffix = ext.map(|e| format!(".{e}")).unwrap_or_default();
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from("."),
    };

    let mut backups = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let base = name.strip_suffix(GZIP_SUFFIX).unwrap_or(&name);
        let is_backup = base
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(&suffix))
            .is_some_and(|stamp| clock::parse_compact_timestamp(stamp).is_some());
        if is_backup {
            backups.push(entry.path());
        }
    }
    Ok(backups)
}

/// Replaces `path` with `path.gz`.
fn compress(path: &Path) -> io::Result<PathBuf> {
    let mut target_name = path.as_os_str().to_owned();
    target_name.push(GZIP_SUFFIX);
    let target = PathBuf::from(target_name);

    let mut input = File::open(path)?;
    let output = File::create(&target)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.sync_all()?;
    fs::remove_file(path)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn settings(max_backups: usize, compress: bool) -> RotationSettings {
        RotationSettings {
            max_size: 1,
            max_age_days: 0,
            max_backups,
            compress,
        }
    }

    #[test]
    fn test_backup_name() {
        let at = OffsetDateTime::from_unix_timestamp(1_714_566_645).unwrap();
        assert_eq!(
            backup_path(Path::new("/var/log/events.log"), at),
            PathBuf::from("/var/log/events-20240501T123045.000000000Z.log")
        );
        assert_eq!(
            backup_path(Path::new("/var/log/events"), at),
            PathBuf::from("/var/log/events-20240501T123045.000000000Z")
        );
    }

    #[test]
    fn test_size_floor_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RotatingWriter::open(&dir.path().join("a.log"), &settings(0, false)).unwrap();
        assert_eq!(writer.max_bytes(), MEGABYTE);

        let backups_only = RotationSettings {
            max_backups: 2,
            ..RotationSettings::default()
        };
        let writer = RotatingWriter::open(&dir.path().join("b.log"), &backups_only).unwrap();
        assert_eq!(writer.max_bytes(), DEFAULT_MAX_SIZE_MEGABYTES * MEGABYTE);
    }

    #[test]
    fn test_rotates_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let mut writer = RotatingWriter::open(&path, &settings(0, false)).unwrap();

        let line = vec![b'x'; 700 * 1024];
        writer.write_all(&line).unwrap();
        assert!(list_backups(&path).unwrap().is_empty());

        writer.write_all(&line).unwrap();
        let backups = list_backups(&path).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::metadata(&backups[0]).unwrap().len(), line.len() as u64);
        assert_eq!(fs::metadata(&path).unwrap().len(), line.len() as u64);
    }

    #[test]
    fn test_keeps_at_most_max_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let mut writer = RotatingWriter::open(&path, &settings(2, false)).unwrap();

        for _ in 0..4 {
            writer.write_all(b"line\n").unwrap();
            writer.rotate().unwrap();
        }
        assert_eq!(list_backups(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_compressed_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let mut writer = RotatingWriter::open(&path, &settings(0, true)).unwrap();

        writer.write_all(b"{\"v\":0}\n").unwrap();
        writer.rotate().unwrap();

        let backups = list_backups(&path).unwrap();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].to_string_lossy().ends_with(".log.gz"));

        let mut contents = String::new();
        GzDecoder::new(File::open(&backups[0]).unwrap())
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "{\"v\":0}\n");
    }

    #[test]
    fn test_unrelated_files_are_not_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        fs::write(dir.path().join("other.log"), "x").unwrap();
        fs::write(dir.path().join("events.log.bak"), "x").unwrap();
        fs::write(dir.path().join("events-errors.log"), "x").unwrap();
        fs::write(dir.path().join("events-20240501T123045.log"), "x").unwrap();
        fs::write(&path, "x").unwrap();
        assert!(list_backups(&path).unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_ignores_sibling_destination_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let sibling = dir.path().join("app-errors.log");
        fs::write(&sibling, "other destination\n").unwrap();

        let mut writer = RotatingWriter::open(&path, &settings(1, false)).unwrap();
        for _ in 0..3 {
            writer.write_all(b"line\n").unwrap();
            writer.rotate().unwrap();
        }

        let backups = list_backups(&path).unwrap();
        assert_eq!(backups.len(), 1);
        assert_ne!(backups[0], sibling);
        assert_eq!(fs::read_to_string(&sibling).unwrap(), "other destination\n");
    }
}
