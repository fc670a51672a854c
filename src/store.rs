// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Versioned JSON state files with atomic whole-file replacement.
//!
//! Readers never lock: every write lands in a temp file in the same
//! directory and is renamed over the original, so a reader sees either the
//! old document or the new one. Writers serialize their read-modify-write
//! through a short-lived `<file>.lock` guard created with `create_new`.

use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::telemetry::TimedOperation;

/// Current on-disk format version.
pub const STORE_VERSION: u32 = 1;

/// Age after which an abandoned mutation guard is broken.
pub const GUARD_STALE_AFTER: Duration = Duration::from_secs(30);

/// How long a writer waits for the mutation guard before giving up.
const GUARD_TIMEOUT: Duration = Duration::from_secs(10);

const BACKOFF_START: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_millis(200);

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    #[serde(flatten)]
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u32,
    #[serde(flatten)]
    data: T,
}

/// A JSON document of type `T` stored at one path.
#[derive(Debug)]
pub struct JsonStore<T> {
    path: PathBuf,
    operation: &'static str,
    _document: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonStore<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            operation: self.operation,
            _document: PhantomData,
        }
    }
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Store at `path`; `operation` names the write timing metric.
    pub fn new(path: impl Into<PathBuf>, operation: &'static str) -> Self {
        Self {
            path: path.into(),
            operation,
            _document: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Read the current document; a missing file is an empty document.
    pub fn load(&self) -> Result<T, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Err(StoreError::Corrupted(format!("{} is empty", self.path.display())));
        }

        let envelope: Envelope<T> = serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupted(format!("{}: {}", self.path.display(), e)))?;
        if envelope.version > STORE_VERSION {
            return Err(StoreError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope.data)
    }

    /// Read-modify-write under the mutation guard.
    ///
    /// The document is written back only when `mutate` returns `Ok`.
    pub fn update<R, E>(&self, mutate: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let _timer = TimedOperation::start(self.operation);
        let _guard = MutationGuard::acquire(self.guard_path())?;

        let mut document = self.load()?;
        let result = mutate(&mut document)?;
        self.write(&document)?;
        Ok(result)
    }

    fn write(&self, document: &T) -> Result<(), StoreError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let temp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(
                &mut writer,
                &EnvelopeRef {
                    version: STORE_VERSION,
                    data: document,
                },
            )?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path)?;
        debug!(path = %self.path.display(), "State file replaced");
        Ok(())
    }
}

/// Exclusive right to mutate one state file. Released on drop.
#[derive(Debug)]
struct MutationGuard {
    path: PathBuf,
}

impl MutationGuard {
    fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let started = Instant::now();
        let mut backoff = BACKOFF_START;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Diagnostics only.
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if guard_age(&path).is_some_and(|age| age > GUARD_STALE_AFTER)
                        && break_stale(&path)?
                    {
                        continue;
                    }
                    if started.elapsed() >= GUARD_TIMEOUT {
                        return Err(StoreError::Busy(started.elapsed().as_millis() as u64));
                    }
                    pause(backoff);
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "Failed to release mutation guard: {}", e);
            }
        }
    }
}

/// Remove an abandoned guard at `path`.
///
/// The guard is renamed to a unique tombstone before its age is checked
/// again, so of several writers that judged it stale only one removes it,
/// and a guard recreated in the meantime is never the one deleted. A
/// tombstone that proves fresh is linked back into place.
fn break_stale(path: &Path) -> Result<bool, StoreError> {
    let Some(name) = path.file_name() else {
        return Ok(false);
    };
    let mut tomb_name = std::ffi::OsString::from(".");
    tomb_name.push(name);
    tomb_name.push(format!(".{}.tomb", uuid::Uuid::new_v4().simple()));
    let tombstone = path.with_file_name(tomb_name);

    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        // Someone else broke or released it first.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }

    if guard_age(&tombstone).is_some_and(|age| age > GUARD_STALE_AFTER) {
        warn!(path = %path.display(), "Breaking abandoned mutation guard");
        fs::remove_file(&tombstone)?;
        return Ok(true);
    }

    // Replaced by a live writer between the check and the rename.
    let restored = fs::hard_link(&tombstone, path);
    let _ = fs::remove_file(&tombstone);
    match restored {
        Ok(()) => Ok(false),
        // A new guard already took its place; wait on that one.
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Sleep between guard attempts without stalling an async runtime.
///
/// On a multi-threaded tokio runtime the worker hands its other tasks off
/// before blocking; elsewhere this is a plain thread sleep.
fn pause(backoff: Duration) {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(backoff))
        }
        _ => std::thread::sleep(backoff),
    }
}

fn guard_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}
