//! Snapshot persistence and the human-readable digest.

use crate::metrics::{find_day, Snapshot};
use crate::window::DateWindow;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

pub const DEFAULT_DIGEST_LINK: &str = "https://kpi.trustroots.org/";

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PublishError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| PublishError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Writes snapshots to a fixed location, replacing it atomically.
#[derive(Debug, Clone)]
pub struct SnapshotPublisher {
    path: PathBuf,
}

impl SnapshotPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Readers see either the previous file or the new one, never a partial
    /// write: the snapshot goes to a temp file in the same directory first.
    pub fn write(&self, snapshot: &Snapshot) -> Result<usize, PublishError> {
        let bytes = render(snapshot)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(PublishError::io(dir))?;

        let mut temp = NamedTempFile::new_in(dir).map_err(PublishError::io(dir))?;
        temp.as_file_mut()
            .write_all(&bytes)
            .map_err(PublishError::io(temp.path()))?;
        temp.as_file()
            .sync_all()
            .map_err(PublishError::io(temp.path()))?;

        // NamedTempFile is created 0600; the dashboard must be world-readable.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o644))
                .map_err(PublishError::io(temp.path()))?;
        }

        temp.persist(&self.path)
            .map_err(|e| PublishError::Io {
                path: self.path.clone(),
                source: e.error,
            })?;

        info!(path = %self.path.display(), bytes = bytes.len(), "Snapshot written");
        Ok(bytes.len())
    }

    /// [`write`](Self::write) on the blocking pool.
    pub async fn write_blocking(&self, snapshot: Snapshot) -> Result<usize, PublishError> {
        let publisher = self.clone();
        tokio::task::spawn_blocking(move || publisher.write(&snapshot)).await?
    }

    pub fn read(path: &Path) -> Result<Snapshot, PublishError> {
        let raw = fs::read(path).map_err(PublishError::io(path))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Pretty JSON with two-space indentation.
pub fn render(snapshot: &Snapshot) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(snapshot)
}

/// Summary of the day before the generation date. Days without a record
/// read as zero.
pub fn digest(snapshot: &Snapshot, link: &str) -> String {
    let day = DateWindow::ending_at(snapshot.generated).yesterday();
    let trustroots = &snapshot.relational;
    let nostroots = &snapshot.relay;

    let messages = find_day(&trustroots.messages_per_day, day).map_or(0, |m| m.count);
    let (positive, negative) = find_day(&trustroots.reviews_per_day, day)
        .map_or((0, 0), |r| (r.positive, r.negative));
    let (upvotes, downvotes) = find_day(&trustroots.thread_votes_per_day, day)
        .map_or((0, 0), |v| (v.upvotes, v.downvotes));
    let notes = find_day(&nostroots.notes_by_kind_per_day, day).map_or(0, |n| n.total());

    format!(
        "Yesterday on Trustroots: {messages} messages, {positive} positive reviews, \
         {negative} negative reviews, {upvotes} upvotes, {downvotes} downvotes\n\n\
         Nostroots: {} npub users, {} active posters, {notes} notes\n\n\
         More #stats at {link}",
        nostroots.users_with_npubs, nostroots.active_posters,
    )
}
