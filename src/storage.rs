use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncWriteExt};

use crate::{error::Error, fetcher::Page};

pub const FOLDER_NAME_MAX_LENGTH: usize = 127;
pub const FILE_NAME_MAX_LENGTH: usize = 127;

const DIGEST_LENGTH: usize = 32;
const UNSAFE_CHARS: &[char] = &[':', '/', '#'];

static NEXT_PARTIAL: AtomicU64 = AtomicU64::new(0);

/// A downloaded page together with where it belongs.
///
/// `folder` and `file_name` are raw URLs; they are turned into path
/// components by [`PageStore::save`].
#[derive(Debug, Clone)]
pub struct SavedPage {
    pub folder: String,
    pub file_name: String,
    pub page: Page,
}

/// Replaces the characters that cannot appear in a single path component.
pub fn sanitize(name: &str) -> String {
    name.replace(UNSAFE_CHARS, "_")
}

/// Cuts `name` down to exactly `max_length` characters when it has
/// `max_length` or more, keeping it unique with a digest of the full name.
pub fn shorten(name: &str, max_length: usize) -> String {
    if name.chars().count() < max_length {
        return name.to_string();
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let digest = &digest[..DIGEST_LENGTH];
    let keep = max_length.saturating_sub(DIGEST_LENGTH);
    let mut shortened: String = name.chars().take(keep).collect();
    shortened.push_str(digest);
    shortened
}

/// Mirror of downloaded pages under a root directory.
#[derive(Debug, Clone)]
pub struct PageStore {
    root: PathBuf,
}

impl PageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder_path(&self, folder: &str) -> PathBuf {
        self.root
            .join(shorten(&sanitize(folder), FOLDER_NAME_MAX_LENGTH))
    }

    pub fn file_path(&self, folder: &str, file_name: &str) -> PathBuf {
        self.folder_path(folder)
            .join(shorten(&sanitize(file_name), FILE_NAME_MAX_LENGTH))
    }

    /// Writes the page unless a file with the same name already exists.
    ///
    /// The body goes to a temporary file first and is linked into place, so a
    /// stored page is never overwritten nor left half written. Returns the path
    /// written, or `None` when the page was already stored.
    pub async fn save(&self, saved: &SavedPage) -> Result<Option<PathBuf>, Error> {
        let folder = self.folder_path(&saved.folder);
        fs::create_dir_all(&folder).await.map_err(|err| {
            tracing::error!("failed creating path='{}'", folder.display());
            err
        })?;

        let path = self.file_path(&saved.folder, &saved.file_name);
        if fs::try_exists(&path).await? {
            tracing::trace!("'{}' already stored", path.display());
            return Ok(None);
        }

        let partial = folder.join(format!(
            ".{}.{}.part",
            std::process::id(),
            NEXT_PARTIAL.fetch_add(1, Ordering::Relaxed)
        ));
        tracing::debug!(content_type = ?saved.page.content_type, "creating file {:?}", path);
        if let Err(err) = write_new(&partial, saved.page.body.as_bytes()).await {
            tracing::error!("failed writing '{}'", partial.display());
            let _ = fs::remove_file(&partial).await;
            return Err(err.into());
        }

        let linked = fs::hard_link(&partial, &path).await;
        let _ = fs::remove_file(&partial).await;
        match linked {
            Ok(()) => Ok(Some(path)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                tracing::trace!("'{}' stored concurrently", path.display());
                Ok(None)
            }
            Err(err) => {
                tracing::error!("failed creating file '{}'", path.display());
                Err(err.into())
            }
        }
    }
}

async fn write_new(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.flush().await
}
