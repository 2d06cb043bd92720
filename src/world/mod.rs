//! World and storage collaborators
//!
//! The simulated world and the durable-storage layer are external; the
//! core consumes them through these traits.

use std::fs;
use std::path::PathBuf;

use anyhow::Context as _;
use tracing::{info, warn};

use crate::instance::{ItemId, ObjectId};

/// Services the simulated world exposes to the core.
pub trait WorldServices: Send + Sync {
    /// Say a message at the object's locale.
    fn chat_local(&self, host: ObjectId, text: &str);

    /// Deliver a message privately to the object's owner.
    fn alert_owner(&self, host: ObjectId, text: &str);

    /// Remove the script's inventory item from its host.
    fn remove_script(&self, host: ObjectId, item: ItemId);

    /// Destroy the hosting object entirely.
    fn die(&self, host: ObjectId);
}

/// World stub that only logs; used by tests and tooling.
#[derive(Debug, Default)]
pub struct NullWorld;

impl WorldServices for NullWorld {
    fn chat_local(&self, host: ObjectId, text: &str) {
        info!(%host, "chat: {text}");
    }

    fn alert_owner(&self, host: ObjectId, text: &str) {
        info!(%host, "owner alert: {text}");
    }

    fn remove_script(&self, host: ObjectId, item: ItemId) {
        info!(%host, %item, "remove script");
    }

    fn die(&self, host: ObjectId) {
        info!(%host, "die");
    }
}

/// Durable storage for serialized instance state.
pub trait StateStore: Send + Sync {
    /// Fetch the blob for an item, `None` when absent.
    fn load(&self, item: ItemId) -> anyhow::Result<Option<Vec<u8>>>;

    /// Store the blob for an item, replacing any prior one.
    fn store(&self, item: ItemId, blob: &[u8]) -> anyhow::Result<()>;

    /// Drop the blob for an item, if any.
    fn remove(&self, item: ItemId) -> anyhow::Result<()>;
}

/// Directory-backed store: one file per item.
#[derive(Debug)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Store rooted at `root`, created if missing.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating state store at {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, item: ItemId) -> PathBuf {
        self.root.join(format!("{item}.state"))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, item: ItemId) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(item);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn store(&self, item: ItemId, blob: &[u8]) -> anyhow::Result<()> {
        let path = self.path_for(item);
        // Write-then-rename keeps a crash from leaving a torn blob.
        let tmp = path.with_extension("state.tmp");
        fs::write(&tmp, blob).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, item: ItemId) -> anyhow::Result<()> {
        let path = self.path_for(item);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!(%item, "failed to remove state blob: {err}");
                Err(err).with_context(|| format!("removing {}", path.display()))
            }
        }
    }
}
