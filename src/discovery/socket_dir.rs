//! Socket directory watcher
//!
//! Every module that serves RPC binds `<socket_dir>/<name>`. A socket
//! appearing in the directory means the module came up; the file going away
//! means it stopped.

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{DiscoveryEvent, DiscoverySource};
use crate::{Error, Result};

/// Watches a directory of module sockets
#[derive(Debug, Clone)]
pub struct SocketDirSource {
    dir: PathBuf,
}

impl SocketDirSource {
    /// Source over `dir`
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory being watched
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_socket(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_socket())
}

fn module_name(dir: &Path, path: &Path) -> Option<String> {
    if path.parent() != Some(dir) {
        return None;
    }
    path.file_name()?.to_str().map(str::to_string)
}

/// Names of the sockets currently in `dir`, sorted
///
/// # Errors
///
/// Returns error if the directory cannot be read
pub fn scan(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_socket() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort_unstable();
    Ok(names)
}

/// Map one filesystem event onto discovery events
fn translate(dir: &Path, event: &Event) -> Vec<DiscoveryEvent> {
    let appeared = match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => true,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => false,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter_map(|path| {
            let name = module_name(dir, path)?;
            if appeared {
                is_socket(path).then_some(DiscoveryEvent::Added(name))
            } else {
                Some(DiscoveryEvent::Removed(name))
            }
        })
        .collect()
}

#[async_trait]
impl DiscoverySource for SocketDirSource {
    fn label(&self) -> &'static str {
        "socket-dir"
    }

    async fn run(
        self: Box<Self>,
        events: mpsc::Sender<DiscoveryEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let dir = fs::canonicalize(&self.dir)?;

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = raw_tx.send(res);
            },
            Config::default(),
        )
        .map_err(|e| Error::Config(format!("cannot watch {}: {e}", self.dir.display())))?;

        // Watch before scanning so a socket created in between is not missed
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Config(format!("cannot watch {}: {e}", self.dir.display())))?;

        tracing::info!(dir = %dir.display(), "watching module sockets");

        for name in scan(&dir)? {
            if events.send(DiscoveryEvent::Added(name)).await.is_err() {
                return Ok(());
            }
        }

        loop {
            let raw = tokio::select! {
                () = shutdown.cancelled() => break,
                raw = raw_rx.recv() => raw,
            };

            let event = match raw {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "socket watch error");
                    continue;
                }
                None => break,
            };

            for discovered in translate(&dir, &event) {
                tracing::debug!(event = ?discovered, "socket directory changed");
                if events.send(discovered).await.is_err() {
                    return Ok(());
                }
            }
        }

        drop(watcher);
        tracing::debug!("socket watcher stopped");
        Ok(())
    }
}
