use crate::infrastructure::error::InfraError;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Debounced watch on a single file. `on_change` fires once per burst of
/// external modifications; bursts for which `is_own_write` holds are dropped.
pub struct ChangeWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ChangeWatcher {
    /// Must be called from within a tokio runtime.
    pub fn spawn<S, F>(
        path: impl AsRef<Path>,
        debounce: Duration,
        is_own_write: S,
        on_change: F,
    ) -> Result<Self, InfraError>
    where
        S: Fn() -> bool + Send + 'static,
        F: Fn() + Send + 'static,
    {
        let path = path.as_ref().to_path_buf();
        let directory = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .map(ToOwned::to_owned)
            .ok_or_else(|| InfraError::InvalidState(format!("cannot watch {}", path.display())))?;
        fs::create_dir_all(&directory)?;

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) if touches(&event, &file_name) => {
                    let _ = raw_tx.send(());
                }
                Ok(_) => {}
                Err(error) => tracing::warn!(%error, "file watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(|error| InfraError::InvalidState(format!("failed to create file watcher: {error}")))?;
        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|error| {
                InfraError::InvalidState(format!("failed to watch {}: {error}", directory.display()))
            })?;

        let task = tokio::spawn(debounce_loop(raw_rx, debounce, is_own_write, on_change));
        tracing::debug!(path = %path.display(), "watching ledger file");
        Ok(Self {
            path,
            _watcher: watcher,
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn touches(event: &Event, file_name: &OsString) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name.as_os_str()))
}

async fn debounce_loop<S, F>(
    mut raw_rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    is_own_write: S,
    on_change: F,
) where
    S: Fn() -> bool,
    F: Fn(),
{
    while raw_rx.recv().await.is_some() {
        loop {
            match tokio::time::timeout(debounce, raw_rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        if is_own_write() {
            tracing::debug!("ignoring change produced by our own save");
            continue;
        }
        on_change();
    }
}
