//! Debounced change notifications for a single file.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) const SETTLE: Duration = Duration::from_millis(50);

/// Watches the file's directory and calls `on_change` once a burst of
/// events for the file has settled. Events for which `suppressed` returns
/// `true` are dropped as they arrive.
pub(crate) struct FileWatch {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FileWatch {
    pub(crate) fn spawn<S, C>(
        path: &Path,
        runtime: &Handle,
        settle: Duration,
        suppressed: S,
        on_change: C,
    ) -> notify::Result<Self>
    where
        S: Fn() -> bool + Send + 'static,
        C: Fn() + Send + 'static,
    {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => Path::new(".").to_path_buf(),
        };
        let file_name = path.file_name().map(|name| name.to_os_string());

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else {
                return;
            };
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            let ours = event
                .paths
                .iter()
                .any(|changed| changed.file_name() == file_name.as_deref());
            if ours && !suppressed() {
                let _ = event_tx.send(());
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let task = runtime.spawn(async move {
            let mut pending = false;
            loop {
                tokio::select! {
                    received = event_rx.recv() => match received {
                        Some(()) => pending = true,
                        None => break,
                    },
                    _ = tokio::time::sleep(settle), if pending => {
                        pending = false;
                        on_change();
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for FileWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
