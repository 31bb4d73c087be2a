//! Debounced file watching.
//!
//! Watches a directory for changes to files whose names match a set of glob
//! patterns and tells listeners about the last qualifying path once the
//! directory has been quiet for the debounce window. A burst of editor saves
//! produces a single notification.

use crate::error::{PeerError, Result};
use notify::event::{Event, EventKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Called with the changed path once a burst of changes settles.
pub type ChangeListener = Arc<dyn Fn(&Path) + Send + Sync + 'static>;

/// Case-insensitive file name globs. `*` matches any run of characters and
/// `?` matches zero or one character.
#[derive(Debug, Clone)]
pub struct FileFilters {
    patterns: Vec<Regex>,
}

impl FileFilters {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(&glob_to_regex(pattern)).map_err(|e| {
                    PeerError::argument("watch_file_name_patterns", format!("{}: {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Whether the file name of `path` matches any pattern.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        let name = name.to_string_lossy();
        self.patterns.iter().any(|pattern| pattern.is_match(&name))
    }

    /// The path a watch event should report, if the event qualifies.
    ///
    /// Creations, modifications (including renames) and removals qualify.
    /// For renames the destination path is preferred.
    pub fn qualifying_path(&self, event: &Event) -> Option<PathBuf> {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => event
                .paths
                .iter()
                .rev()
                .find(|path| self.matches(path))
                .cloned(),
            _ => None,
        }
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push_str(".?"),
            other => regex.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    regex.push('$');
    regex
}

/// Watches one directory and fans debounced changes out to listeners.
///
/// The OS watcher is created lazily by the first [`add_listener`](Self::add_listener).
pub struct FileWatchCoordinator {
    root: PathBuf,
    recursive: bool,
    filters: Arc<FileFilters>,
    debounce: Duration,
    listeners: Arc<RwLock<Vec<ChangeListener>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileWatchCoordinator {
    pub fn new(
        root: impl AsRef<Path>,
        recursive: bool,
        patterns: &[String],
        debounce: Duration,
    ) -> Result<Self> {
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            recursive,
            filters: Arc::new(FileFilters::new(patterns)?),
            debounce,
            listeners: Arc::new(RwLock::new(Vec::new())),
            watcher: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a listener, starting the watch if this is the first one.
    ///
    /// A listener is only kept once the watch is running.
    pub fn add_listener(&self, listener: ChangeListener) -> Result<()> {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.is_none() {
            *watcher = Some(self.start()?);
        }

        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the OS watcher is running.
    pub fn is_watching(&self) -> bool {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop watching. The debounce thread exits once the watcher is dropped.
    pub fn stop(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if watcher.is_some() {
            info!("Stopped watching {}", self.root.display());
        }
    }

    fn start(&self) -> Result<RecommendedWatcher> {
        let watch_error = |e: notify::Error| PeerError::Watch {
            path: self.root.clone(),
            message: e.to_string(),
        };

        let (event_tx, event_rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(event_tx).map_err(watch_error)?;
        let mode = if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&self.root, mode).map_err(watch_error)?;

        let filters = Arc::clone(&self.filters);
        let listeners = Arc::clone(&self.listeners);
        let window = self.debounce;
        std::thread::Builder::new()
            .name("peerhost-watch".to_string())
            .spawn(move || {
                run_debounce_loop(event_rx, &filters, window, |path| {
                    let listeners = listeners
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    for listener in listeners {
                        listener(path);
                    }
                });
            })
            .map_err(|e| PeerError::io_with_path(e, &self.root))?;

        info!(
            "Watching {} for changes (recursive: {}, debounce: {:?})",
            self.root.display(),
            self.recursive,
            self.debounce
        );
        Ok(watcher)
    }
}

impl Drop for FileWatchCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Collapse qualifying events into one `on_change` call per quiet window.
///
/// Each qualifying event restarts the window and replaces the pending path.
/// Returns when the event sender is dropped.
pub(crate) fn run_debounce_loop(
    events: Receiver<notify::Result<Event>>,
    filters: &FileFilters,
    window: Duration,
    mut on_change: impl FnMut(&Path),
) {
    let mut pending: Option<(PathBuf, Instant)> = None;

    loop {
        let received = match &pending {
            Some((_, deadline)) => {
                let now = Instant::now();
                if now >= *deadline {
                    Err(RecvTimeoutError::Timeout)
                } else {
                    events.recv_timeout(*deadline - now)
                }
            }
            None => events.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Ok(event)) => {
                if let Some(path) = filters.qualifying_path(&event) {
                    pending = Some((path, Instant::now() + window));
                }
            }
            Ok(Err(e)) => warn!("File watch error: {}", e),
            Err(RecvTimeoutError::Timeout) => {
                if let Some((path, _)) = pending.take() {
                    debug!("Change settled: {}", path.display());
                    on_change(&path);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("File watcher stopping");
                break;
            }
        }
    }
}
