//! Configuration file watcher for hot route reload.
//!
//! Editors often replace a file instead of writing it in place, so both
//! modify and create events trigger a reload. A config that fails to load
//! or validate is logged and dropped; the running routes stay in effect.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ProxyConfig;

/// Whether a filesystem event should trigger a reload.
pub fn is_reload_event(event: &Event) -> bool {
    event.kind.is_modify() || event.kind.is_create()
}

/// Watches one configuration file.
pub struct ConfigWatcher {
    path: PathBuf,
    updates: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver of validated configurations.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (updates, rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                updates,
            },
            rx,
        )
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self { path, updates } = self;
        let reload_path = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_reload_event(&event) => match load_config(&reload_path) {
                    Ok(config) => {
                        tracing::info!(
                            path = %reload_path.display(),
                            routes = config.routes.len(),
                            "Config reloaded"
                        );
                        let _ = updates.send(config);
                    }
                    Err(e) => tracing::error!(
                        path = %reload_path.display(),
                        error = %e,
                        "Config reload failed, keeping current routes"
                    ),
                },
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %path.display(), "Config watcher started");
        Ok(watcher)
    }
}
