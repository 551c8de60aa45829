//! # Redeploy Watcher
//!
//! Watches an application descriptor and redeploys the application into a
//! [`Host`] whenever the file changes.
//!
//! ```rust,ignore
//! use brrtcontainer::host::Host;
//! use brrtcontainer::loader::Instantiator;
//! use brrtcontainer::redeploy::watch_descriptor;
//! use std::sync::Arc;
//!
//! let host = Arc::new(Host::new());
//! let watcher = watch_descriptor(
//!     "apps/shop.yaml",
//!     Arc::clone(&host),
//!     Instantiator::with_builtins(),
//!     |result| {
//!         if let Err(e) = result {
//!             eprintln!("shop redeploy failed: {e:#}");
//!         }
//!     },
//! )?;
//! // Keep `watcher` alive for as long as changes should be picked up.
//! ```
//!
//! ## Reload process
//!
//! 1. **Detection**: a create or modify event names the descriptor file
//! 2. **Dedup**: content identical to the last applied version is ignored,
//!    which absorbs the burst of events editors produce on save
//! 3. **Parse**: the descriptor is loaded and validated
//! 4. **Swap**: a new application is built, started and swapped into the
//!    host; the old one drains per its own policy and is destroyed
//!
//! A descriptor that fails to parse, validate or start leaves the running
//! application in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::descriptor::ApplicationDescriptor;
use crate::dispatcher::{Application, DrainReport};
use crate::host::Host;
use crate::loader::Instantiator;

/// Load `path`, build the application it describes and swap it into
/// `host`.
pub fn redeploy_from(
    path: &Path,
    host: &Host,
    instantiator: &Instantiator,
) -> anyhow::Result<Option<DrainReport>> {
    let descriptor = ApplicationDescriptor::load(path)?;
    let app = Application::from_descriptor(&descriptor, instantiator.clone())?;
    host.redeploy(app)
        .with_context(|| format!("redeploying '{}'", descriptor.name))
}

/// Watch a descriptor file and redeploy on every effective change.
///
/// `on_redeploy` receives the outcome of each attempt.
pub fn watch_descriptor<P, F>(
    descriptor_path: P,
    host: Arc<Host>,
    instantiator: Instantiator,
    mut on_redeploy: F,
) -> notify::Result<RecommendedWatcher>
where
    P: AsRef<Path>,
    F: FnMut(anyhow::Result<Option<DrainReport>>) + Send + 'static,
{
    let path: PathBuf = descriptor_path.as_ref().to_path_buf();
    let watch_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path.file_name().map(ToOwned::to_owned);
    let last_applied = Mutex::new(std::fs::read_to_string(&path).ok());
    let target = path.clone();

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                if !event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == file_name.as_deref())
                {
                    return;
                }
                let Ok(content) = std::fs::read_to_string(&target) else {
                    debug!(path = %target.display(), "Descriptor not readable yet");
                    return;
                };
                {
                    let mut last = last_applied.lock();
                    if last.as_deref() == Some(content.as_str()) {
                        debug!(path = %target.display(), "Descriptor unchanged, skipping");
                        return;
                    }
                    *last = Some(content);
                }
                info!(path = %target.display(), "redeploy: descriptor changed");
                let result = redeploy_from(&target, &host, &instantiator);
                match &result {
                    Ok(report) => info!(
                        path = %target.display(),
                        drained = report.as_ref().map_or(true, |r| r.drained),
                        "redeploy: application swapped"
                    ),
                    Err(e) => error!(
                        path = %target.display(),
                        error = %format!("{e:#}"),
                        "redeploy: keeping running application"
                    ),
                }
                on_redeploy(result);
            }
            Err(e) => error!(error = %e, "redeploy: watch error"),
        },
        Config::default(),
    )?;

    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "Watching descriptor for changes");
    Ok(watcher)
}
