//! # Host
//!
//! Several applications served side by side, each under its own context
//! path. A request goes to the application whose context path is the
//! longest segment-aligned prefix of the request path; `""` is the root
//! application and catches everything no other application claims.
//!
//! The routing table is immutable and swapped whole on every deploy,
//! undeploy and redeploy, so `service` never takes a lock. Writers are
//! serialized among themselves.
//!
//! ```rust
//! use brrtcontainer::dispatcher::Application;
//! use brrtcontainer::host::Host;
//!
//! let host = Host::new();
//! host.deploy(Application::builder("shop").context_path("/shop").build().unwrap())
//!     .unwrap();
//! assert_eq!(host.route("/shop/cart").unwrap().name(), "shop");
//! assert!(host.route("/shopping").is_none());
//! ```

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::dispatcher::{
    Application, DrainReport, Exchange, LifecycleState, Served, Service,
};
use crate::error::{DispatchError, HostError};
use crate::resource::normalize;

#[derive(Default)]
struct Table {
    /// Sorted by context path length, longest first.
    apps: Vec<Application>,
}

impl Table {
    fn with(&self, app: Application) -> Table {
        let mut apps: Vec<Application> = self
            .apps
            .iter()
            .filter(|a| a.context_path() != app.context_path())
            .cloned()
            .collect();
        apps.push(app);
        apps.sort_by(|a, b| b.context_path().len().cmp(&a.context_path().len()));
        Table { apps }
    }

    fn without(&self, context_path: &str) -> Table {
        Table {
            apps: self
                .apps
                .iter()
                .filter(|a| a.context_path() != context_path)
                .cloned()
                .collect(),
        }
    }

    fn get(&self, context_path: &str) -> Option<&Application> {
        self.apps.iter().find(|a| a.context_path() == context_path)
    }

    fn route(&self, path: &str) -> Option<&Application> {
        self.apps.iter().find(|a| claims(a.context_path(), path))
    }
}

fn claims(context_path: &str, path: &str) -> bool {
    context_path.is_empty()
        || path == context_path
        || path
            .strip_prefix(context_path)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Bring an application up to `STARTED` from wherever it is.
fn bring_up(app: &Application) -> Result<(), HostError> {
    if app.state() == LifecycleState::Unconfigured {
        app.initialize()?;
    }
    if app.state() == LifecycleState::Initialized {
        app.start()?;
    }
    Ok(())
}

/// Stop and destroy an application that has left the table.
fn retire(app: &Application) -> Result<Option<DrainReport>, HostError> {
    let report = if app.state() == LifecycleState::Started {
        Some(app.stop()?)
    } else {
        None
    };
    if app.state() != LifecycleState::Destroyed {
        app.destroy()?;
    }
    Ok(report)
}

/// Multi-application front: maps context paths to applications.
pub struct Host {
    table: ArcSwap<Table>,
    writer: Mutex<()>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("context_paths", &self.context_paths())
            .finish()
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(Table::default()),
            writer: Mutex::new(()),
        }
    }

    /// Start `app` if needed and serve it at its context path. A context
    /// path can hold only one application; use [`Host::redeploy`] to
    /// replace one.
    pub fn deploy(&self, app: Application) -> Result<(), HostError> {
        let _writer = self.writer.lock();
        let current = self.table.load();
        if let Some(existing) = current.get(app.context_path()) {
            return Err(HostError::ContextPathInUse {
                path: app.context_path().to_string(),
                existing: existing.name().to_string(),
            });
        }
        bring_up(&app)?;
        info!(app = %app.name(), context_path = %app.context_path(), "Application deployed");
        self.table.store(Arc::new(current.with(app)));
        Ok(())
    }

    /// Take the application at `context_path` out of service, then stop
    /// and destroy it. New requests for its paths stop reaching it before
    /// draining begins.
    pub fn undeploy(&self, context_path: &str) -> Result<Option<DrainReport>, HostError> {
        let _writer = self.writer.lock();
        let current = self.table.load();
        let Some(app) = current.get(context_path).cloned() else {
            return Err(HostError::NotDeployed(context_path.to_string()));
        };
        self.table.store(Arc::new(current.without(context_path)));
        let report = retire(&app)?;
        info!(app = %app.name(), context_path = %context_path, "Application undeployed");
        Ok(report)
    }

    /// Swap in `app` for whatever serves its context path. The replacement
    /// is started before the swap, so no request sees a gap; the old
    /// application then drains per its own policy and is destroyed.
    pub fn redeploy(&self, app: Application) -> Result<Option<DrainReport>, HostError> {
        let _writer = self.writer.lock();
        bring_up(&app)?;
        let current = self.table.load();
        let previous = current.get(app.context_path()).cloned();
        let context_path = app.context_path().to_string();
        let name = app.name().to_string();
        self.table.store(Arc::new(current.with(app)));

        let report = match previous {
            Some(old) => {
                let report = retire(&old);
                if let Err(e) = &report {
                    warn!(app = %old.name(), error = %e, "Retiring replaced application failed");
                }
                report?
            }
            None => None,
        };
        info!(app = %name, context_path = %context_path, "Application redeployed");
        Ok(report)
    }

    /// The application serving `path`, if any.
    #[must_use]
    pub fn route(&self, path: &str) -> Option<Application> {
        let normalized = normalize(path)?;
        self.table.load().route(&normalized).cloned()
    }

    #[must_use]
    pub fn application(&self, context_path: &str) -> Option<Application> {
        self.table.load().get(context_path).cloned()
    }

    /// Deployed context paths, longest first.
    #[must_use]
    pub fn context_paths(&self) -> Vec<String> {
        self.table
            .load()
            .apps
            .iter()
            .map(|a| a.context_path().to_string())
            .collect()
    }

    /// Undeploy everything, longest context path first.
    pub fn shutdown(&self) -> Vec<(String, Result<Option<DrainReport>, HostError>)> {
        self.context_paths()
            .into_iter()
            .map(|ctx| {
                let result = self.undeploy(&ctx);
                (ctx, result)
            })
            .collect()
    }
}

impl Service for Host {
    fn service(&self, exchange: Exchange) -> Result<Served, DispatchError> {
        let path = exchange.request().path().to_string();
        let Some(app) = self.route(&path) else {
            debug!(request_id = %exchange.request_id(), path = %path, "No application for path");
            return Err(DispatchError::NotFound(path));
        };
        app.service(exchange)
    }
}
