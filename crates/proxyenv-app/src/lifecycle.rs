//! Host lifecycle hooks.
//!
//! A [`HostSession`] ties observers to one host session so that a normal exit
//! detaches only what the session registered, while a forced exit tears the
//! engine down and clears the persisted environment.

use parking_lot::Mutex;
use proxyenv_core::{ObserverId, ProxyChangeEvent, ProxySyncEngine};
use tracing::{debug, info};

/// How the host is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Regular close; the engine keeps running for other sessions.
    Normal,
    /// Kill or process exit; the environment must not outlive the host.
    Forced,
}

/// Observers and hooks of one host session.
#[derive(Debug)]
pub struct HostSession {
    engine: ProxySyncEngine,
    observers: Mutex<Vec<ObserverId>>,
}

impl HostSession {
    /// Creates a session on `engine`.
    pub fn new(engine: ProxySyncEngine) -> Self {
        Self {
            engine,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the engine.
    pub fn engine(&self) -> &ProxySyncEngine {
        &self.engine
    }

    /// Registers an observer owned by this session.
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ProxyChangeEvent) + Send + Sync + 'static,
    {
        let id = self.engine.subscribe(observer);
        self.observers.lock().push(id);
        id
    }

    /// Returns how many observers this session holds.
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Host became active: force a refresh so observers see current state.
    pub async fn on_enter(&self) -> bool {
        debug!("Host session entered");
        self.engine.refresh().await
    }

    /// Host is leaving.
    pub async fn on_exit(&self, kind: ExitKind) {
        let ids: Vec<ObserverId> = std::mem::take(&mut *self.observers.lock());
        for id in &ids {
            self.engine.unsubscribe(*id);
        }
        debug!("Detached {} session observer(s)", ids.len());

        if kind == ExitKind::Forced {
            info!("Forced exit, clearing proxy environment");
            self.engine.shutdown().await;
        }
    }
}
