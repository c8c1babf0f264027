//! Proxy sync engine.
//!
//! Polls the OS proxy on a single timer, diffs each snapshot against the last
//! known one and, on a change or a forced tick, writes the environment (when
//! sync is enabled) and fans the result out to observers.
//!
//! Ticks, policy writes and shutdown are serialized behind one async lock, so
//! at most one tick's OS commands are in flight and shutdown never abandons a
//! write half way. Environment I/O runs on the blocking pool. Observers and
//! notifications are fed through per-consumer queues, so each one sees events
//! in publish order without holding up the tick.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{EnvironmentProxyState, ProxyChangeEvent, ProxySettings};
use crate::notifications::{change_message, DesktopNotifier, Notifier};
use crate::reader::{ProxySource, SystemProxyReader};
use crate::settings::{validate_interval, SettingKey, SettingsStore, SyncPolicy};
use crate::shell_config::{EnvironmentTarget, ProxyEnvironment};

/// Callback invoked with every published event.
pub type Observer = Arc<dyn Fn(&ProxyChangeEvent) + Send + Sync>;

/// Handle returned by [`ProxySyncEngine::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

/// Delivery path of one observer.
#[derive(Clone)]
enum Subscriber {
    /// Drained in order by a dedicated task.
    Queued(mpsc::UnboundedSender<ProxyChangeEvent>),
    /// No runtime was available at registration; called on the publisher.
    Inline(Observer),
}

impl Subscriber {
    fn new(observer: Observer) -> Self {
        match Handle::try_current() {
            Ok(runtime) => Self::Queued(ordered_queue(&runtime, move |event: ProxyChangeEvent| {
                observer(&event)
            })),
            Err(_) => Self::Inline(observer),
        }
    }

    fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }

    fn deliver(&self, event: ProxyChangeEvent) {
        match self {
            Self::Queued(queue) => {
                if queue.send(event).is_err() {
                    debug!("Observer queue closed, event dropped");
                }
            }
            Self::Inline(observer) => observer(&event),
        }
    }
}

struct Timer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    reader: Arc<dyn ProxySource>,
    environment: Arc<dyn ProxyEnvironment>,
    settings: Arc<dyn SettingsStore>,
    notifier: Arc<dyn Notifier>,
    notices: Mutex<Option<mpsc::UnboundedSender<String>>>,
    policy: RwLock<SyncPolicy>,
    last_known: RwLock<Option<ProxySettings>>,
    observers: RwLock<BTreeMap<ObserverId, Subscriber>>,
    next_observer: AtomicU64,
    timer: Mutex<Option<Timer>>,
    tick_lock: tokio::sync::Mutex<()>,
}

/// Keeps the persisted proxy environment in step with the OS proxy.
///
/// Cheap to clone; clones share state. The hosting application owns a single
/// instance for the process.
#[derive(Clone)]
pub struct ProxySyncEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProxySyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySyncEngine")
            .field("policy", &*self.inner.policy.read())
            .field("last_known", &*self.inner.last_known.read())
            .field("observers", &self.inner.observers.read().len())
            .field("running", &self.is_running())
            .field("environment", &self.inner.environment.location())
            .finish()
    }
}

impl ProxySyncEngine {
    /// Creates an engine from its collaborators, loading the policy from `settings`.
    pub fn new(
        reader: Arc<dyn ProxySource>,
        environment: Arc<dyn ProxyEnvironment>,
        settings: Arc<dyn SettingsStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let policy = SyncPolicy::load(settings.as_ref());
        debug!("Loaded sync policy: {:?}", policy);

        Self {
            inner: Arc::new(Inner {
                reader,
                environment,
                settings,
                notifier,
                notices: Mutex::new(None),
                policy: RwLock::new(policy),
                last_known: RwLock::new(None),
                observers: RwLock::new(BTreeMap::new()),
                next_observer: AtomicU64::new(1),
                timer: Mutex::new(None),
                tick_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Creates an engine wired to the running OS.
    ///
    /// Fails on unsupported platforms or when the user's home cannot be found.
    pub fn for_current_platform(settings: Arc<dyn SettingsStore>) -> Result<Self> {
        let reader = SystemProxyReader::new()?;
        let environment = EnvironmentTarget::for_platform(reader.platform())?;
        info!(
            "Proxy sync engine for {} writing to {}",
            reader.platform(),
            environment.location()
        );

        Ok(Self::new(
            Arc::new(reader),
            Arc::new(environment),
            settings,
            Arc::new(DesktopNotifier::new()),
        ))
    }

    // ==================== Ticks ====================

    /// Runs one poll cycle.
    ///
    /// A forced tick publishes even when the snapshot is unchanged. Returns
    /// true when observers were notified.
    pub async fn tick(&self, forced: bool) -> bool {
        let _guard = self.inner.tick_lock.lock().await;
        self.tick_locked(forced).await
    }

    /// Runs one unforced poll cycle.
    pub async fn poll_once(&self) -> bool {
        self.tick(false).await
    }

    /// Runs a forced poll cycle.
    pub async fn refresh(&self) -> bool {
        self.tick(true).await
    }

    /// Forgets cached OS lookups, then runs a forced poll cycle.
    pub async fn reinitialize(&self) -> bool {
        self.inner.reader.reinitialize().await;
        self.refresh().await
    }

    async fn tick_locked(&self, forced: bool) -> bool {
        let settings = match self.inner.reader.try_read().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Proxy read failed, keeping previous state: {}", e);
                return false;
            }
        };

        let changed = self.inner.last_known.read().as_ref() != Some(&settings);
        if !changed && !forced {
            debug!("System proxy unchanged ({})", settings);
            return false;
        }
        if changed {
            info!("System proxy is now {}", settings);
        }
        *self.inner.last_known.write() = Some(settings.clone());

        let policy = self.reload_policy();
        if policy.sync_enabled {
            self.apply_environment(settings.proxy_url()).await;
        }
        if changed && policy.notification_enabled {
            self.notify(change_message(&settings));
        }

        let event = ProxyChangeEvent::new(settings, self.read_environment().await, forced);
        self.publish(event);
        true
    }

    /// Runs `f` against the environment on the blocking pool.
    async fn with_environment<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ProxyEnvironment) -> Result<T> + Send + 'static,
    {
        let environment = self.inner.environment.clone();
        match Handle::try_current() {
            Ok(runtime) => runtime.spawn_blocking(move || f(environment.as_ref())).await?,
            Err(_) => f(environment.as_ref()),
        }
    }

    async fn apply_environment(&self, proxy_url: Option<String>) -> bool {
        match self
            .with_environment(move |env| env.apply(proxy_url.as_deref()))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Failed to update proxy environment in {}: {}",
                    self.inner.environment.location(),
                    e
                );
                false
            }
        }
    }

    async fn read_environment(&self) -> EnvironmentProxyState {
        let state = self.with_environment(|env| env.read()).await;
        self.state_or_default(state)
    }

    fn state_or_default(&self, state: Result<EnvironmentProxyState>) -> EnvironmentProxyState {
        state.unwrap_or_else(|e| {
            warn!(
                "Failed to read proxy environment from {}: {}",
                self.inner.environment.location(),
                e
            );
            EnvironmentProxyState::default()
        })
    }

    /// Queues a desktop notification behind any earlier ones.
    fn notify(&self, message: String) {
        let queue = {
            let mut notices = self.inner.notices.lock();
            if notices.is_none() {
                if let Ok(runtime) = Handle::try_current() {
                    let notifier = self.inner.notifier.clone();
                    *notices = Some(ordered_queue(&runtime, move |message: String| {
                        notifier.notify(&message)
                    }));
                }
            }
            notices.clone()
        };

        match queue {
            Some(queue) => {
                if let Err(unsent) = queue.send(message) {
                    self.inner.notifier.notify(&unsent.0);
                }
            }
            None => self.inner.notifier.notify(&message),
        }
    }

    // ==================== Observers ====================

    /// Registers `observer`.
    ///
    /// If a snapshot is already known it is replayed to the new observer as a
    /// forced event, queued ahead of anything published later. Registering the
    /// first observer starts the timer.
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ProxyChangeEvent) + Send + Sync + 'static,
    {
        let id = ObserverId(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));
        let subscriber = Subscriber::new(Arc::new(observer));
        let has_snapshot = self.inner.last_known.read().is_some();
        let environment =
            has_snapshot.then(|| self.state_or_default(self.inner.environment.read()));

        let (first, replay) = {
            let mut observers = self.inner.observers.write();
            observers.insert(id, subscriber.clone());

            // Publishing needs the observer map, so a replay sent under the
            // write lock cannot overtake a newer event.
            let known = self.inner.last_known.read().clone();
            let replay = known.map(|settings| {
                let environment = environment
                    .unwrap_or_else(|| self.state_or_default(self.inner.environment.read()));
                ProxyChangeEvent::new(settings, environment, true)
            });
            let replay = match replay {
                Some(event) if subscriber.is_queued() => {
                    subscriber.deliver(event);
                    None
                }
                replay => replay,
            };
            (observers.len() == 1, replay)
        };
        debug!("Registered observer {:?}", id);

        if let Some(event) = replay {
            subscriber.deliver(event);
        }

        if first {
            self.start();
        }
        id
    }

    /// Removes an observer. Returns false if it was not registered.
    ///
    /// The timer keeps running after the last observer leaves.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let removed = self.inner.observers.write().remove(&id).is_some();
        if removed {
            debug!("Removed observer {:?}", id);
        }
        removed
    }

    /// Returns the number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.read().len()
    }

    fn publish(&self, event: ProxyChangeEvent) {
        let subscribers: Vec<Subscriber> =
            self.inner.observers.read().values().cloned().collect();
        debug!(
            "Publishing proxy event to {} observer(s), forced={}",
            subscribers.len(),
            event.forced
        );
        for subscriber in subscribers {
            subscriber.deliver(event.clone());
        }
    }

    // ==================== Timer ====================

    /// Starts the poll timer with an immediate first tick.
    ///
    /// Returns false if it was already running or no Tokio runtime is available.
    pub fn start(&self) -> bool {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            return false;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("No async runtime available, poll timer not started");
            return false;
        };

        *timer = Some(self.spawn_timer(&runtime, Instant::now()));
        info!(
            "Started proxy polling every {}ms",
            self.inner.policy.read().poll_interval.as_millis()
        );
        true
    }

    /// Stops the poll timer, waiting for an in-flight tick to finish.
    pub async fn stop(&self) {
        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            stop_timer(timer).await;
            info!("Stopped proxy polling");
        }
    }

    /// Returns true while the poll timer is running.
    pub fn is_running(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    fn spawn_timer(&self, runtime: &Handle, first_tick: Instant) -> Timer {
        let period = self.inner.policy.read().poll_interval;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let engine = Arc::downgrade(&self.inner);

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(engine) = upgrade(&engine) else { break };
                        engine.tick(false).await;
                    }
                }
            }
            debug!("Poll timer exited");
        });

        Timer { cancel, handle }
    }

    // ==================== Policy ====================

    /// Returns the current policy, re-reading the flags from the store.
    pub fn policy(&self) -> SyncPolicy {
        self.reload_policy()
    }

    /// Returns whether detected proxies are written to the environment.
    pub fn sync_enabled(&self) -> bool {
        self.reload_policy().sync_enabled
    }

    /// Returns whether change notifications are shown.
    pub fn notification_enabled(&self) -> bool {
        self.reload_policy().notification_enabled
    }

    /// Returns the poll interval of the timer.
    pub fn check_interval(&self) -> Duration {
        self.inner.policy.read().poll_interval
    }

    fn reload_policy(&self) -> SyncPolicy {
        let stored = SyncPolicy::load(self.inner.settings.as_ref());
        let mut policy = self.inner.policy.write();
        policy.sync_enabled = stored.sync_enabled;
        policy.notification_enabled = stored.notification_enabled;
        *policy
    }

    /// Enables or disables environment sync.
    ///
    /// Disabling clears the environment at once. Enabling re-applies the last
    /// known snapshot, or polls if none is known yet. Observers receive a
    /// forced event either way.
    pub async fn set_sync_enabled(&self, enabled: bool) -> Result<()> {
        self.inner
            .settings
            .set(SettingKey::SyncEnabled.as_str(), &json!(enabled))?;
        self.inner.policy.write().sync_enabled = enabled;
        info!("Proxy sync {}", if enabled { "enabled" } else { "disabled" });

        let _guard = self.inner.tick_lock.lock().await;
        let known = self.inner.last_known.read().clone();

        match (enabled, known) {
            (true, None) => {
                self.tick_locked(true).await;
            }
            (true, Some(settings)) => {
                self.apply_environment(settings.proxy_url()).await;
                let environment = self.read_environment().await;
                self.publish(ProxyChangeEvent::new(settings, environment, true));
            }
            (false, known) => {
                self.apply_environment(None).await;
                if let Some(settings) = known {
                    let environment = self.read_environment().await;
                    self.publish(ProxyChangeEvent::new(settings, environment, true));
                }
            }
        }
        Ok(())
    }

    /// Changes the poll interval, restarting a running timer at `now + interval`.
    ///
    /// Intervals below one second are rejected.
    pub async fn set_check_interval(&self, interval: Duration) -> Result<()> {
        let interval = validate_interval(interval)?;
        self.inner.settings.set(
            SettingKey::CheckInterval.as_str(),
            &json!(interval.as_millis() as u64),
        )?;
        self.inner.policy.write().poll_interval = interval;

        let previous = self.inner.timer.lock().take();
        if let Some(previous) = previous {
            stop_timer(previous).await;

            let mut timer = self.inner.timer.lock();
            if timer.is_none() {
                if let Ok(runtime) = Handle::try_current() {
                    *timer = Some(self.spawn_timer(&runtime, Instant::now() + interval));
                }
            }
        }

        info!("Proxy check interval set to {}ms", interval.as_millis());
        Ok(())
    }

    /// Enables or disables change notifications.
    pub fn set_notification_enabled(&self, enabled: bool) -> Result<()> {
        self.inner
            .settings
            .set(SettingKey::NotificationEnabled.as_str(), &json!(enabled))?;
        self.inner.policy.write().notification_enabled = enabled;
        info!(
            "Proxy notifications {}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    // ==================== State ====================

    /// Reads the OS proxy once without recording, writing or publishing it.
    pub async fn detect_system_proxy(&self) -> Result<ProxySettings> {
        self.inner.reader.try_read().await
    }

    /// Returns the last successfully read snapshot.
    pub fn current_settings(&self) -> Option<ProxySettings> {
        self.inner.last_known.read().clone()
    }

    /// Reads what is currently persisted in the environment.
    pub fn environment_state(&self) -> Result<EnvironmentProxyState> {
        self.inner.environment.read()
    }

    /// Returns where the environment is persisted.
    pub fn environment_location(&self) -> String {
        self.inner.environment.location()
    }

    /// Removes the persisted proxy environment regardless of policy.
    pub async fn clear_environment(&self) -> Result<()> {
        let _guard = self.inner.tick_lock.lock().await;
        self.with_environment(|env| env.apply(None)).await
    }

    /// Stops the timer, drops all observers and clears the environment.
    ///
    /// The environment is cleared even when sync is disabled.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.inner.observers.write().clear();

        let _guard = self.inner.tick_lock.lock().await;
        if self.apply_environment(None).await {
            info!("Cleared proxy environment on shutdown");
        }
    }
}

fn upgrade(inner: &Weak<Inner>) -> Option<ProxySyncEngine> {
    inner.upgrade().map(|inner| ProxySyncEngine { inner })
}

async fn stop_timer(timer: Timer) {
    timer.cancel.cancel();
    if let Err(e) = timer.handle.await {
        if !e.is_cancelled() {
            warn!("Poll timer task failed: {}", e);
        }
    }
}

/// Spawns a task that hands queued items to `handler` one at a time on the
/// blocking pool. The task ends once every sender is dropped.
fn ordered_queue<T, F>(runtime: &Handle, handler: F) -> mpsc::UnboundedSender<T>
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<T>();
    let handler = Arc::new(handler);

    runtime.spawn(async move {
        while let Some(item) = rx.recv().await {
            let handler = handler.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || handler(item)).await {
                warn!("Event handler failed: {}", e);
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use super::*;
    use crate::error::ProxyEnvError;
    use crate::fence;
    use crate::model::ProxyVar;
    use crate::notifications::testing::RecordingNotifier;
    use crate::settings::MemorySettingsStore;
    use crate::shell_config::ShellProfile;

    /// Proxy source returning a settable snapshot, or an error when unset.
    #[derive(Default)]
    struct FakeSource {
        current: Mutex<Option<ProxySettings>>,
        reads: AtomicUsize,
    }

    impl FakeSource {
        fn reporting(settings: ProxySettings) -> Arc<Self> {
            let source = Self::default();
            *source.current.lock() = Some(settings);
            Arc::new(source)
        }

        fn set(&self, settings: Option<ProxySettings>) {
            *self.current.lock() = settings;
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ProxySource for FakeSource {
        async fn try_read(&self) -> Result<ProxySettings> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.current
                .lock()
                .clone()
                .ok_or_else(|| ProxyEnvError::parse("test", "read failed"))
        }
    }

    struct Fixture {
        engine: ProxySyncEngine,
        source: Arc<FakeSource>,
        profile: ShellProfile,
        settings: Arc<MemorySettingsStore>,
        notifier: Arc<RecordingNotifier>,
        _dir: tempfile::TempDir,
    }

    fn fixture(settings: ProxySettings, sync_enabled: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let profile = ShellProfile::new(dir.path().join(".zshrc"));
        let store = Arc::new(MemorySettingsStore::new());
        store
            .set(SettingKey::SyncEnabled.as_str(), &json!(sync_enabled))
            .unwrap();
        let source = FakeSource::reporting(settings);
        let notifier = Arc::new(RecordingNotifier::default());

        let engine = ProxySyncEngine::new(
            source.clone(),
            Arc::new(profile.clone()),
            store.clone(),
            notifier.clone(),
        );

        Fixture {
            engine,
            source,
            profile,
            settings: store,
            notifier,
            _dir: dir,
        }
    }

    fn channel_observer(
        engine: &ProxySyncEngine,
    ) -> (ObserverId, mpsc::UnboundedReceiver<ProxyChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = engine.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ProxyChangeEvent>) -> ProxyChangeEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("observer was not called")
            .expect("observer channel closed")
    }

    async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<ProxyChangeEvent>) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "unexpected observer call");
    }

    async fn wait_for_messages(notifier: &RecordingNotifier, count: usize) -> Vec<String> {
        for _ in 0..50 {
            if notifier.messages().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        notifier.messages()
    }

    /// Shell profile whose next `failures` writes are refused.
    struct FlakyEnvironment {
        profile: ShellProfile,
        failures: AtomicUsize,
    }

    impl ProxyEnvironment for FlakyEnvironment {
        fn apply(&self, proxy_url: Option<&str>) -> Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only").into());
            }
            self.profile.apply(proxy_url)
        }

        fn read(&self) -> Result<EnvironmentProxyState> {
            self.profile.read()
        }

        fn location(&self) -> String {
            self.profile.location()
        }
    }

    #[tokio::test]
    async fn scenario_writes_six_exports_and_notifies_once() {
        let fx = fixture(ProxySettings::enabled("10.0.0.1", 3128), true);

        let (_first, mut rx_a) = channel_observer(&fx.engine);
        let (_second, mut rx_b) = channel_observer(&fx.engine);
        assert!(fx.engine.is_running());

        for rx in [&mut rx_a, &mut rx_b] {
            let event = next_event(rx).await;
            assert!(!event.forced);
            assert_eq!(event.system_proxy, ProxySettings::enabled("10.0.0.1", 3128));
            assert_eq!(event.environment_state.proxy_url(), Some("http://10.0.0.1:3128"));
        }

        let content = fs::read_to_string(fx.profile.path()).unwrap();
        let exports: Vec<&str> = content
            .lines()
            .filter(|l| l.starts_with("export ") && l.contains("http://10.0.0.1:3128"))
            .collect();
        assert_eq!(exports.len(), 6);
        for var in ProxyVar::ALL {
            assert!(content.contains(&format!("export {}=", var.as_str())));
        }

        fx.engine.poll_once().await;
        assert_no_event(&mut rx_a).await;
        assert_no_event(&mut rx_b).await;
        fx.engine.stop().await;
    }

    #[tokio::test]
    async fn identical_ticks_notify_once() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), false);
        let (_id, mut rx) = channel_observer(&fx.engine);
        fx.engine.stop().await;

        assert!(fx.engine.poll_once().await);
        assert!(!fx.engine.poll_once().await);

        assert!(!next_event(&mut rx).await.forced);
        assert_no_event(&mut rx).await;
        assert_eq!(fx.source.reads(), 2);
    }

    #[tokio::test]
    async fn forced_tick_bypasses_equality() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), false);
        let (_id, mut rx) = channel_observer(&fx.engine);
        fx.engine.stop().await;

        fx.engine.poll_once().await;
        assert!(!next_event(&mut rx).await.forced);

        assert!(fx.engine.refresh().await);
        assert!(next_event(&mut rx).await.forced);
    }

    #[tokio::test]
    async fn failed_read_keeps_state_and_stays_silent() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), false);
        let (_id, mut rx) = channel_observer(&fx.engine);
        fx.engine.stop().await;

        fx.engine.poll_once().await;
        next_event(&mut rx).await;

        fx.source.set(None);
        assert!(!fx.engine.poll_once().await);
        assert!(!fx.engine.refresh().await);
        assert_no_event(&mut rx).await;
        assert_eq!(
            fx.engine.current_settings(),
            Some(ProxySettings::enabled("127.0.0.1", 8080))
        );
    }

    #[tokio::test]
    async fn sync_disabled_does_not_write() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), false);
        fx.engine.poll_once().await;
        assert!(!fx.profile.path().exists());
    }

    #[tokio::test]
    async fn disabling_sync_clears_block() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), true);
        fs::write(fx.profile.path(), "export EDITOR=vim\n").unwrap();

        fx.engine.poll_once().await;
        assert!(fs::read_to_string(fx.profile.path())
            .unwrap()
            .contains(fence::BLOCK_BEGIN));

        fx.engine.set_sync_enabled(false).await.unwrap();

        let content = fs::read_to_string(fx.profile.path()).unwrap();
        assert_eq!(content, "export EDITOR=vim\n");
        assert!(!fx.engine.sync_enabled());
        assert_eq!(
            fx.settings.get(SettingKey::SyncEnabled.as_str()).unwrap(),
            Some(json!(false))
        );
    }

    #[tokio::test]
    async fn enabling_sync_reapplies_known_snapshot() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), false);
        let (_id, mut rx) = channel_observer(&fx.engine);
        fx.engine.stop().await;

        fx.engine.poll_once().await;
        next_event(&mut rx).await;
        assert!(!fx.profile.path().exists());

        fx.engine.set_sync_enabled(true).await.unwrap();
        assert_eq!(fx.profile.read().unwrap().proxy_url(), Some("http://127.0.0.1:8080"));
        assert_eq!(fx.source.reads(), 1);

        let event = next_event(&mut rx).await;
        assert!(event.forced);
        assert_eq!(event.environment_state.proxy_url(), Some("http://127.0.0.1:8080"));
    }

    #[tokio::test]
    async fn enabling_sync_without_snapshot_polls() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), false);
        fx.engine.set_sync_enabled(true).await.unwrap();
        assert_eq!(fx.source.reads(), 1);
        assert_eq!(fx.profile.read().unwrap().proxy_url(), Some("http://127.0.0.1:8080"));
    }

    #[tokio::test]
    async fn proxy_turning_off_clears_environment() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), true);
        fx.engine.poll_once().await;

        fx.source.set(Some(ProxySettings::disabled()));
        fx.engine.poll_once().await;
        assert!(fx.profile.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn notifications_only_on_real_changes() {
        let fx = fixture(ProxySettings::enabled("10.0.0.1", 3128), false);
        fx.engine.set_notification_enabled(true).unwrap();

        fx.engine.poll_once().await;
        fx.engine.poll_once().await;
        fx.engine.refresh().await;
        fx.source.set(Some(ProxySettings::disabled()));
        fx.engine.poll_once().await;

        assert_eq!(
            wait_for_messages(&fx.notifier, 2).await,
            vec!["System proxy enabled: 10.0.0.1:3128", "System proxy disabled"]
        );
    }

    #[tokio::test]
    async fn notifications_off_by_default() {
        let fx = fixture(ProxySettings::enabled("10.0.0.1", 3128), false);
        fx.engine.poll_once().await;
        assert!(wait_for_messages(&fx.notifier, 1).await.is_empty());
    }

    #[tokio::test]
    async fn slow_observer_sees_events_in_order() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.engine.subscribe(move |event| {
            if event.system_proxy.enabled {
                std::thread::sleep(Duration::from_millis(200));
            }
            let _ = tx.send(event.system_proxy.enabled);
        });
        fx.engine.stop().await;

        fx.engine.refresh().await;
        fx.source.set(Some(ProxySettings::disabled()));
        fx.engine.poll_once().await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            let enabled = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("observer was not called")
                .expect("observer channel closed");
            seen.push(enabled);
        }
        assert_eq!(seen, vec![true, false]);
    }

    #[tokio::test]
    async fn failed_write_still_publishes_and_retries_on_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let profile = ShellProfile::new(dir.path().join(".zshrc"));
        let store = Arc::new(MemorySettingsStore::new());
        store
            .set(SettingKey::SyncEnabled.as_str(), &json!(true))
            .unwrap();
        let environment = Arc::new(FlakyEnvironment {
            profile: profile.clone(),
            failures: AtomicUsize::new(1),
        });
        let engine = ProxySyncEngine::new(
            FakeSource::reporting(ProxySettings::enabled("127.0.0.1", 8080)),
            environment,
            store,
            Arc::new(RecordingNotifier::default()),
        );
        let (_id, mut rx) = channel_observer(&engine);
        engine.stop().await;

        assert!(engine.poll_once().await);
        let event = next_event(&mut rx).await;
        assert!(!event.forced);
        assert!(event.environment_state.is_empty());
        assert_eq!(
            engine.current_settings(),
            Some(ProxySettings::enabled("127.0.0.1", 8080))
        );
        assert!(profile.read().unwrap().is_empty());

        assert!(!engine.poll_once().await);
        assert!(profile.read().unwrap().is_empty());

        assert!(engine.refresh().await);
        assert_eq!(profile.read().unwrap().proxy_url(), Some("http://127.0.0.1:8080"));
        assert!(next_event(&mut rx).await.forced);
    }

    #[tokio::test]
    async fn hostile_host_never_reaches_profile() {
        let fx = fixture(
            ProxySettings::from_parts(true, Some("evil\"$(touch /tmp/x)\"".into()), Some(80)),
            true,
        );
        fs::write(fx.profile.path(), "export EDITOR=vim\n").unwrap();

        assert!(fx.engine.poll_once().await);

        let content = fs::read_to_string(fx.profile.path()).unwrap();
        assert_eq!(content, "export EDITOR=vim\n");
        let current = fx.engine.current_settings().unwrap();
        assert!(!current.enabled);
        assert_eq!(current.host, None);
    }

    #[tokio::test]
    async fn detect_leaves_state_untouched() {
        let fx = fixture(ProxySettings::enabled("10.0.0.1", 3128), true);
        fx.engine.set_notification_enabled(true).unwrap();

        let detected = fx.engine.detect_system_proxy().await.unwrap();
        assert_eq!(detected, ProxySettings::enabled("10.0.0.1", 3128));
        assert_eq!(fx.engine.current_settings(), None);
        assert!(!fx.profile.path().exists());
        assert!(wait_for_messages(&fx.notifier, 1).await.is_empty());
    }

    #[tokio::test]
    async fn interval_validation() {
        let fx = fixture(ProxySettings::disabled(), false);

        let err = fx
            .engine
            .set_check_interval(Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyEnvError::InvalidInterval(500)));
        assert_eq!(fx.engine.check_interval(), Duration::from_millis(20_000));

        fx.engine
            .set_check_interval(Duration::from_millis(1000))
            .await
            .unwrap();
        assert_eq!(fx.engine.check_interval(), Duration::from_millis(1000));
        assert_eq!(
            fx.settings.get(SettingKey::CheckInterval.as_str()).unwrap(),
            Some(json!(1000))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_interval_sets_cadence() {
        let fx = fixture(ProxySettings::disabled(), false);

        assert!(fx.engine.start());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.source.reads(), 1);

        fx.engine
            .set_check_interval(Duration::from_millis(1000))
            .await
            .unwrap();
        assert!(fx.engine.is_running());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(fx.source.reads(), 4);

        fx.engine.stop().await;
        assert!(!fx.engine.is_running());
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(fx.source.reads(), 4);
    }

    #[tokio::test]
    async fn single_timer_per_engine() {
        let fx = fixture(ProxySettings::disabled(), false);
        assert!(fx.engine.start());
        assert!(!fx.engine.start());
        fx.engine.stop().await;
        assert!(fx.engine.start());
        fx.engine.stop().await;
    }

    #[tokio::test]
    async fn late_subscriber_gets_forced_replay() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), false);
        fx.engine.poll_once().await;

        let (_id, mut rx) = channel_observer(&fx.engine);
        fx.engine.stop().await;

        let event = next_event(&mut rx).await;
        assert!(event.forced);
        assert_eq!(event.system_proxy, ProxySettings::enabled("127.0.0.1", 8080));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_but_not_timer() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), false);
        let (id, mut rx) = channel_observer(&fx.engine);
        next_event(&mut rx).await;

        assert!(fx.engine.unsubscribe(id));
        assert!(!fx.engine.unsubscribe(id));
        assert_eq!(fx.engine.observer_count(), 0);
        assert!(fx.engine.is_running());

        fx.engine.refresh().await;
        assert_no_event(&mut rx).await;
        fx.engine.stop().await;
    }

    #[tokio::test]
    async fn shutdown_clears_regardless_of_sync() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), true);
        let (_id, mut rx) = channel_observer(&fx.engine);
        next_event(&mut rx).await;
        assert!(!fx.profile.read().unwrap().is_empty());

        fx.settings
            .set(SettingKey::SyncEnabled.as_str(), &json!(false))
            .unwrap();
        fx.engine.shutdown().await;

        assert!(fx.profile.read().unwrap().is_empty());
        assert!(!fx.engine.is_running());
        assert_eq!(fx.engine.observer_count(), 0);
    }

    #[tokio::test]
    async fn clear_environment_ignores_policy() {
        let fx = fixture(ProxySettings::enabled("127.0.0.1", 8080), true);
        fx.engine.poll_once().await;

        fx.engine.clear_environment().await.unwrap();
        assert!(fx.engine.environment_state().unwrap().is_empty());
    }

    #[tokio::test]
    async fn policy_reads_through_store() {
        let fx = fixture(ProxySettings::disabled(), false);
        assert!(!fx.engine.sync_enabled());

        fx.settings
            .set(SettingKey::NotificationEnabled.as_str(), &json!(true))
            .unwrap();
        assert!(fx.engine.notification_enabled());
        assert!(fx.engine.policy().notification_enabled);
    }
}
