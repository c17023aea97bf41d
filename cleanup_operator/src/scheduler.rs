//! Reconciliation scheduler
//!
//! Turns timer ticks, `Cleanup` creations and configuration updates into
//! cleanup cycles. Cycles never overlap: they all take the same lock, timer
//! ticks that find it taken are dropped. Within a cycle namespaces run
//! concurrently and fail independently.

use std::{
    collections::HashSet,
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::Utc;
use futures::{stream, FutureExt, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{runtime::watcher, ResourceExt};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::{trigger_requested, ConfigStore, OperatorConfig, CONFIG_MAP_NAME};
use crate::crd::{Cleanup, CleanupStatus};
use crate::executor::CleanupResult;
use crate::namespace::{cleanup_namespace, CycleSettings, NamespaceOutcome, NamespaceReport};
use crate::store::{ClusterBackend, TriggerClear};

/// Everything the scheduler reacts to.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TimerTick,
    /// A `Cleanup` object was created (or replayed by a fresh watch)
    ResourceCreated(Box<Cleanup>),
    /// The configuration ConfigMap was added or modified
    ConfigChanged(Box<ConfigMap>),
    /// The configuration ConfigMap carries the manual trigger annotation
    ManualTriggerRequested(Box<ConfigMap>),
}

/// Events for one observed version of the configuration ConfigMap, in the
/// order they have to be dispatched.
pub fn config_events(object: ConfigMap) -> Vec<SchedulerEvent> {
    if trigger_requested(&object) {
        vec![
            SchedulerEvent::ConfigChanged(Box::new(object.clone())),
            SchedulerEvent::ManualTriggerRequested(Box::new(object)),
        ]
    } else {
        vec![SchedulerEvent::ConfigChanged(Box::new(object))]
    }
}

pub fn cleanup_watch_events(event: watcher::Event<Cleanup>) -> Vec<SchedulerEvent> {
    match event {
        watcher::Event::Apply(cleanup) | watcher::Event::InitApply(cleanup) => {
            vec![SchedulerEvent::ResourceCreated(Box::new(cleanup))]
        }
        _ => vec![],
    }
}

/// Deleting the configuration ConfigMap does not reset the configuration, the
/// last good snapshot stays active.
pub fn config_watch_events(event: watcher::Event<ConfigMap>) -> Vec<SchedulerEvent> {
    match event {
        watcher::Event::Apply(object) | watcher::Event::InitApply(object) => config_events(object),
        watcher::Event::Delete(_) => {
            warn!(
                "{} was deleted, keeping the current configuration",
                CONFIG_MAP_NAME
            );
            vec![]
        }
        _ => vec![],
    }
}

/// The timer period to switch to after a configuration update, if any.
pub fn next_period(current: Duration, config: &OperatorConfig) -> Option<Duration> {
    let next = config.interval();
    (next != current).then_some(next)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTrigger {
    Timer,
    CustomResource,
    ManualAnnotation,
    Once,
}

impl fmt::Display for CycleTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleTrigger::Timer => "timer",
            CycleTrigger::CustomResource => "custom resource",
            CycleTrigger::ManualAnnotation => "manual annotation",
            CycleTrigger::Once => "one-shot",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPhase {
    #[default]
    Idle,
    /// A triggered cycle or an annotation removal is in progress
    Running {
        /// The newest observation had no `now`
        absent: bool,
        /// `now` reappeared after being absent, another cycle is owed
        rerun: bool,
    },
    /// The cycle ran but the annotation could not be removed
    RemovalPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    RunCycle,
    RetryRemoval,
    Ignore,
}

/// Consume-once state of the manual trigger annotation.
///
/// Every `now` that follows an observation without it is a new request, even
/// when both arrive while an earlier request is still being served.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TriggerLatch {
    phase: TriggerPhase,
    /// resourceVersion of the newest observation carrying `now`
    version: Option<String>,
}

impl TriggerLatch {
    pub fn phase(&self) -> TriggerPhase {
        self.phase
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Feeds one observation of the annotation; `trigger_set` is whether it
    /// currently reads `now`.
    pub fn observe(&mut self, trigger_set: bool, version: Option<String>) -> TriggerAction {
        if trigger_set {
            self.version = version;
        }
        match (self.phase, trigger_set) {
            (TriggerPhase::Idle, true) => {
                self.phase = TriggerPhase::Running {
                    absent: false,
                    rerun: false,
                };
                TriggerAction::RunCycle
            }
            (TriggerPhase::Running { absent: true, .. }, true) => {
                self.phase = TriggerPhase::Running {
                    absent: false,
                    rerun: true,
                };
                TriggerAction::Ignore
            }
            (TriggerPhase::Running { rerun, .. }, false) => {
                self.phase = TriggerPhase::Running {
                    absent: true,
                    rerun,
                };
                TriggerAction::Ignore
            }
            (TriggerPhase::RemovalPending, true) => {
                self.phase = TriggerPhase::Running {
                    absent: false,
                    rerun: false,
                };
                TriggerAction::RetryRemoval
            }
            (TriggerPhase::RemovalPending, false) => {
                self.phase = TriggerPhase::Idle;
                TriggerAction::Ignore
            }
            (TriggerPhase::Idle, false) | (TriggerPhase::Running { absent: false, .. }, true) => {
                TriggerAction::Ignore
            }
        }
    }

    /// Claims an owed cycle, if one was requested while running.
    pub fn take_rerun(&mut self) -> bool {
        match self.phase {
            TriggerPhase::Running {
                absent,
                rerun: true,
            } => {
                self.phase = TriggerPhase::Running {
                    absent,
                    rerun: false,
                };
                true
            }
            _ => false,
        }
    }

    /// Settles the latch after a removal attempt made for `attempted`.
    pub fn finish_removal(&mut self, removed: bool, attempted: Option<&str>) -> TriggerAction {
        let TriggerPhase::Running { absent, rerun } = self.phase else {
            return TriggerAction::Ignore;
        };
        if rerun {
            self.phase = TriggerPhase::Running {
                absent,
                rerun: false,
            };
            return TriggerAction::RunCycle;
        }
        if removed || absent {
            self.phase = TriggerPhase::Idle;
            return TriggerAction::Ignore;
        }
        if self.version.as_deref() != attempted {
            // A newer version with `now` arrived during the attempt
            return TriggerAction::RetryRemoval;
        }
        self.phase = TriggerPhase::RemovalPending;
        TriggerAction::Ignore
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub trigger: CycleTrigger,
    pub dry_run: bool,
    pub namespaces: Vec<NamespaceReport>,
    pub total: CleanupResult,
}

impl CycleReport {
    fn count(&self, pred: impl Fn(&NamespaceOutcome) -> bool) -> usize {
        self.namespaces.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn failed_count(&self) -> usize {
        self.count(|o| matches!(o, NamespaceOutcome::Failed(_)))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|o| matches!(o, NamespaceOutcome::Skipped { .. }))
    }

    pub fn cancelled_count(&self) -> usize {
        self.count(|o| matches!(o, NamespaceOutcome::Cancelled))
    }
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct Scheduler {
    backend: Arc<dyn ClusterBackend>,
    config: ConfigStore,
    cycle_lock: tokio::sync::Mutex<()>,
    latch: Mutex<TriggerLatch>,
    /// UIDs of `Cleanup` objects whose cycle already ran in this process
    acknowledged: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
    env: EnvLookup,
}

impl Scheduler {
    pub fn new(backend: Arc<dyn ClusterBackend>, shutdown: CancellationToken) -> Self {
        Scheduler {
            backend,
            config: ConfigStore::new(OperatorConfig::default()),
            cycle_lock: tokio::sync::Mutex::new(()),
            latch: Mutex::new(TriggerLatch::default()),
            acknowledged: Mutex::new(HashSet::new()),
            shutdown,
            env: Box::new(|var| std::env::var(var).ok()),
        }
    }

    /// Replaces the process environment as the source of overrides.
    pub fn with_env_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Box::new(lookup);
        self
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    fn latch(&self) -> MutexGuard<'_, TriggerLatch> {
        self.latch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads the configuration ConfigMap from the cluster and publishes the
    /// result. Falls back to defaults plus environment if it cannot be read.
    pub async fn load_initial(&self) -> Arc<OperatorConfig> {
        match self.backend.fetch_config_map().await {
            Ok(object) => {
                if object.is_none() {
                    info!("Configuration ConfigMap not found, using defaults and environment");
                }
                self.reload(object.as_ref());
            }
            Err(err) => {
                warn!("Failed to read configuration from cluster: {}", err);
                self.reload(None);
            }
        }
        self.config.snapshot()
    }

    /// Builds a new snapshot from `object` and the environment. On error the
    /// previous snapshot stays in place.
    pub fn reload(&self, object: Option<&ConfigMap>) -> Arc<OperatorConfig> {
        match OperatorConfig::load(object, &self.env) {
            Ok(config) => {
                let config = self.config.replace(config);
                info!("Configuration loaded: {:?}", config);
                config
            }
            Err(err) => {
                warn!("Invalid configuration, keeping the previous one: {}", err);
                self.config.snapshot()
            }
        }
    }

    pub async fn dispatch(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::TimerTick => {
                if self.try_run_cycle(CycleTrigger::Timer).await.is_none() {
                    debug!("Cleanup cycle already running, skipping timer tick");
                }
            }
            SchedulerEvent::ResourceCreated(cleanup) => self.handle_created(&cleanup).await,
            SchedulerEvent::ConfigChanged(object) => {
                info!("Configuration changed, reloading");
                self.reload(Some(&object));
                if !trigger_requested(&object) {
                    self.latch().observe(false, object.metadata.resource_version.clone());
                }
            }
            SchedulerEvent::ManualTriggerRequested(object) => {
                let action = self.latch().observe(
                    trigger_requested(&object),
                    object.metadata.resource_version.clone(),
                );
                self.handle_trigger(action).await;
            }
        }
    }

    /// Serves one manual trigger until the latch no longer asks for work:
    /// owed cycles run before the annotation is removed.
    async fn handle_trigger(&self, mut action: TriggerAction) {
        if action == TriggerAction::Ignore {
            debug!("Trigger annotation already being handled");
            return;
        }
        loop {
            match action {
                TriggerAction::RunCycle => {
                    info!("Manual cleanup triggered via annotation");
                    self.run_cycle(CycleTrigger::ManualAnnotation).await;
                    if self.latch().take_rerun() {
                        action = TriggerAction::RunCycle;
                        continue;
                    }
                }
                TriggerAction::RetryRemoval => {
                    info!("Trigger annotation still present, retrying its removal");
                }
                TriggerAction::Ignore => return,
            }
            let version = self.latch().version().map(str::to_owned);
            let removed = self.consume_trigger(version.clone()).await;
            action = self.latch().finish_removal(removed, version.as_deref());
        }
    }

    async fn consume_trigger(&self, version: Option<String>) -> bool {
        match self.backend.clear_trigger(version, Utc::now()).await {
            Ok(TriggerClear::Cleared) => {
                info!("Removed trigger annotation");
                true
            }
            Ok(TriggerClear::Superseded) => {
                debug!("Trigger annotation changed while the cycle ran");
                false
            }
            Ok(outcome) => {
                debug!("Trigger annotation not removed: {:?}", outcome);
                true
            }
            Err(err) => {
                error!("Failed to remove trigger annotation: {}", err);
                false
            }
        }
    }

    async fn handle_created(&self, cleanup: &Cleanup) {
        let name = format!(
            "{}/{}",
            cleanup.namespace().unwrap_or_default(),
            cleanup.name_any()
        );
        if cleanup.status.is_some() {
            debug!("Cleanup {} already acknowledged", name);
            return;
        }
        let key = cleanup.uid().unwrap_or_else(|| name.clone());
        let first_time = self
            .acknowledged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        if !first_time {
            debug!("Cleanup {} already handled", name);
            return;
        }

        info!("Cleanup CR {} created with spec: {:?}", name, cleanup.spec);
        let report = self.run_cycle(CycleTrigger::CustomResource).await;

        let status = CleanupStatus::acknowledged(report.total, report.dry_run, Utc::now());
        if let Err(err) = self.backend.acknowledge_cleanup(cleanup, status).await {
            warn!("Failed to update status of Cleanup {}: {}", name, err);
        }
    }

    /// Runs one sweep over every configured namespace. Waits for any cycle
    /// already in progress.
    pub async fn run_cycle(&self, trigger: CycleTrigger) -> CycleReport {
        let running = self.cycle_lock.lock().await;
        self.sweep(trigger, running).await
    }

    /// Like [`Scheduler::run_cycle`], but gives up when a cycle is in progress.
    pub async fn try_run_cycle(&self, trigger: CycleTrigger) -> Option<CycleReport> {
        let running = self.cycle_lock.try_lock().ok()?;
        Some(self.sweep(trigger, running).await)
    }

    async fn sweep(
        &self,
        trigger: CycleTrigger,
        _running: tokio::sync::MutexGuard<'_, ()>,
    ) -> CycleReport {
        let config = self.config.snapshot();
        let settings = CycleSettings::new(&config, Utc::now());

        info!(
            "Starting {} cleanup cycle over {} namespaces{}",
            trigger,
            config.namespaces.len(),
            if settings.dry_run { " (dry run)" } else { "" }
        );

        let namespaces: Vec<NamespaceReport> = stream::iter(config.namespaces.iter().cloned())
            .map(|namespace| self.process_namespace(namespace, &settings))
            .buffered(config.max_concurrent_namespaces.max(1))
            .collect()
            .await;

        let report = CycleReport {
            trigger,
            dry_run: settings.dry_run,
            total: namespaces.iter().map(|r| r.outcome.result()).sum(),
            namespaces,
        };

        info!(
            "Cleanup cycle completed. Total: {} secrets, {} configmaps deleted",
            report.total.secrets_deleted, report.total.configmaps_deleted
        );
        let (failed, skipped, cancelled) = (
            report.failed_count(),
            report.skipped_count(),
            report.cancelled_count(),
        );
        if failed + skipped + cancelled > 0 {
            warn!(
                "{} namespaces failed, {} skipped, {} cancelled",
                failed, skipped, cancelled
            );
        }

        report
    }

    async fn process_namespace(
        &self,
        namespace: String,
        settings: &CycleSettings,
    ) -> NamespaceReport {
        if self.shutdown.is_cancelled() {
            debug!("Shutting down, not starting namespace {}", namespace);
            return NamespaceReport {
                namespace,
                outcome: NamespaceOutcome::Cancelled,
            };
        }

        let store = self.backend.namespace_store(&namespace);
        let run = cleanup_namespace(store.as_ref(), &namespace, settings);
        let outcome = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                error!("Error cleaning up namespace {}: {:#}", namespace, err);
                NamespaceOutcome::Failed(format!("{:#}", err))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Panic while cleaning up namespace {}: {}", namespace, message);
                NamespaceOutcome::Failed(message)
            }
        };

        if let NamespaceOutcome::Cleaned(result) = &outcome {
            info!(
                "Namespace {} done: {} secrets, {} configmaps deleted",
                namespace, result.secrets_deleted, result.configmaps_deleted
            );
        }

        NamespaceReport { namespace, outcome }
    }
}
