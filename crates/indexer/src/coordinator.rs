use crate::activity::ActivityLog;
use crate::config::{RiverConfig, DATETIME_VALUE_TYPE};
use crate::project_indexer::{
    CancelFlag, IndexingContext, ProjectIndexer, RunOutcome, UpdateMode,
};
use river_doc_builder::{BuilderConfig, DocumentBuilder, IssuePreprocessor};
use river_search_store::{SearchBackend, WatermarkStore};
use river_upstream::JiraClient;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Scheduling knobs of the coordinator loop.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub river_name: String,
    /// Worker budget; at least 1.
    pub max_indexing_threads: usize,
    pub index_update_period: Duration,
    /// `None` disables periodic full updates; forced ones still run.
    pub index_full_update_period: Option<Duration>,
    pub tick_interval: Duration,
    pub projects_refresh_interval: Duration,
    /// Static project list; when non-empty, discovery never runs.
    pub project_keys_indexed: Vec<String>,
    pub project_keys_excluded: Vec<String>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            river_name: "jira_river".to_string(),
            max_indexing_threads: 1,
            index_update_period: Duration::from_secs(5 * 60),
            index_full_update_period: Some(Duration::from_secs(12 * 3600)),
            tick_interval: Duration::from_secs(30),
            projects_refresh_interval: Duration::from_secs(30 * 60),
            project_keys_indexed: Vec::new(),
            project_keys_excluded: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct ProjectState {
    last_incremental_start: Option<Instant>,
    last_full_start: Option<Instant>,
    force_full: bool,
    in_flight: Option<UpdateMode>,
    dispatched_at: Option<Instant>,
}

#[derive(Default)]
struct ProjectTable {
    /// Keys in discovery order; drives round-robin fairness.
    order: Vec<String>,
    states: HashMap<String, ProjectState>,
    /// Index into `order` where the next dispatch scan starts.
    cursor: usize,
    last_refresh: Option<Instant>,
}

struct WorkerDone {
    project_key: String,
    outcome: RunOutcome,
}

enum Command {
    Shutdown,
}

struct CoordinatorInner {
    settings: CoordinatorSettings,
    ctx: Arc<IndexingContext>,
    projects: Mutex<ProjectTable>,
    cancel: CancelFlag,
}

/// Long-lived scheduler: discovers projects, decides when each one is due
/// for an incremental or full update and dispatches workers under a bounded
/// parallelism budget with one slot kept free for incremental work.
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
    command_tx: mpsc::Sender<Command>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Spawn the coordinator loop. The first tick fires immediately.
    pub fn start(settings: CoordinatorSettings, ctx: Arc<IndexingContext>) -> Self {
        let (command_tx, mut command_rx) = mpsc::channel(16);
        let tick_interval = settings.tick_interval;
        let inner = Arc::new(CoordinatorInner {
            settings,
            ctx,
            projects: Mutex::new(ProjectTable::default()),
            cancel: CancelFlag::new(),
        });

        let loop_inner = inner.clone();
        let handle = tokio::spawn(async move {
            // Workers push their results here; the loop drains them between
            // ticks so coordinator state never needs more than one lock.
            let (result_tx, mut result_rx) = mpsc::channel::<WorkerDone>(64);
            let mut tick = tokio::time::interval(tick_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if loop_inner.cancel.is_cancelled() {
                            break;
                        }
                        loop_inner.run_tick(&result_tx).await;
                    }
                    Some(done) = result_rx.recv() => {
                        loop_inner.report_finished(done).await;
                    }
                    cmd = command_rx.recv() => {
                        match cmd {
                            Some(Command::Shutdown) | None => break,
                        }
                    }
                }
            }
            log::info!("river {} coordinator stopped", loop_inner.settings.river_name);
        });

        Self {
            inner,
            command_tx,
            loop_handle: Mutex::new(Some(handle)),
        }
    }

    /// Wire a river from validated settings and start it: document builder,
    /// upstream client (with the derived required-fields list), watermark
    /// store and optional activity log. `state_index` is the host-supplied
    /// private index holding the watermarks.
    pub fn from_config(
        config: &RiverConfig,
        backend: Arc<dyn SearchBackend>,
        state_index: impl Into<String>,
        preprocessors: Vec<Box<dyn IssuePreprocessor>>,
    ) -> crate::error::Result<Self> {
        let builder_config = BuilderConfig::from_settings(&config.index.document_settings)?;
        let builder = DocumentBuilder::new(
            config.river_name.clone(),
            config.jira.url_base.clone(),
            config.index.issue_type.clone(),
            builder_config,
            preprocessors,
        )?;
        let client = JiraClient::new(config.jira_client_config(), builder.required_fields())?;
        let watermarks = WatermarkStore::new(backend.clone(), state_index, DATETIME_VALUE_TYPE);
        let activity = config.activity_log.as_ref().map(|settings| {
            ActivityLog::new(
                backend.clone(),
                settings.index.clone(),
                settings.doc_type.clone(),
            )
        });
        let ctx = Arc::new(IndexingContext {
            source: Arc::new(client),
            backend,
            builder: Arc::new(builder),
            watermarks,
            activity,
            index_name: config.index.index_name.clone(),
            max_issues_per_request: config.jira.max_issues_per_request,
        });

        let settings = CoordinatorSettings {
            river_name: config.river_name.clone(),
            max_indexing_threads: config.jira.max_indexing_threads,
            index_update_period: config.jira.index_update_period,
            index_full_update_period: config.jira.index_full_update_period,
            tick_interval: config.jira.coordinator_tick_interval,
            projects_refresh_interval: config.jira.projects_refresh_interval,
            project_keys_indexed: config.jira.project_keys_indexed.clone(),
            project_keys_excluded: config.jira.project_keys_excluded.clone(),
        };
        Ok(Self::start(settings, ctx))
    }

    /// Request a full reindex of one project (returns its key) or of all
    /// known projects (returns the comma-joined keys). `None` when a named
    /// project is unknown.
    pub fn force_full_reindex(&self, project_key: Option<&str>) -> Option<String> {
        let mut table = match self.inner.projects.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        match project_key {
            Some(key) => table.states.get_mut(key).map(|state| {
                state.force_full = true;
                key.to_string()
            }),
            None => {
                for state in table.states.values_mut() {
                    state.force_full = true;
                }
                Some(table.order.join(","))
            }
        }
    }

    /// Keys currently scheduled for indexing, in discovery order.
    #[must_use]
    pub fn indexed_project_keys(&self) -> Vec<String> {
        match self.inner.projects.lock() {
            Ok(table) => table.order.clone(),
            Err(poisoned) => poisoned.into_inner().order.clone(),
        }
    }

    /// Signal shutdown and wait for the loop to stop. In-flight runs
    /// observe the cancellation at their next suspension point and exit
    /// without reporting.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let _ = self.command_tx.send(Command::Shutdown).await;
        let handle = self
            .loop_handle
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        let _ = self.command_tx.try_send(Command::Shutdown);
    }
}

impl CoordinatorInner {
    async fn run_tick(&self, result_tx: &mpsc::Sender<WorkerDone>) {
        if let Err(err) = self.ensure_projects().await {
            // Keep the previous list and try again next tick; a flaky
            // upstream must not stall projects already known.
            log::error!(
                "river {}: project list refresh failed, deferring dispatches: {err}",
                self.settings.river_name
            );
            return;
        }

        let now = Instant::now();
        let planned = {
            let mut table = match self.projects.lock() {
                Ok(table) => table,
                Err(poisoned) => poisoned.into_inner(),
            };
            plan_dispatches(&mut table, now, &self.settings)
        };

        for (project_key, mode) in planned {
            log::info!(
                "river {}: dispatching {} update of project {project_key}",
                self.settings.river_name,
                mode.as_str()
            );
            let indexer = ProjectIndexer::new(
                self.ctx.clone(),
                project_key.clone(),
                mode,
                self.cancel.clone(),
            );
            let tx = result_tx.clone();
            tokio::spawn(async move {
                let outcome = indexer.run().await;
                let _ = tx
                    .send(WorkerDone {
                        project_key,
                        outcome,
                    })
                    .await;
            });
        }
    }

    async fn ensure_projects(&self) -> crate::error::Result<()> {
        if !self.settings.project_keys_indexed.is_empty() {
            let mut table = match self.projects.lock() {
                Ok(table) => table,
                Err(poisoned) => poisoned.into_inner(),
            };
            if table.order.is_empty() {
                install_project_list(&mut table, self.settings.project_keys_indexed.clone());
            }
            return Ok(());
        }

        let needs_refresh = {
            let table = match self.projects.lock() {
                Ok(table) => table,
                Err(poisoned) => poisoned.into_inner(),
            };
            table.last_refresh.map_or(true, |at| {
                at.elapsed() >= self.settings.projects_refresh_interval
            })
        };
        if !needs_refresh {
            return Ok(());
        }

        let keys = self.ctx.source.list_project_keys().await?;
        let excluded: HashSet<&str> = self
            .settings
            .project_keys_excluded
            .iter()
            .map(String::as_str)
            .collect();
        let keys: Vec<String> = keys
            .into_iter()
            .filter(|key| !excluded.contains(key.as_str()))
            .collect();
        log::debug!(
            "river {}: indexing {} project(s) after refresh",
            self.settings.river_name,
            keys.len()
        );

        let mut table = match self.projects.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        install_project_list(&mut table, keys);
        table.last_refresh = Some(Instant::now());
        Ok(())
    }

    async fn report_finished(&self, done: WorkerDone) {
        let report = {
            let mut table = match self.projects.lock() {
                Ok(table) => table,
                Err(poisoned) => poisoned.into_inner(),
            };
            let in_order = table.order.iter().any(|key| key == &done.project_key);
            let Some(state) = table.states.get_mut(&done.project_key) else {
                log::warn!("finished run for unknown project {}", done.project_key);
                return;
            };
            let dispatched_at = state.dispatched_at.take().unwrap_or_else(Instant::now);
            state.in_flight = None;

            let report = match done.outcome {
                RunOutcome::Interrupted => {
                    log::info!("run for project {} interrupted", done.project_key);
                    None
                }
                RunOutcome::Finished(report) => {
                    // A full update includes the incremental pull, so it
                    // satisfies both cadences.
                    state.last_incremental_start = Some(dispatched_at);
                    if report.full_update {
                        state.last_full_start = Some(dispatched_at);
                        if report.ok() {
                            state.force_full = false;
                        }
                    }
                    Some(report)
                }
            };
            if !in_order {
                // Vanished from discovery while its last run was in flight.
                table.states.remove(&done.project_key);
            }
            report
        };

        let Some(report) = report else {
            return;
        };
        match &report.error_message {
            None => log::debug!(
                "run for project {} finished: {} updated, {} deleted",
                report.project_key,
                report.issues_updated,
                report.issues_deleted
            ),
            Some(message) => log::warn!(
                "run for project {} failed: {message}",
                report.project_key
            ),
        }
        if let Some(activity) = &self.ctx.activity {
            activity.record(&report).await;
        }
    }
}

fn install_project_list(table: &mut ProjectTable, keys: Vec<String>) {
    let keep: HashSet<&String> = keys.iter().collect();
    table
        .states
        .retain(|key, state| keep.contains(key) || state.in_flight.is_some());
    for key in &keys {
        table.states.entry(key.clone()).or_default();
    }
    table.order = keys;
    if table.order.is_empty() {
        table.cursor = 0;
    } else {
        table.cursor %= table.order.len();
    }
}

/// Pick the projects to dispatch this tick: round-robin from the slot after
/// the last dispatched project, within the worker budget, keeping one slot
/// free for incremental work whenever the budget allows more than one
/// worker.
fn plan_dispatches(
    table: &mut ProjectTable,
    now: Instant,
    settings: &CoordinatorSettings,
) -> Vec<(String, UpdateMode)> {
    let mut planned = Vec::new();
    if table.order.is_empty() {
        return planned;
    }

    let budget = settings.max_indexing_threads.max(1);
    let full_budget = if budget > 1 { budget - 1 } else { budget };
    let mut in_flight = 0usize;
    let mut full_in_flight = 0usize;
    for state in table.states.values() {
        match state.in_flight {
            Some(UpdateMode::Full) => {
                in_flight += 1;
                full_in_flight += 1;
            }
            Some(UpdateMode::Incremental) => in_flight += 1,
            None => {}
        }
    }

    let len = table.order.len();
    for offset in 0..len {
        if in_flight >= budget {
            break;
        }
        let idx = (table.cursor + offset) % len;
        let key = table.order[idx].clone();
        let Some(state) = table.states.get_mut(&key) else {
            continue;
        };
        if state.in_flight.is_some() {
            continue;
        }
        let Some(mode) = due_mode(state, now, settings) else {
            continue;
        };
        if mode == UpdateMode::Full && full_in_flight >= full_budget {
            // Full slots are exhausted; the project stays due and an
            // incremental-due project later in the scan may still fit.
            continue;
        }

        state.in_flight = Some(mode);
        state.dispatched_at = Some(now);
        in_flight += 1;
        if mode == UpdateMode::Full {
            full_in_flight += 1;
        }
        table.cursor = (idx + 1) % len;
        planned.push((key, mode));
    }
    planned
}

fn due_mode(
    state: &ProjectState,
    now: Instant,
    settings: &CoordinatorSettings,
) -> Option<UpdateMode> {
    if state.force_full {
        return Some(UpdateMode::Full);
    }
    if let Some(period) = settings.index_full_update_period {
        let due = state
            .last_full_start
            .map_or(true, |at| now.duration_since(at) >= period);
        if due {
            return Some(UpdateMode::Full);
        }
    }
    let incremental_due = state
        .last_incremental_start
        .map_or(true, |at| now.duration_since(at) >= settings.index_update_period);
    incremental_due.then_some(UpdateMode::Incremental)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings(threads: usize) -> CoordinatorSettings {
        CoordinatorSettings {
            max_indexing_threads: threads,
            index_update_period: Duration::from_secs(60),
            index_full_update_period: Some(Duration::from_secs(3600)),
            ..CoordinatorSettings::default()
        }
    }

    fn table_with(keys: &[&str]) -> ProjectTable {
        let mut table = ProjectTable::default();
        install_project_list(&mut table, keys.iter().map(ToString::to_string).collect());
        table
    }

    fn fresh(table: &mut ProjectTable, key: &str, now: Instant) {
        let state = table.states.get_mut(key).expect("state");
        state.last_incremental_start = Some(now);
        state.last_full_start = Some(now);
    }

    #[test]
    fn new_projects_are_due_for_a_full_update() {
        let mut table = table_with(&["A"]);
        let planned = plan_dispatches(&mut table, Instant::now(), &settings(1));
        assert_eq!(planned, vec![("A".to_string(), UpdateMode::Full)]);
    }

    #[test]
    fn fresh_projects_are_not_due() {
        let now = Instant::now();
        let mut table = table_with(&["A"]);
        fresh(&mut table, "A", now);
        assert!(plan_dispatches(&mut table, now, &settings(1)).is_empty());
    }

    #[test]
    fn force_full_overrides_cadence_and_disabled_full_updates() {
        let now = Instant::now();
        let mut table = table_with(&["A"]);
        fresh(&mut table, "A", now);
        table.states.get_mut("A").expect("state").force_full = true;

        let mut no_full = settings(1);
        no_full.index_full_update_period = None;
        let planned = plan_dispatches(&mut table, now, &no_full);
        assert_eq!(planned, vec![("A".to_string(), UpdateMode::Full)]);
    }

    #[test]
    fn disabled_full_updates_fall_back_to_incremental() {
        let mut table = table_with(&["A"]);
        let mut no_full = settings(1);
        no_full.index_full_update_period = None;
        let planned = plan_dispatches(&mut table, Instant::now(), &no_full);
        assert_eq!(planned, vec![("A".to_string(), UpdateMode::Incremental)]);
    }

    #[test]
    fn budget_caps_dispatches() {
        let mut table = table_with(&["A", "B", "C"]);
        let mut no_full = settings(2);
        no_full.index_full_update_period = None;
        let planned = plan_dispatches(&mut table, Instant::now(), &no_full);
        assert_eq!(
            planned,
            vec![
                ("A".to_string(), UpdateMode::Incremental),
                ("B".to_string(), UpdateMode::Incremental),
            ]
        );
    }

    #[test]
    fn full_dispatches_are_capped_below_the_budget() {
        let mut table = table_with(&["A", "B", "C"]);
        let planned = plan_dispatches(&mut table, Instant::now(), &settings(2));
        assert_eq!(planned, vec![("A".to_string(), UpdateMode::Full)]);
    }

    #[test]
    fn one_slot_is_reserved_for_incremental_work() {
        let now = Instant::now();
        let mut table = table_with(&["A", "B", "C"]);
        // A and B want a full update, C only an incremental one.
        fresh(&mut table, "C", now);
        table
            .states
            .get_mut("C")
            .expect("state")
            .last_incremental_start = None;

        let planned = plan_dispatches(&mut table, now, &settings(2));
        assert_eq!(
            planned,
            vec![
                ("A".to_string(), UpdateMode::Full),
                ("C".to_string(), UpdateMode::Incremental),
            ]
        );
    }

    #[test]
    fn single_worker_budget_has_no_reservation() {
        let mut table = table_with(&["A"]);
        let planned = plan_dispatches(&mut table, Instant::now(), &settings(1));
        assert_eq!(planned, vec![("A".to_string(), UpdateMode::Full)]);
    }

    #[test]
    fn running_project_is_never_dispatched_twice() {
        let mut table = table_with(&["A", "B"]);
        table.states.get_mut("A").expect("state").in_flight = Some(UpdateMode::Full);
        let planned = plan_dispatches(&mut table, Instant::now(), &settings(4));
        assert_eq!(planned, vec![("B".to_string(), UpdateMode::Full)]);
    }

    #[test]
    fn in_flight_runs_count_against_the_budget() {
        let mut table = table_with(&["A", "B"]);
        table.states.get_mut("A").expect("state").in_flight = Some(UpdateMode::Incremental);
        assert!(plan_dispatches(&mut table, Instant::now(), &settings(1)).is_empty());
    }

    #[test]
    fn scan_starts_after_the_last_dispatched_project() {
        let now = Instant::now();
        let mut table = table_with(&["A", "B", "C"]);
        let first = plan_dispatches(&mut table, now, &settings(1));
        assert_eq!(first, vec![("A".to_string(), UpdateMode::Full)]);

        // A finishes; everything is due again, but the scan resumes at B.
        let state = table.states.get_mut("A").expect("state");
        state.in_flight = None;
        let second = plan_dispatches(&mut table, now, &settings(1));
        assert_eq!(second, vec![("B".to_string(), UpdateMode::Full)]);
    }

    #[tokio::test]
    async fn river_wires_from_settings_and_shuts_down() {
        let config = RiverConfig::from_settings(
            "river_test",
            &serde_json::json!({"jira": {
                "urlBase": "https://issues.invalid",
                "projectKeysIndexed": "ORG",
                "coordinatorTickInterval": 3600
            }}),
        )
        .expect("config");
        let backend = Arc::new(river_search_store::MemoryBackend::new());
        let coordinator =
            Coordinator::from_config(&config, backend, "_river_state", Vec::new()).expect("river");
        coordinator.close().await;
    }

    #[test]
    fn refresh_keeps_states_of_surviving_projects() {
        let now = Instant::now();
        let mut table = table_with(&["A", "B"]);
        fresh(&mut table, "A", now);
        install_project_list(
            &mut table,
            vec!["A".to_string(), "C".to_string()],
        );
        assert!(table.states.get("A").expect("state").last_full_start.is_some());
        assert!(!table.states.contains_key("B"));
        assert!(table.states.contains_key("C"));
        assert_eq!(table.order, vec!["A".to_string(), "C".to_string()]);
    }
}
