use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineConnection, EngineError};
use crate::lease::{Lease, LeaseGuard, LeaseKind};
use crate::load_sql::LoadPlan;
use crate::records::{Record, ResultSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    LoadingSource,
    SourceLoaded,
    Querying,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub source: String,
    pub query: String,
    pub table_loaded: bool,
    pub loading: bool,
    pub querying: bool,
    pub dataset: Option<Arc<[Record]>>,
    pub error: Option<String>,
}

impl SessionSnapshot {
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        if self.loading {
            SessionPhase::LoadingSource
        } else if self.source.is_empty() {
            SessionPhase::Idle
        } else if self.querying {
            SessionPhase::Querying
        } else if self.error.is_some() {
            SessionPhase::Failed
        } else if self.dataset.is_some() {
            SessionPhase::Ready
        } else if self.table_loaded {
            SessionPhase::SourceLoaded
        } else {
            SessionPhase::Idle
        }
    }
}

#[derive(Debug)]
struct Inner<C: EngineConnection> {
    state: SessionSnapshot,
    leases: LeaseGuard<C>,
    // Completion signal of the last statement that rewrites the working
    // table (a commit or a reset). The next one waits for it.
    namespace: Option<watch::Receiver<bool>>,
}

impl<C: EngineConnection> Inner<C> {
    fn claim_namespace(&mut self) -> (Option<watch::Receiver<bool>>, watch::Sender<bool>) {
        let (done, turn) = watch::channel(false);
        (self.namespace.replace(turn), done)
    }
}

struct Shared<E: Engine> {
    engine: E,
    plan: LoadPlan,
    inner: Mutex<Inner<E::Connection>>,
    updates: watch::Sender<SessionSnapshot>,
}

/// Sequences dataset loads and queries against one engine. The last source
/// change is authoritative and earlier completions are dropped. Methods must
/// be called from within a tokio runtime.
pub struct SessionController<E: Engine> {
    shared: Arc<Shared<E>>,
}

impl<E: Engine> SessionController<E> {
    #[must_use]
    pub fn new(engine: E, plan: LoadPlan) -> Self {
        let (updates, _) = watch::channel(SessionSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                engine,
                plan,
                inner: Mutex::new(Inner {
                    state: SessionSnapshot::default(),
                    leases: LeaseGuard::new(),
                    namespace: None,
                }),
                updates,
            }),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.lock().state.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.updates.subscribe()
    }

    pub fn set_source(&self, source: impl Into<String>) -> JoinHandle<()> {
        let source = source.into();
        let mut inner = self.shared.lock();
        inner.leases.cancel_all();

        let state = &mut inner.state;
        state.source.clone_from(&source);
        state.dataset = None;
        state.error = None;
        state.table_loaded = false;
        state.querying = false;

        if source.is_empty() {
            let (previous, done) = inner.claim_namespace();
            inner.state.query.clear();
            inner.state.loading = false;
            self.shared.publish(&inner);
            drop(inner);

            info!("resetting engine");
            let shared = Arc::clone(&self.shared);
            return tokio::spawn(async move {
                wait_for_namespace(previous).await;
                if let Err(error) = shared.engine.reset().await {
                    warn!(%error, "engine reset failed");
                }
                done.send_replace(true);
            });
        }

        let previous = inner.namespace.clone();
        inner.state.loading = true;
        let lease = inner.leases.begin(LeaseKind::Load);
        self.shared.publish(&inner);
        drop(inner);

        info!(%source, "loading dataset");
        tokio::spawn(Arc::clone(&self.shared).run_load(lease, source, previous))
    }

    pub fn set_query(&self, query: impl Into<String>) -> Option<JoinHandle<()>> {
        let query = query.into();
        let mut inner = self.shared.lock();
        inner.state.query.clone_from(&query);

        if !inner.state.table_loaded || query.is_empty() {
            self.shared.publish(&inner);
            return None;
        }

        let handle = self.shared.start_query(&mut inner, query);
        self.shared.publish(&inner);
        Some(handle)
    }

    pub fn perform_query(&self, query: &str) -> Option<JoinHandle<()>> {
        let mut inner = self.shared.lock();
        if !inner.state.table_loaded || query.is_empty() {
            debug!("ignoring query: no table loaded");
            return None;
        }

        let handle = self.shared.start_query(&mut inner, query.to_string());
        self.shared.publish(&inner);
        Some(handle)
    }

    pub fn load_dataset(&self) -> JoinHandle<()> {
        let source = self.shared.lock().state.source.clone();
        self.set_source(source)
    }

    pub fn clear_dataset(&self) -> JoinHandle<()> {
        self.set_source(String::new())
    }

    pub async fn shutdown(self) -> Result<(), EngineError> {
        {
            let mut inner = self.shared.lock();
            inner.leases.cancel_all();
            inner.state.loading = false;
            inner.state.querying = false;
            self.shared.publish(&inner);
        }
        info!("terminating engine");
        self.shared.engine.terminate().await
    }
}

impl<E: Engine> Drop for SessionController<E> {
    fn drop(&mut self) {
        self.shared.lock().leases.cancel_all();
    }
}

impl<E: Engine> Shared<E> {
    fn lock(&self) -> MutexGuard<'_, Inner<E::Connection>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner<E::Connection>) {
        self.updates.send_replace(inner.state.clone());
    }

    fn start_query(self: &Arc<Self>, inner: &mut Inner<E::Connection>, sql: String) -> JoinHandle<()> {
        let lease = inner.leases.begin(LeaseKind::Query);
        inner.state.querying = true;
        tokio::spawn(Arc::clone(self).run_query(lease, sql))
    }

    async fn run_load(
        self: Arc<Self>,
        lease: Arc<Lease<E::Connection>>,
        source: String,
        previous: Option<watch::Receiver<bool>>,
    ) {
        // A pending reset must land before this load connects.
        wait_for_namespace(previous).await;
        if lease.is_cancelled() {
            self.abandon(&lease);
            return;
        }

        let connection = match self.engine.connect().await {
            Ok(connection) => connection,
            Err(error) => {
                self.finish_load(&lease, Err(error));
                return;
            }
        };
        let Some(connection) = lease.attach(connection) else {
            self.abandon(&lease);
            return;
        };

        let staging = self.plan.staging_table(lease.id());
        let result = match connection
            .execute(&self.plan.load_statement(&source, &staging))
            .await
        {
            Ok(()) => {
                let committed = self.commit(&lease, connection.as_ref(), &staging).await;
                if !matches!(committed, Ok(true)) {
                    self.discard(&staging).await;
                }
                committed.map(|_| ())
            }
            Err(error) => Err(error),
        };
        drop(connection);
        self.finish_load(&lease, result);
    }

    // Ok(false) when the load was superseded before it claimed its turn.
    async fn commit(
        &self,
        lease: &Lease<E::Connection>,
        connection: &E::Connection,
        staging: &str,
    ) -> Result<bool, EngineError> {
        let (previous, done) = {
            let mut inner = self.lock();
            if lease.is_cancelled() {
                return Ok(false);
            }
            inner.claim_namespace()
        };

        wait_for_namespace(previous).await;
        let result = connection
            .execute(&self.plan.commit_statement(staging))
            .await;
        done.send_replace(true);
        result.map(|()| true)
    }

    async fn discard(&self, staging: &str) {
        match self.engine.connect().await {
            Ok(connection) => {
                if let Err(error) = connection
                    .execute(&self.plan.discard_statement(staging))
                    .await
                {
                    debug!(%error, staging, "failed to drop staging table");
                }
                connection.close();
            }
            Err(error) => debug!(%error, staging, "engine unavailable, staging table left behind"),
        }
    }

    fn finish_load(self: &Arc<Self>, lease: &Lease<E::Connection>, result: Result<(), EngineError>) {
        let mut inner = self.lock();
        inner.leases.settle(lease);
        if lease.is_cancelled() {
            debug!(lease = ?lease.id(), "discarding superseded load");
            return;
        }

        inner.state.loading = false;
        match result {
            Ok(()) => {
                inner.state.table_loaded = true;
                if inner.state.query.is_empty() {
                    info!("setting default query");
                    inner.state.query = self.plan.default_query();
                }
                let query = inner.state.query.clone();
                // Detached: the query lease keeps its own bookkeeping.
                drop(self.start_query(&mut inner, query));
            }
            Err(error) => {
                warn!(%error, source = %inner.state.source, "dataset load failed");
                inner.state.error = Some(error.to_string());
                inner.state.dataset = None;
                inner.state.table_loaded = false;
                inner.state.query.clear();
            }
        }
        self.publish(&inner);
    }

    async fn run_query(self: Arc<Self>, lease: Arc<Lease<E::Connection>>, sql: String) {
        let connection = match self.engine.connect().await {
            Ok(connection) => connection,
            Err(error) => {
                self.finish_query(&lease, Err(error));
                return;
            }
        };
        let Some(connection) = lease.attach(connection) else {
            self.abandon(&lease);
            return;
        };

        let result = connection.query(&sql).await;
        self.finish_query(&lease, result);
    }

    fn finish_query(&self, lease: &Lease<E::Connection>, result: Result<ResultSet, EngineError>) {
        let mut inner = self.lock();
        inner.leases.settle(lease);
        if lease.is_cancelled() {
            debug!(lease = ?lease.id(), "discarding superseded query");
            return;
        }

        inner.state.querying = false;
        match result {
            Ok(result) => {
                inner.state.dataset = Some(result.into_records().into());
                inner.state.error = None;
            }
            Err(error) => {
                debug!(%error, "query failed");
                inner.state.dataset = None;
                inner.state.error = Some(error.to_string());
            }
        }
        self.publish(&inner);
    }

    fn abandon(&self, lease: &Lease<E::Connection>) {
        debug!(lease = ?lease.id(), kind = ?lease.kind(), "operation superseded before it started");
        self.lock().leases.settle(lease);
    }
}

async fn wait_for_namespace(previous: Option<watch::Receiver<bool>>) {
    if let Some(mut previous) = previous {
        // A dropped sender means that operation is gone; either way the turn is ours.
        let _ = previous.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;
    use tracing_test::traced_test;

    use super::{SessionController, SessionPhase, SessionSnapshot};
    use crate::engine::{Engine, EngineConnection, EngineError};
    use crate::load_sql::LoadPlan;
    use crate::records::{Record, ResultSet, ScalarValue};

    const VALID: &str = "valid://dataset.parquet";
    const OTHER: &str = "valid://other.parquet";
    const MISSING: &str = "missing://nothing.parquet";

    #[derive(Debug, Default)]
    struct FakeState {
        datasets: HashMap<String, usize>,
        tables: Mutex<HashMap<String, String>>,
        statements: Mutex<Vec<String>>,
        gates: Mutex<Vec<(String, Arc<Semaphore>)>>,
        connect_gate: Mutex<Option<Arc<Semaphore>>>,
        connects: AtomicUsize,
        closes: AtomicUsize,
        resets: AtomicUsize,
        terminated: AtomicBool,
    }

    impl FakeState {
        fn hold(&self, key: &str) {
            self.gates
                .lock()
                .expect("gates lock")
                .push((key.to_string(), Arc::new(Semaphore::new(0))));
        }

        fn release(&self, key: &str) {
            for (gate_key, gate) in self.gates.lock().expect("gates lock").iter() {
                if gate_key == key {
                    gate.add_permits(1);
                }
            }
        }

        fn hold_connects(&self) {
            *self.connect_gate.lock().expect("connect gate lock") =
                Some(Arc::new(Semaphore::new(0)));
        }

        fn release_connects(&self, count: usize) {
            if let Some(gate) = self.connect_gate.lock().expect("connect gate lock").as_ref() {
                gate.add_permits(count);
            }
        }

        async fn pass_gates(&self, sql: &str) {
            let gates = self
                .gates
                .lock()
                .expect("gates lock")
                .iter()
                .filter(|(key, _)| sql.contains(key.as_str()))
                .map(|(_, gate)| Arc::clone(gate))
                .collect::<Vec<_>>();
            for gate in gates {
                gate.acquire().await.expect("gate open").forget();
            }
        }

        fn loaded(&self) -> Option<String> {
            self.tables
                .lock()
                .expect("tables lock")
                .get("dataset")
                .cloned()
        }

        fn table_names(&self) -> Vec<String> {
            let mut names = self
                .tables
                .lock()
                .expect("tables lock")
                .keys()
                .cloned()
                .collect::<Vec<_>>();
            names.sort();
            names
        }

        fn statements(&self) -> Vec<String> {
            self.statements.lock().expect("statements lock").clone()
        }

        fn load_statements(&self) -> usize {
            self.statements()
                .iter()
                .filter(|sql| sql.contains("CREATE TABLE"))
                .count()
        }

        fn query_statements(&self) -> usize {
            self.statements()
                .iter()
                .filter(|sql| sql.starts_with("SELECT"))
                .count()
        }

        fn apply(&self, batch: &str) -> Result<(), EngineError> {
            let mut tables = self.tables.lock().expect("tables lock");
            for statement in batch.split(';').map(str::trim) {
                if let Some(name) = statement.strip_prefix("DROP TABLE IF EXISTS ") {
                    tables.remove(name);
                } else if let Some(rest) = statement.strip_prefix("CREATE TABLE ") {
                    let (name, from) = rest
                        .split_once(" AS SELECT * FROM ")
                        .expect("create statement shape");
                    let source = from.trim_matches('\'');
                    if !self.datasets.contains_key(source) {
                        return Err(EngineError::new(
                            "IO Error: No files found that match the pattern",
                        ));
                    }
                    tables.insert(name.to_string(), source.to_string());
                } else if let Some(rest) = statement.strip_prefix("ALTER TABLE ") {
                    let (from, to) = rest
                        .split_once(" RENAME TO ")
                        .expect("rename statement shape");
                    let source = tables.remove(from).ok_or_else(|| {
                        EngineError::new(format!(
                            "Catalog Error: Table with name {from} does not exist!"
                        ))
                    })?;
                    tables.insert(to.to_string(), source);
                }
            }
            Ok(())
        }

        fn respond(&self, sql: &str) -> Result<ResultSet, EngineError> {
            let Some(source) = self.loaded() else {
                return Err(EngineError::new(
                    "Catalog Error: Table with name dataset does not exist!",
                ));
            };
            let total = self.datasets.get(&source).copied().unwrap_or_default();
            let rows_of = |count: usize| {
                (0..count)
                    .map(|index| {
                        vec![
                            ScalarValue::Int(i64::try_from(index).expect("small index")),
                            ScalarValue::Text(source.clone()),
                        ]
                    })
                    .collect::<Vec<_>>()
            };
            let columns = vec!["task_id".to_string(), "source".to_string()];

            match sql.trim().trim_end_matches(';') {
                "SELECT * FROM dataset LIMIT 10" => {
                    Ok(ResultSet::new(columns, rows_of(total.min(10))))
                }
                "SELECT * FROM dataset" => Ok(ResultSet::new(columns, rows_of(total))),
                "SELECT COUNT(*) AS n FROM dataset" => Ok(ResultSet::new(
                    vec!["n".to_string()],
                    vec![vec![ScalarValue::Int(
                        i64::try_from(total).expect("small total"),
                    )]],
                )),
                "SELECT 1" => Ok(ResultSet::new(
                    vec!["1".to_string()],
                    vec![vec![ScalarValue::Int(1)]],
                )),
                other => Err(EngineError::new(format!(
                    "Parser Error: syntax error at or near \"{other}\""
                ))),
            }
        }
    }

    #[derive(Debug)]
    struct FakeEngine {
        state: Arc<FakeState>,
    }

    impl FakeEngine {
        fn new(datasets: &[(&str, usize)]) -> (Self, Arc<FakeState>) {
            let state = Arc::new(FakeState {
                datasets: datasets
                    .iter()
                    .map(|(source, rows)| ((*source).to_string(), *rows))
                    .collect(),
                ..FakeState::default()
            });
            (
                Self {
                    state: Arc::clone(&state),
                },
                state,
            )
        }
    }

    #[derive(Debug)]
    struct FakeConnection {
        state: Arc<FakeState>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl EngineConnection for FakeConnection {
        async fn execute(&self, sql: &str) -> Result<(), EngineError> {
            self.state.pass_gates(sql).await;
            self.state
                .statements
                .lock()
                .expect("statements lock")
                .push(sql.to_string());
            self.state.apply(sql)
        }

        async fn query(&self, sql: &str) -> Result<ResultSet, EngineError> {
            self.state.pass_gates(sql).await;
            self.state
                .statements
                .lock()
                .expect("statements lock")
                .push(sql.to_string());
            self.state.respond(sql)
        }

        fn close(&self) {
            assert!(
                !self.closed.swap(true, Ordering::SeqCst),
                "connection closed twice"
            );
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Engine for FakeEngine {
        type Connection = FakeConnection;

        async fn connect(&self) -> Result<Self::Connection, EngineError> {
            let gate = self
                .state
                .connect_gate
                .lock()
                .expect("connect gate lock")
                .clone();
            if let Some(gate) = gate {
                gate.acquire().await.expect("connect gate open").forget();
            }
            if self.state.terminated.load(Ordering::SeqCst) {
                return Err(EngineError::new("engine terminated"));
            }
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConnection {
                state: Arc::clone(&self.state),
                closed: AtomicBool::new(false),
            })
        }

        async fn reset(&self) -> Result<(), EngineError> {
            self.state.resets.fetch_add(1, Ordering::SeqCst);
            self.state.tables.lock().expect("tables lock").clear();
            Ok(())
        }

        async fn terminate(&self) -> Result<(), EngineError> {
            self.state.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn controller(datasets: &[(&str, usize)]) -> (SessionController<FakeEngine>, Arc<FakeState>) {
        let (engine, state) = FakeEngine::new(datasets);
        let plan = LoadPlan::default().with_extensions(["parquet"]);
        (SessionController::new(engine, plan), state)
    }

    async fn idle(controller: &SessionController<FakeEngine>) -> SessionSnapshot {
        let mut updates = controller.subscribe();
        let snapshot = tokio::time::timeout(
            Duration::from_secs(5),
            updates.wait_for(|snapshot| !snapshot.loading && !snapshot.querying),
        )
        .await
        .expect("session should settle")
        .expect("controller alive")
        .clone();
        snapshot
    }

    fn column<'a>(rows: &'a [Record], name: &str) -> Vec<&'a ScalarValue> {
        rows.iter()
            .map(|row| row.get(name).expect("column present"))
            .collect()
    }

    #[tokio::test]
    async fn load_adopts_default_query_then_follows_query_changes_and_clear() {
        let (controller, state) = controller(&[(VALID, 25)]);

        controller.set_source(VALID);
        assert_eq!(controller.snapshot().phase(), SessionPhase::LoadingSource);
        let snapshot = idle(&controller).await;

        assert_eq!(snapshot.phase(), SessionPhase::Ready);
        assert_eq!(snapshot.query, "SELECT * FROM dataset LIMIT 10");
        assert!(snapshot.table_loaded);
        assert_eq!(snapshot.dataset.as_deref().map(<[Record]>::len), Some(10));
        assert_eq!(snapshot.error, None);

        let handle = controller
            .set_query("SELECT COUNT(*) AS n FROM dataset")
            .expect("loaded session should run the query");
        handle.await.expect("query task");
        let snapshot = controller.snapshot();
        let rows = snapshot.dataset.as_deref().expect("count result");
        assert_eq!(column(rows, "n"), vec![&ScalarValue::Int(25)]);

        controller.set_source("").await.expect("reset task");
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.phase(), SessionPhase::Idle);
        assert_eq!(snapshot.dataset, None);
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.query, "");
        assert_eq!(state.resets.load(Ordering::SeqCst), 1);
        assert_eq!(
            state.connects.load(Ordering::SeqCst),
            state.closes.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn supplied_query_survives_load_and_runs_after_it() {
        let (controller, state) = controller(&[(VALID, 25)]);
        state.hold(VALID);

        controller.set_source(VALID);
        assert!(controller
            .set_query("SELECT COUNT(*) AS n FROM dataset")
            .is_none());
        tokio::task::yield_now().await;
        assert_eq!(state.query_statements(), 0);

        state.release(VALID);
        let snapshot = idle(&controller).await;

        assert_eq!(snapshot.query, "SELECT COUNT(*) AS n FROM dataset");
        let rows = snapshot.dataset.as_deref().expect("count result");
        assert_eq!(column(rows, "n"), vec![&ScalarValue::Int(25)]);
        assert_eq!(
            state.statements().last().map(String::as_str),
            Some("SELECT COUNT(*) AS n FROM dataset")
        );
    }

    #[tokio::test]
    async fn reloading_the_same_source_recreates_the_table() {
        let (controller, state) = controller(&[(VALID, 4)]);

        controller.set_source(VALID);
        let first = idle(&controller).await;
        controller.load_dataset();
        let second = idle(&controller).await;

        assert_eq!(second.dataset, first.dataset);
        assert_eq!(second.error, None);
        assert_eq!(state.load_statements(), 2);
        assert_eq!(
            state
                .statements()
                .iter()
                .filter(|sql| sql.contains("RENAME TO dataset"))
                .filter(|sql| sql.contains("DROP TABLE IF EXISTS dataset;"))
                .count(),
            2
        );
        assert_eq!(state.table_names(), vec!["dataset".to_string()]);
    }

    #[tokio::test]
    async fn clear_resets_everything_and_later_queries_are_ignored() {
        let (controller, state) = controller(&[(VALID, 4)]);
        controller.set_source(VALID);
        idle(&controller).await;

        controller.clear_dataset().await.expect("reset task");
        let snapshot = controller.snapshot();
        assert_eq!(snapshot, SessionSnapshot::default());

        let queries_before = state.query_statements();
        assert!(controller.perform_query("SELECT 1").is_none());
        assert!(controller.set_query("SELECT 1").is_none());
        tokio::task::yield_now().await;
        assert_eq!(state.query_statements(), queries_before);
        assert_eq!(controller.snapshot().dataset, None);
    }

    #[tokio::test]
    async fn perform_query_runs_without_reloading() {
        let (controller, state) = controller(&[(VALID, 4)]);
        controller.set_source(VALID);
        idle(&controller).await;

        controller
            .perform_query("SELECT 1")
            .expect("loaded session should run the query")
            .await
            .expect("query task");

        let snapshot = controller.snapshot();
        let rows = snapshot.dataset.as_deref().expect("query result");
        assert_eq!(column(rows, "1"), vec![&ScalarValue::Int(1)]);
        assert_eq!(snapshot.query, "SELECT * FROM dataset LIMIT 10");
        assert_eq!(state.load_statements(), 1);
    }

    #[tokio::test]
    async fn only_the_last_source_is_observed() {
        let (controller, state) = controller(&[(VALID, 25), (OTHER, 3)]);
        state.hold(VALID);

        let first = controller.set_source(VALID);
        tokio::task::yield_now().await;
        let second = controller.set_source(OTHER);

        state.release(VALID);
        first.await.expect("first load task");
        second.await.expect("second load task");
        let snapshot = idle(&controller).await;

        let rows = snapshot.dataset.as_deref().expect("rows from second source");
        assert_eq!(rows.len(), 3);
        assert!(column(rows, "source")
            .iter()
            .all(|value| **value == ScalarValue::Text(OTHER.to_string())));
        assert_eq!(snapshot.source, OTHER);
        assert_eq!(state.loaded().as_deref(), Some(OTHER));
        assert_eq!(state.table_names(), vec!["dataset".to_string()]);
        assert_eq!(
            state.connects.load(Ordering::SeqCst),
            state.closes.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn new_source_loads_while_superseded_statement_still_runs() {
        let (controller, state) = controller(&[(VALID, 25), (OTHER, 3)]);
        state.hold(VALID);

        let first = controller.set_source(VALID);
        tokio::task::yield_now().await;
        controller.set_source(OTHER);
        let snapshot = idle(&controller).await;

        assert_eq!(snapshot.phase(), SessionPhase::Ready);
        assert_eq!(snapshot.dataset.as_deref().map(<[Record]>::len), Some(3));
        assert_eq!(state.loaded().as_deref(), Some(OTHER));

        state.release(VALID);
        first.await.expect("first load task");
        assert_eq!(state.loaded().as_deref(), Some(OTHER));
        assert_eq!(state.table_names(), vec!["dataset".to_string()]);
        assert_eq!(controller.snapshot().source, OTHER);
        assert_eq!(
            state.connects.load(Ordering::SeqCst),
            state.closes.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn late_failure_of_superseded_load_is_not_reported() {
        let (controller, state) = controller(&[(OTHER, 3)]);
        state.hold(MISSING);

        let first = controller.set_source(MISSING);
        tokio::task::yield_now().await;
        controller.set_source(OTHER);
        state.release(MISSING);
        first.await.expect("first load task");
        let snapshot = idle(&controller).await;

        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.source, OTHER);
        assert_eq!(snapshot.dataset.as_deref().map(<[Record]>::len), Some(3));
    }

    #[tokio::test]
    async fn connection_obtained_after_supersession_is_closed_unused() {
        let (controller, state) = controller(&[(VALID, 2), (OTHER, 2)]);
        state.hold_connects();

        let first = controller.set_source(VALID);
        tokio::task::yield_now().await;
        controller.set_source(OTHER);
        state.release_connects(3);

        first.await.expect("first load task");
        let snapshot = idle(&controller).await;

        assert_eq!(snapshot.source, OTHER);
        assert_eq!(state.load_statements(), 1);
        assert!(state
            .statements()
            .iter()
            .all(|sql| !sql.contains(VALID)));
        assert_eq!(
            state.connects.load(Ordering::SeqCst),
            state.closes.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn load_failure_clears_table_and_query_but_session_stays_usable() {
        let (controller, _state) = controller(&[(VALID, 2)]);
        controller.set_query("SELECT 1");

        controller.set_source(MISSING);
        let snapshot = idle(&controller).await;

        assert_eq!(snapshot.phase(), SessionPhase::Failed);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("IO Error: No files found that match the pattern")
        );
        assert!(!snapshot.table_loaded);
        assert_eq!(snapshot.query, "");
        assert_eq!(snapshot.dataset, None);
        assert!(controller.perform_query("SELECT 1").is_none());

        controller.set_source(VALID);
        let snapshot = idle(&controller).await;
        assert_eq!(snapshot.phase(), SessionPhase::Ready);
        assert_eq!(snapshot.error, None);
    }

    #[tokio::test]
    async fn failed_query_blanks_rows_and_keeps_table() {
        let (controller, state) = controller(&[(VALID, 4)]);
        controller.set_source(VALID);
        idle(&controller).await;

        controller
            .set_query("SELEC nonsense")
            .expect("query should run")
            .await
            .expect("query task");
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.phase(), SessionPhase::Failed);
        assert_eq!(snapshot.dataset, None);
        assert!(snapshot.table_loaded);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("Parser Error: syntax error at or near \"SELEC nonsense\"")
        );

        controller
            .set_query("SELECT COUNT(*) AS n FROM dataset")
            .expect("corrected query should run")
            .await
            .expect("query task");
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.phase(), SessionPhase::Ready);
        assert_eq!(state.load_statements(), 1);
    }

    #[tokio::test]
    async fn newer_query_supersedes_slower_one() {
        let (controller, state) = controller(&[(VALID, 25)]);
        controller.set_source(VALID);
        idle(&controller).await;
        state.hold("COUNT");

        let slow = controller
            .perform_query("SELECT COUNT(*) AS n FROM dataset")
            .expect("query should run");
        tokio::task::yield_now().await;
        let fast = controller
            .perform_query("SELECT 1")
            .expect("query should run");
        fast.await.expect("fast query task");
        state.release("COUNT");
        slow.await.expect("slow query task");

        let snapshot = controller.snapshot();
        assert!(!snapshot.querying);
        let rows = snapshot.dataset.as_deref().expect("fast query result");
        assert_eq!(column(rows, "1"), vec![&ScalarValue::Int(1)]);
        assert_eq!(
            state.connects.load(Ordering::SeqCst),
            state.closes.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn empty_source_resets_without_connecting() {
        let (controller, state) = controller(&[]);

        controller.set_source("").await.expect("reset task");

        assert_eq!(state.connects.load(Ordering::SeqCst), 0);
        assert_eq!(state.resets.load(Ordering::SeqCst), 1);
        assert_eq!(controller.snapshot().phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn load_started_after_clear_waits_for_the_reset() {
        let (controller, state) = controller(&[(VALID, 2)]);
        controller.set_source(VALID);
        idle(&controller).await;

        let reset = controller.clear_dataset();
        controller.set_source(VALID);
        let snapshot = idle(&controller).await;
        reset.await.expect("reset task");

        assert_eq!(snapshot.phase(), SessionPhase::Ready);
        assert_eq!(state.loaded().as_deref(), Some(VALID));
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_load_and_terminates_engine() {
        let (controller, state) = controller(&[(VALID, 2)]);
        state.hold(VALID);
        let load = controller.set_source(VALID);
        tokio::task::yield_now().await;
        let mut updates = controller.subscribe();

        controller.shutdown().await.expect("terminate should succeed");
        state.release(VALID);
        load.await.expect("load task");

        assert!(state.terminated.load(Ordering::SeqCst));
        let snapshot = updates.borrow_and_update().clone();
        assert!(!snapshot.loading);
        assert!(!snapshot.querying);
        assert_eq!(snapshot.dataset, None);
        assert_eq!(
            state.connects.load(Ordering::SeqCst),
            state.closes.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn superseded_completion_is_logged_not_published() {
        let (controller, state) = controller(&[(VALID, 2), (OTHER, 2)]);
        state.hold(VALID);

        let first = controller.set_source(VALID);
        tokio::task::yield_now().await;
        controller.set_source(OTHER);
        state.release(VALID);
        first.await.expect("first load task");
        idle(&controller).await;

        assert!(logs_contain("discarding superseded load"));
    }
}
