use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime};
use duckdb::types::{Decimal, Value};
use duckdb::{Connection, InterruptHandle};
use quack_core::engine::{Engine, EngineConnection, EngineError};
use quack_core::records::{ResultSet, ScalarValue};
use tracing::{debug, info};

// Every connect clones onto the same in-memory database, so queries see the
// tables a load created.
pub struct DuckDbEngine {
    database: Mutex<Option<Connection>>,
}

impl fmt::Debug for DuckDbEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuckDbEngine")
            .field("open", &self.lock().is_some())
            .finish()
    }
}

impl DuckDbEngine {
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let database = Connection::open_in_memory().map_err(to_engine_error)?;
        info!("opened in-memory duckdb database");
        Ok(Self {
            database: Mutex::new(Some(database)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.database.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Engine for DuckDbEngine {
    type Connection = DuckDbConnection;

    async fn connect(&self) -> Result<Self::Connection, EngineError> {
        let database = self.lock();
        let database = database.as_ref().ok_or_else(terminated_error)?;
        let connection = database.try_clone().map_err(to_engine_error)?;
        Ok(DuckDbConnection::new(connection))
    }

    async fn reset(&self) -> Result<(), EngineError> {
        let fresh = Connection::open_in_memory().map_err(to_engine_error)?;
        let mut database = self.lock();
        if database.is_none() {
            return Err(terminated_error());
        }
        // Open connections keep the old database alive until they close.
        *database = Some(fresh);
        debug!("replaced duckdb database with an empty one");
        Ok(())
    }

    async fn terminate(&self) -> Result<(), EngineError> {
        if self.lock().take().is_some() {
            info!("closed duckdb database");
        }
        Ok(())
    }
}

pub struct DuckDbConnection {
    connection: Arc<Mutex<Option<Connection>>>,
    interrupt: Arc<InterruptHandle>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for DuckDbConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuckDbConnection")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl DuckDbConnection {
    fn new(connection: Connection) -> Self {
        Self {
            interrupt: connection.interrupt_handle(),
            connection: Arc::new(Mutex::new(Some(connection))),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    // A `close` that lands while the statement runs interrupts it; the
    // connection is dropped as soon as the worker returns.
    async fn run<T, F>(&self, work: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, EngineError> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        let closed = Arc::clone(&self.closed);
        tokio::task::spawn_blocking(move || {
            let mut slot = connection.lock().unwrap_or_else(PoisonError::into_inner);
            let result = match slot.as_ref() {
                Some(connection) if !closed.load(Ordering::SeqCst) => work(connection),
                _ => Err(closed_error()),
            };
            if closed.load(Ordering::SeqCst) {
                slot.take();
            }
            result
        })
        .await
        .map_err(|error| EngineError::new(format!("duckdb worker failed: {error}")))?
    }
}

#[async_trait]
impl EngineConnection for DuckDbConnection {
    async fn execute(&self, sql: &str) -> Result<(), EngineError> {
        let sql = sql.to_string();
        self.run(move |connection| connection.execute_batch(&sql).map_err(to_engine_error))
            .await
    }

    async fn query(&self, sql: &str) -> Result<ResultSet, EngineError> {
        let sql = sql.to_string();
        self.run(move |connection| read_result_set(connection, &sql))
            .await
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.interrupt.interrupt();
        match self.connection.try_lock() {
            Ok(mut slot) => {
                slot.take();
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().take();
            }
            Err(TryLockError::WouldBlock) => {
                debug!("interrupted running duckdb statement");
            }
        }
    }
}

fn read_result_set(connection: &Connection, sql: &str) -> Result<ResultSet, EngineError> {
    let mut statement = connection.prepare(sql).map_err(to_engine_error)?;
    let mut rows = statement.query([]).map_err(to_engine_error)?;
    let columns = rows
        .as_ref()
        .map(duckdb::Statement::column_names)
        .unwrap_or_default();

    let mut values = Vec::new();
    while let Some(row) = rows.next().map_err(to_engine_error)? {
        let mut record = Vec::with_capacity(columns.len());
        for index in 0..columns.len() {
            let value: Value = row.get(index).map_err(to_engine_error)?;
            record.push(duckdb_value_to_scalar(value));
        }
        values.push(record);
    }

    Ok(ResultSet::new(columns, values))
}

fn duckdb_value_to_scalar(value: Value) -> ScalarValue {
    match value {
        Value::Null => ScalarValue::Null,
        Value::Boolean(value) => ScalarValue::Bool(value),
        Value::TinyInt(value) => ScalarValue::Int(value.into()),
        Value::SmallInt(value) => ScalarValue::Int(value.into()),
        Value::Int(value) => ScalarValue::Int(value.into()),
        Value::BigInt(value) => ScalarValue::Int(value),
        Value::HugeInt(value) => {
            i64::try_from(value).map_or_else(|_| ScalarValue::Text(value.to_string()), ScalarValue::Int)
        }
        Value::UHugeInt(value) => {
            u64::try_from(value).map_or_else(|_| ScalarValue::Text(value.to_string()), ScalarValue::UInt)
        }
        Value::UTinyInt(value) => ScalarValue::UInt(value.into()),
        Value::USmallInt(value) => ScalarValue::UInt(value.into()),
        Value::UInt(value) => ScalarValue::UInt(value.into()),
        Value::UBigInt(value) => ScalarValue::UInt(value),
        Value::Float(value) => ScalarValue::Float(value.into()),
        Value::Double(value) => ScalarValue::Float(value),
        Value::Decimal(value) => decimal_to_scalar(value),
        Value::Text(value) | Value::Enum(value) => ScalarValue::Text(value),
        Value::Blob(bytes) | Value::Geometry(bytes) => {
            ScalarValue::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        Value::Date32(days) => date_to_scalar(days),
        Value::Timestamp(unit, value) => timestamp_to_scalar(unit.to_micros(value)),
        Value::Time64(unit, value) => time_to_scalar(unit.to_micros(value)),
        Value::Interval {
            months,
            days,
            nanos,
        } => ScalarValue::Text(interval_text(months, days, nanos)),
        Value::List(items) | Value::Array(items) => ScalarValue::Text(format!(
            "[{}]",
            items.into_iter().map(render_nested).collect::<Vec<_>>().join(", ")
        )),
        Value::Struct(fields) => ScalarValue::Text(format!(
            "{{{}}}",
            fields
                .iter()
                .map(|(name, value)| format!("'{name}': {}", render_nested(value.clone())))
                .collect::<Vec<_>>()
                .join(", ")
        )),
        Value::Map(entries) => ScalarValue::Text(format!(
            "{{{}}}",
            entries
                .iter()
                .map(|(key, value)| {
                    format!("{}={}", render_nested(key.clone()), render_nested(value.clone()))
                })
                .collect::<Vec<_>>()
                .join(", ")
        )),
        Value::Union(value) => duckdb_value_to_scalar(*value),
        other => ScalarValue::Text(format!("{other:?}")),
    }
}

fn render_nested(value: Value) -> String {
    duckdb_value_to_scalar(value).to_string()
}

// Up to 15 significant digits survive the trip through f64 unchanged.
fn decimal_to_scalar(value: Decimal) -> ScalarValue {
    let text = value.to_string();
    if value.width() <= 15 {
        if let Ok(float) = text.parse::<f64>() {
            return ScalarValue::Float(float);
        }
    }
    ScalarValue::Text(text)
}

fn date_to_scalar(days: i32) -> ScalarValue {
    DateTime::from_timestamp(i64::from(days) * 86_400, 0).map_or_else(
        || ScalarValue::Int(days.into()),
        |moment| ScalarValue::Text(moment.format("%Y-%m-%d").to_string()),
    )
}

fn timestamp_to_scalar(micros: i64) -> ScalarValue {
    DateTime::from_timestamp_micros(micros).map_or(ScalarValue::Int(micros), |moment| {
        ScalarValue::Text(moment.format("%Y-%m-%d %H:%M:%S%.f").to_string())
    })
}

fn time_to_scalar(micros: i64) -> ScalarValue {
    let seconds = u32::try_from(micros.div_euclid(1_000_000)).ok();
    let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).ok();
    seconds
        .zip(nanos)
        .and_then(|(seconds, nanos)| NaiveTime::from_num_seconds_from_midnight_opt(seconds, nanos))
        .map_or(ScalarValue::Int(micros), |time| {
            ScalarValue::Text(time.format("%H:%M:%S%.f").to_string())
        })
}

fn interval_text(months: i32, days: i32, nanos: i64) -> String {
    let mut parts = Vec::new();
    if months != 0 {
        parts.push(format!("{months} months"));
    }
    if days != 0 {
        parts.push(format!("{days} days"));
    }
    if nanos != 0 || parts.is_empty() {
        let sign = if nanos < 0 { "-" } else { "" };
        let micros = (nanos / 1_000).unsigned_abs();
        let seconds = micros / 1_000_000;
        let fraction = micros % 1_000_000;
        let mut clock = format!(
            "{sign}{:02}:{:02}:{:02}",
            seconds / 3_600,
            seconds / 60 % 60,
            seconds % 60
        );
        if fraction != 0 {
            clock.push('.');
            clock.push_str(&format!("{fraction:06}"));
        }
        parts.push(clock);
    }
    parts.join(" ")
}

fn terminated_error() -> EngineError {
    EngineError::new("duckdb engine has been terminated")
}

fn closed_error() -> EngineError {
    EngineError::new("duckdb connection is closed")
}

fn to_engine_error(error: duckdb::Error) -> EngineError {
    EngineError::new(error.to_string())
}
