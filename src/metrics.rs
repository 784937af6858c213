//! Pool metrics and state snapshot.

use std::sync::{Arc, LazyLock};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram},
    Key, KeyValue, StringValue, Value,
};

/// Central metrics singleton for pool metrics.
pub(crate) static POOL_METRICS: LazyLock<Arc<Metrics>> =
    LazyLock::new(|| Arc::new(Metrics::new()));

const KEY_POOL_NAME: Key = Key::from_static_str("db.client.connection.pool.name");
const KEY_STATE: Key = Key::from_static_str("db.client.connection.state");

/// Storage for pool metrics.
pub(crate) struct Metrics {
    /// The number of connections that are currently in state described by the state attribute.
    pub(crate) conn_count: Gauge<u64>,
    /// The time it took to create a new connection.
    pub(crate) create_time: Histogram<f64>,
    /// The time it took to obtain an open connection from the pool.
    pub(crate) wait_time: Histogram<f64>,
    /// The time between borrowing a connection and returning it to the pool.
    pub(crate) use_time: Histogram<f64>,
    /// The number of connection timeouts that have occurred trying to obtain a connection.
    pub(crate) timeouts: Counter<u64>,
    /// The number of dead idle connections replaced on checkout.
    pub(crate) stale_replaced: Counter<u64>,
    /// The number of current pending requests for an open connection.
    pub(crate) pending: Gauge<u64>,
    /// The minimum number of idle open connections allowed.
    pub(crate) idle_min: Gauge<u64>,
    /// The maximum number of open connections allowed.
    pub(crate) conn_max: Gauge<u64>,
}

impl Metrics {
    /// Create new storage for pool metrics.
    ///
    /// You probably don't need this, as all pools use a central metrics singleton for storage.
    pub(crate) fn new() -> Self {
        let meter = global::meter("dbpool");
        // db.client.connection.pool.name (string)
        // db.client.connection.state (idle / used)
        let conn_count = meter
            .u64_gauge("db.client.connection.count")
            .with_description("The number of connections that are currently in state described by the state attribute.")
            .build();
        let create_time = meter
            .f64_histogram("db.client.connection.create_time")
            .with_unit("s")
            .with_description("The time it took to create a new connection.")
            .build();
        let wait_time = meter
            .f64_histogram("db.client.connection.wait_time")
            .with_unit("s")
            .with_description("The time it took to obtain an open connection from the pool.")
            .build();
        let use_time = meter
            .f64_histogram("db.client.connection.use_time")
            .with_unit("s")
            .with_description(
                "The time between borrowing a connection and returning it to the pool.",
            )
            .build();
        let timeouts = meter
            .u64_counter("db.client.connection.timeouts")
            .with_description("The number of connection timeouts that have occurred trying to obtain a connection from the pool.")
            .build();
        let stale_replaced = meter
            .u64_counter("db.client.connection.stale_replaced")
            .with_description("The number of dead idle connections replaced on checkout.")
            .build();
        let pending = meter
            .u64_gauge("db.client.connection.pending_requests")
            .with_description("The number of current pending requests for an open connection.")
            .build();
        let idle_min = meter
            .u64_gauge("db.client.connection.idle.min")
            .with_description("The minimum number of idle open connections allowed.")
            .build();
        let conn_max = meter
            .u64_gauge("db.client.connection.max")
            .with_description("The maximum number of open connections allowed.")
            .build();
        Metrics {
            conn_count,
            create_time,
            wait_time,
            use_time,
            timeouts,
            stale_replaced,
            pending,
            idle_min,
            conn_max,
        }
    }

    pub(crate) fn record_state(&self, label: &[KeyValue], state: &PoolState) {
        self.conn_max.record(state.max_size as u64, label);
        self.idle_min.record(state.min_size as u64, label);
        self.pending.record(state.waiting as u64, label);
        let total_label = status_kv(label[0].clone(), "total");
        self.conn_count.record(state.size as u64, &total_label);
        let idle_label = status_kv(label[0].clone(), "idle");
        self.conn_count.record(state.idle as u64, &idle_label);
        let used_label = status_kv(label[0].clone(), "used");
        self.conn_count.record(state.in_use as u64, &used_label);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

pub(crate) fn pool_kv(name: &str) -> [KeyValue; 1] {
    [KeyValue::new(KEY_POOL_NAME, name.to_owned())]
}

pub(crate) fn status_kv(name: KeyValue, status: &'static str) -> [KeyValue; 2] {
    [
        name,
        KeyValue::new(KEY_STATE, Value::String(StringValue::from(status))),
    ]
}

/// Snapshot of pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolState {
    /// Maximum total (`idle` + `in_use`) number of connections.
    pub max_size: usize,
    /// Number of connections kept open by the pool at all times.
    pub min_size: usize,
    /// Current total (`idle` + `in_use`) number of connections.
    pub size: usize,
    /// Current number of idle (not acquired) connections.
    pub idle: usize,
    /// Current number of in-use (acquired) connections.
    pub in_use: usize,
    /// Number of callers blocked waiting for a connection.
    pub waiting: usize,
    /// Number of dead idle connections replaced on checkout since pool creation.
    pub stale_replaced: u64,
}
