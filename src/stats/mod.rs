//! Internal operational counters.
//!
//! Components report counters through a [`StatsHandle`] as `_stats`
//! metrics tagged with a `source` meta key. [`StatsApi`] folds them into a
//! per-component table, snapshots the table once per tick and optionally
//! serves the snapshot over HTTP.

mod http;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StatsApiConfig;
use crate::metric::{FieldValue, Metric, STATS_METRIC_NAME};
use crate::ticker::{MultiChanTicker, Tick};

/// Reports queued between ingest passes; further reports are dropped.
pub const STATS_QUEUE_CAPACITY: usize = 1024;

/// Counter table keyed by component, then counter name.
pub type StatsSnapshot = BTreeMap<String, BTreeMap<String, i64>>;

/// Cheap, cloneable emitter for component counters.
///
/// The no-op handle silently discards everything, so components never need
/// to know whether a stats API is running. Reporting never blocks: when
/// the queue is full the report is dropped.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    tx: Option<mpsc::Sender<Metric>>,
}

impl StatsHandle {
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Reports several counters of one component as a single metric.
    pub fn component_stats(&self, component: &str, values: &[(&str, i64)]) {
        let Some(tx) = &self.tx else {
            return;
        };
        if values.is_empty() {
            return;
        }

        let fields: HashMap<String, FieldValue> = values
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::Int(*v)))
            .collect();
        let mut meta = HashMap::with_capacity(1);
        meta.insert("source".to_string(), component.to_string());

        match Metric::new(STATS_METRIC_NAME, HashMap::new(), meta, fields, SystemTime::now()) {
            Ok(m) => match tx.try_send(m) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(component, "stats queue full, dropping report");
                }
                // Receiver gone means the stats API was closed.
                Err(TrySendError::Closed(_)) => {}
            },
            Err(e) => debug!(error = %e, component, "building stats metric"),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    live: StatsSnapshot,
    published: StatsSnapshot,
}

impl Tables {
    fn ingest(&mut self, m: &Metric) {
        if m.name() != STATS_METRIC_NAME {
            debug!(name = m.name(), "ignoring non-stats metric");
            return;
        }
        let Some(source) = m.meta_value("source") else {
            debug!("ignoring stats metric without source");
            return;
        };

        let entry = self.live.entry(source.to_string()).or_default();
        for (key, value) in m.fields() {
            match value {
                FieldValue::Int(v) => {
                    entry.insert(key.clone(), *v);
                }
                other => debug!(
                    component = source,
                    counter = %key,
                    kind = other.type_name(),
                    "ignoring non-integer stats field"
                ),
            }
        }
    }

    fn publish(&mut self) {
        self.published.clone_from(&self.live);
    }
}

/// Collects component counters and exposes the latest snapshot.
pub struct StatsApi {
    config: StatsApiConfig,
    tx: mpsc::Sender<Metric>,
    rx: Mutex<Option<mpsc::Receiver<Metric>>>,
    tables: Arc<Mutex<Tables>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    server: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for StatsApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsApi")
            .field("publish", &self.config.publish_collectorstate)
            .field("bindhost", &self.config.bindhost)
            .field("port", &self.config.port)
            .finish()
    }
}

impl StatsApi {
    pub fn new(config: StatsApiConfig) -> Self {
        let (tx, rx) = mpsc::channel(STATS_QUEUE_CAPACITY);
        Self {
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            tables: Arc::new(Mutex::new(Tables::default())),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::with_capacity(2)),
            server: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Handle for components to report through.
    pub fn handle(&self) -> StatsHandle {
        StatsHandle {
            tx: Some(self.tx.clone()),
        }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.tables.lock().published.clone()
    }

    /// Address the HTTP listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Starts ingest and snapshot tasks and, when publishing, the HTTP
    /// listener. Fails if the listener cannot bind.
    pub async fn start(&self, ticker: &MultiChanTicker) -> Result<()> {
        let Some(mut rx) = self.rx.lock().take() else {
            bail!("stats api already started");
        };

        if self.config.publish_collectorstate {
            let bind_addr = format!("{}:{}", self.config.bindhost, self.config.port);
            let listener = TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("listening on {bind_addr}"))?;
            let local_addr = listener.local_addr().context("getting local address")?;
            *self.local_addr.lock() = Some(local_addr);

            let server_cancel = CancellationToken::new();
            let handle = http::serve(listener, Arc::clone(&self.tables), server_cancel.clone());
            *self.server.lock() = Some((server_cancel, handle));
        }

        let (tick_tx, mut tick_rx) = mpsc::channel::<Tick>(1);
        ticker.add_channel(tick_tx);

        let tables = Arc::clone(&self.tables);
        let cancel = self.cancel.clone();
        let ingest = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(m) => tables.lock().ingest(&m),
                        None => break,
                    },
                }
            }
            debug!("stats ingest stopped");
        });

        let tables = Arc::clone(&self.tables);
        let cancel = self.cancel.clone();
        let snapshot = tokio::spawn(async move {
            tables.lock().publish();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = tick_rx.recv() => match tick.map(Tick::accept) {
                        Some(Some(_)) => tables.lock().publish(),
                        Some(None) => {}
                        None => break,
                    },
                }
            }
            debug!("stats snapshot stopped");
        });

        self.tasks.lock().extend([ingest, snapshot]);

        info!(
            publish = self.config.publish_collectorstate,
            addr = ?self.local_addr(),
            "stats api started",
        );

        Ok(())
    }

    /// Stops both tasks, then the HTTP listener.
    pub async fn close(&self) {
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "stats task failed");
            }
        }

        let server = self.server.lock().take();
        if let Some((cancel, handle)) = server {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "stats server task failed");
            }
        }

        debug!("stats api closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(publish: bool) -> StatsApiConfig {
        StatsApiConfig {
            publish_collectorstate: publish,
            bindhost: "127.0.0.1".to_string(),
            port: 0,
        }
    }

    #[test]
    fn test_noop_handle_is_silent() {
        let h = StatsHandle::noop();
        h.component_stats("MetricRouter", &[("forwarded", 1), ("dropped", 2)]);
    }

    #[test]
    fn test_reports_before_start_are_bounded() {
        let api = StatsApi::new(config(false));
        let h = api.handle();
        for i in 0..2 * STATS_QUEUE_CAPACITY {
            h.component_stats("MetricRouter", &[("forwarded", i as i64)]);
        }

        let mut rx = api.rx.lock().take().expect("not started");
        let mut queued = 0;
        while let Ok(m) = rx.try_recv() {
            if queued == 0 {
                assert_eq!(m.field("forwarded"), Some(&FieldValue::Int(0)));
            }
            queued += 1;
        }
        assert_eq!(queued, STATS_QUEUE_CAPACITY);
    }

    #[test]
    fn test_ingest_merges_int_fields_only() {
        let mut tables = Tables::default();

        let mut meta = HashMap::new();
        meta.insert("source".to_string(), "MetricCache".to_string());
        let mut fields = HashMap::new();
        fields.insert("added".to_string(), FieldValue::Int(3));
        fields.insert("ratio".to_string(), FieldValue::Float(0.5));
        let m = Metric::new(STATS_METRIC_NAME, HashMap::new(), meta, fields, SystemTime::now())
            .expect("valid metric");

        tables.ingest(&m);
        tables.publish();

        assert_eq!(tables.published["MetricCache"]["added"], 3);
        assert!(!tables.published["MetricCache"].contains_key("ratio"));
    }

    #[test]
    fn test_ingest_ignores_foreign_metrics() {
        let mut tables = Tables::default();
        let m = Metric::with_value(
            "cpu_load",
            HashMap::new(),
            HashMap::new(),
            1i64,
            SystemTime::now(),
        )
        .expect("valid metric");
        tables.ingest(&m);
        assert!(tables.live.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_follows_ticks() {
        let ticker = MultiChanTicker::new(Duration::from_millis(20)).expect("valid period");
        let api = StatsApi::new(config(false));
        api.start(&ticker).await.expect("start");
        ticker.start();

        api.handle()
            .component_stats("MetricRouter", &[("forwarded", 7), ("dropped", 1)]);

        let mut published = StatsSnapshot::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            published = api.snapshot();
            if !published.is_empty() {
                break;
            }
        }

        assert_eq!(published["MetricRouter"]["forwarded"], 7);
        assert_eq!(published["MetricRouter"]["dropped"], 1);

        ticker.close().await;
        api.close().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let ticker = MultiChanTicker::new(Duration::from_secs(1)).expect("valid period");
        let api = StatsApi::new(config(false));
        api.start(&ticker).await.expect("first start");
        assert!(api.start(&ticker).await.is_err());
        api.close().await;
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("bind a free port");
        let port = taken.local_addr().expect("addr").port();

        let ticker = MultiChanTicker::new(Duration::from_secs(1)).expect("valid period");
        let api = StatsApi::new(StatsApiConfig {
            publish_collectorstate: true,
            bindhost: "127.0.0.1".to_string(),
            port,
        });
        let err = api.start(&ticker).await.expect_err("port in use");
        assert!(err.to_string().contains("listening on"));
    }
}
