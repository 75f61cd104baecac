//! Windowed ring buffer of recent metrics.
//!
//! The ring holds `num_periods + 1` slots. Every tick closes the active
//! window, evaluates it with the aggregator and recycles the oldest slot as
//! the new active window. The extra slot is the one being recycled, so a
//! window still reachable through [`MetricCache::get_period`] is never
//! overwritten.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregator::{AggregatorError, MetricAggregator};
use crate::metric::Metric;
use crate::stats::StatsHandle;
use crate::ticker::{MultiChanTicker, Tick};

const COMPONENT: &str = "MetricCache";

/// Read-only copy of one window.
#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub start: SystemTime,
    pub stop: SystemTime,
    pub metrics: Vec<Metric>,
}

impl Period {
    fn empty() -> Self {
        Self {
            start: SystemTime::UNIX_EPOCH,
            stop: SystemTime::UNIX_EPOCH,
            metrics: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    start: SystemTime,
    stop: SystemTime,
    /// Valid prefix of `metrics`; entries past it are stale and get
    /// overwritten by later adds.
    len: usize,
    metrics: Vec<Metric>,
}

impl Slot {
    fn new(at: SystemTime) -> Self {
        Self {
            start: at,
            stop: at,
            len: 0,
            metrics: Vec::new(),
        }
    }

    fn window(&self) -> &[Metric] {
        &self.metrics[..self.len]
    }
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Slot>,
    current: usize,
    added: i64,
    windows: i64,
    evaluated: i64,
}

struct Shared {
    num_periods: usize,
    ring: Mutex<Ring>,
    aggregator: Arc<MetricAggregator>,
    stats: StatsHandle,
}

impl Shared {
    /// Closes the active window at `tick` and evaluates it.
    ///
    /// The lock is held through evaluation so `add` cannot interleave with
    /// a window being read.
    fn rotate(&self, tick: SystemTime) {
        let mut ring = self.ring.lock();
        let ring_len = ring.slots.len();
        let closed = ring.current;
        let next = (closed + 1) % ring_len;

        ring.slots[closed].stop = tick;
        {
            let slot = &mut ring.slots[next];
            slot.start = tick;
            slot.stop = tick;
            slot.len = 0;
        }
        ring.current = next;
        ring.windows += 1;

        let slot = &ring.slots[closed];
        let evaluated = if slot.len > 0 {
            self.aggregator.eval(slot.start, slot.stop, slot.window());
            true
        } else {
            debug!(slot = closed, "empty window, nothing to evaluate");
            false
        };
        if evaluated {
            ring.evaluated += 1;
        }

        let counters = [
            ("added", ring.added),
            ("windows", ring.windows),
            ("evaluated_windows", ring.evaluated),
        ];
        drop(ring);

        self.stats.component_stats(COMPONENT, &counters);
    }
}

/// Time-windowed metric store feeding the aggregation engine.
pub struct MetricCache {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MetricCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricCache")
            .field("num_periods", &self.shared.num_periods)
            .finish()
    }
}

impl MetricCache {
    pub fn new(
        aggregator: Arc<MetricAggregator>,
        num_periods: usize,
        stats: StatsHandle,
    ) -> Result<Self> {
        if num_periods == 0 {
            bail!("num_periods must be > 0");
        }

        let now = SystemTime::now();
        let slots = (0..=num_periods).map(|_| Slot::new(now)).collect();

        Ok(Self {
            shared: Arc::new(Shared {
                num_periods,
                ring: Mutex::new(Ring {
                    slots,
                    current: 0,
                    added: 0,
                    windows: 0,
                    evaluated: 0,
                }),
                aggregator,
                stats,
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn num_periods(&self) -> usize {
        self.shared.num_periods
    }

    pub fn aggregator(&self) -> &Arc<MetricAggregator> {
        &self.shared.aggregator
    }

    /// Subscribes to `ticker` and rotates on every tick.
    pub fn start(&self, ticker: &MultiChanTicker) {
        let (tx, mut rx) = mpsc::channel::<Tick>(1);
        ticker.add_channel(tx);

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = rx.recv() => match tick.map(Tick::accept) {
                        Some(Some(tick)) => shared.rotate(tick),
                        Some(None) => {}
                        None => break,
                    },
                }
            }
            debug!("cache stopped");
        });

        *self.task.lock() = Some(handle);
    }

    /// Appends to the active window.
    pub fn add(&self, metric: Metric) {
        let mut ring = self.shared.ring.lock();
        let current = ring.current;
        if current >= ring.slots.len() {
            warn!(current, "active window index out of range, dropping metric");
            return;
        }

        let time = metric.time();
        let slot = &mut ring.slots[current];
        if slot.len < slot.metrics.len() {
            slot.metrics[slot.len] = metric;
        } else {
            slot.metrics.push(metric);
        }
        slot.len += 1;
        if time > slot.stop {
            slot.stop = time;
        }
        ring.added += 1;
    }

    /// Window `index` ticks back from the active one (0). Indices outside
    /// `0..num_periods` yield an empty period.
    pub fn get_period(&self, index: isize) -> Period {
        let Ok(back) = usize::try_from(index) else {
            return Period::empty();
        };
        if back >= self.shared.num_periods {
            return Period::empty();
        }

        let ring = self.shared.ring.lock();
        let ring_len = ring.slots.len();
        let slot = &ring.slots[(ring.current + ring_len - back) % ring_len];
        Period {
            start: slot.start,
            stop: slot.stop,
            metrics: slot.window().to_vec(),
        }
    }

    pub fn add_aggregation(
        &self,
        name: &str,
        function: &str,
        condition: &str,
        tags: &HashMap<String, String>,
        meta: &HashMap<String, String>,
    ) -> Result<(), AggregatorError> {
        self.shared
            .aggregator
            .add_aggregation(name, function, condition, tags, meta)
    }

    pub fn delete_aggregation(&self, name: &str) -> Result<(), AggregatorError> {
        self.shared.aggregator.delete_aggregation(name)
    }

    pub async fn close(&self) {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "cache task failed");
            }
        }
    }
}
