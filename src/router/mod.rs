//! N-input, M-output metric hub.
//!
//! Every metric read from an input runs through the [`MessageProcessor`]
//! and is sent to all outputs in order. Metrics from producer inputs are
//! also added to the cache, whose aggregator feeds derived metrics back
//! through an internal aggregate input.

mod processor;
mod units;

use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use anyhow::{bail, Context as _, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use processor::MessageProcessor;

use crate::aggregator::MetricAggregator;
use crate::cache::MetricCache;
use crate::config::RouterConfig;
use crate::metric::Metric;
use crate::stats::StatsHandle;
use crate::ticker::{MultiChanTicker, Tick};
use crate::topology::Topology;

const COMPONENT: &str = "MetricRouter";

/// Capacity of the aggregator to router channel. The aggregator drops
/// derived metrics when it is full.
const AGGREGATE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Created,
    Configured,
    Running,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Producer,
    Aggregate,
}

pub struct MetricRouter {
    processor: Arc<MessageProcessor>,
    cache: Option<Arc<MetricCache>>,
    max_forward: usize,
    interval_timestamp: bool,
    inputs: Mutex<Vec<mpsc::Receiver<Metric>>>,
    outputs: Mutex<Vec<mpsc::Sender<Metric>>>,
    aggregate_rx: Mutex<Option<mpsc::Receiver<Metric>>>,
    state: Mutex<RouterState>,
    stats: StatsHandle,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MetricRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRouter")
            .field("state", &self.state())
            .field("inputs", &self.inputs.lock().len())
            .field("outputs", &self.outputs.lock().len())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl MetricRouter {
    /// Compiles the rule set and, when `num_cache_intervals > 0`, builds
    /// the cache with its aggregation rules.
    pub fn new(
        config: &RouterConfig,
        hostname: &str,
        topology: Arc<dyn Topology>,
        stats: StatsHandle,
    ) -> Result<Self> {
        config.validate()?;

        let processor = MessageProcessor::new(config, hostname, Arc::clone(&topology))
            .context("compiling router rules")?;

        let (cache, aggregate_rx) = if config.num_cache_intervals > 0 {
            let (tx, rx) = mpsc::channel(AGGREGATE_CHANNEL_CAPACITY);
            let aggregator = Arc::new(MetricAggregator::new(
                tx,
                topology,
                hostname,
                stats.clone(),
            ));
            let cache = MetricCache::new(aggregator, config.num_cache_intervals, stats.clone())?;

            for rule in &config.interval_aggregates {
                cache
                    .add_aggregation(
                        &rule.name,
                        &rule.function,
                        &rule.condition,
                        &rule.tags,
                        &rule.meta,
                    )
                    .with_context(|| format!("adding aggregation {}", rule.name))?;
            }

            (Some(Arc::new(cache)), Some(rx))
        } else {
            (None, None)
        };

        info!(
            hostname,
            cache_intervals = config.num_cache_intervals,
            aggregations = config.interval_aggregates.len(),
            "router configured"
        );

        Ok(Self {
            processor: Arc::new(processor),
            cache,
            max_forward: config.max_forward,
            interval_timestamp: config.interval_timestamp,
            inputs: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            aggregate_rx: Mutex::new(aggregate_rx),
            state: Mutex::new(RouterState::Configured),
            stats,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> RouterState {
        *self.state.lock()
    }

    pub fn cache(&self) -> Option<&Arc<MetricCache>> {
        self.cache.as_ref()
    }

    /// Registers a producer input. Only allowed before `start`.
    pub fn add_input(&self, rx: mpsc::Receiver<Metric>) -> Result<()> {
        self.ensure_configured("add_input")?;
        self.inputs.lock().push(rx);
        Ok(())
    }

    /// Registers an output. Only allowed before `start`.
    pub fn add_output(&self, tx: mpsc::Sender<Metric>) -> Result<()> {
        self.ensure_configured("add_output")?;
        self.outputs.lock().push(tx);
        Ok(())
    }

    fn ensure_configured(&self, op: &str) -> Result<()> {
        let state = self.state();
        if state != RouterState::Configured {
            bail!("router {op} in state {state:?}");
        }
        Ok(())
    }

    /// Starts the cache (if any) and the forwarding loop, both driven by
    /// `ticker`.
    pub fn start(&self, ticker: &MultiChanTicker) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != RouterState::Configured {
                bail!("router start in state {:?}", *state);
            }
            *state = RouterState::Running;
        }

        if let Some(cache) = &self.cache {
            cache.start(ticker);
        }

        let (tick_tx, tick_rx) = mpsc::channel(1);
        ticker.add_channel(tick_tx);

        let mut receivers: Vec<(Source, mpsc::Receiver<Metric>)> = self
            .inputs
            .lock()
            .drain(..)
            .map(|rx| (Source::Producer, rx))
            .collect();
        if let Some(rx) = self.aggregate_rx.lock().take() {
            receivers.push((Source::Aggregate, rx));
        }

        let worker = Forwarder {
            processor: Arc::clone(&self.processor),
            cache: self.cache.clone(),
            outputs: std::mem::take(&mut *self.outputs.lock()),
            interval_timestamp: self.interval_timestamp,
            clock: SystemTime::now(),
            stats: self.stats.clone(),
            forwarded: 0,
            dropped: 0,
            cached: 0,
        };

        info!(
            inputs = receivers.len(),
            outputs = worker.outputs.len(),
            max_forward = self.max_forward,
            "router started"
        );

        let handle = tokio::spawn(run(
            worker,
            Inputs {
                receivers,
                next: 0,
            },
            tick_rx,
            self.max_forward,
            self.cancel.clone(),
        ));
        *self.task.lock() = Some(handle);

        Ok(())
    }

    /// Stops forwarding, waits for the loop, then closes the cache.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, RouterState::Closing | RouterState::Closed) {
                return;
            }
            *state = RouterState::Closing;
        }

        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "router task failed");
            }
        }

        if let Some(cache) = &self.cache {
            cache.close().await;
        }

        *self.state.lock() = RouterState::Closed;
        info!("router closed");
    }
}

/// Round-robin view over the router inputs.
struct Inputs {
    receivers: Vec<(Source, mpsc::Receiver<Metric>)>,
    next: usize,
}

impl Inputs {
    /// Ready with the index of the first input holding a metric, scanning
    /// from where the last scan stopped. Closed inputs are removed.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<(usize, Metric)> {
        let n = self.receivers.len();
        let mut closed = Vec::new();

        for i in 0..n {
            let idx = (self.next + i) % n;
            match self.receivers[idx].1.poll_recv(cx) {
                Poll::Ready(Some(metric)) => {
                    self.next = (idx + 1) % n;
                    return Poll::Ready((idx, metric));
                }
                Poll::Ready(None) => closed.push(idx),
                Poll::Pending => {}
            }
        }

        if !closed.is_empty() {
            closed.sort_unstable();
            for idx in closed.into_iter().rev() {
                let (source, _) = self.receivers.remove(idx);
                debug!(?source, "router input closed");
            }
            self.next = 0;
        }

        Poll::Pending
    }

    /// Takes up to `limit` more metrics from input `idx` without waiting.
    fn drain(&mut self, idx: usize, limit: usize, batch: &mut Vec<Metric>) {
        let rx = &mut self.receivers[idx].1;
        while batch.len() < limit {
            match rx.try_recv() {
                Ok(metric) => batch.push(metric),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }
}

struct Forwarder {
    processor: Arc<MessageProcessor>,
    cache: Option<Arc<MetricCache>>,
    outputs: Vec<mpsc::Sender<Metric>>,
    interval_timestamp: bool,
    /// Time of the last tick, used for restamping.
    clock: SystemTime,
    stats: StatsHandle,
    forwarded: i64,
    dropped: i64,
    cached: i64,
}

impl Forwarder {
    /// Processes one metric and sends it to every output. Returns false
    /// when shutdown interrupted a send.
    async fn forward(
        &mut self,
        source: Source,
        metric: Metric,
        cancel: &CancellationToken,
    ) -> bool {
        let metric = if source == Source::Producer && self.interval_timestamp {
            metric.with_time(self.clock)
        } else {
            metric
        };

        match self.processor.process(&metric) {
            Some(out) => {
                for tx in &self.outputs {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return false,
                        res = tx.send(out.clone()) => {
                            if res.is_err() {
                                debug!("router output closed");
                            }
                        }
                    }
                }
                self.forwarded += 1;
            }
            None => self.dropped += 1,
        }

        if source == Source::Producer {
            if let Some(cache) = &self.cache {
                cache.add(metric);
                self.cached += 1;
            }
        }

        true
    }

    fn on_tick(&mut self, tick: SystemTime) {
        self.clock = tick;
        self.outputs.retain(|tx| !tx.is_closed());
        self.stats.component_stats(
            COMPONENT,
            &[
                ("forwarded", self.forwarded),
                ("dropped", self.dropped),
                ("cached", self.cached),
            ],
        );
    }
}

async fn run(
    mut worker: Forwarder,
    mut inputs: Inputs,
    mut ticks: mpsc::Receiver<Tick>,
    max_forward: usize,
    cancel: CancellationToken,
) {
    let mut batch = Vec::with_capacity(max_forward);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(tick) = ticks.recv() => {
                if let Some(now) = tick.accept() {
                    worker.on_tick(now);
                }
            }
            (idx, first) = poll_fn(|cx| inputs.poll_ready(cx)) => {
                let source = inputs.receivers[idx].0;
                batch.push(first);
                inputs.drain(idx, max_forward, &mut batch);

                for metric in batch.drain(..) {
                    if !worker.forward(source, metric, &cancel).await {
                        debug!("router send interrupted by shutdown");
                        return;
                    }
                }
            }
        }
    }

    debug!(
        forwarded = worker.forwarded,
        dropped = worker.dropped,
        cached = worker.cached,
        "router stopped"
    );
}
