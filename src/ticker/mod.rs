use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One tick offered to one subscriber.
///
/// The handoff completes only when the subscriber calls [`Tick::accept`];
/// the ticker waits for that before offering the tick to the next
/// subscriber.
#[derive(Debug)]
pub struct Tick {
    time: SystemTime,
    ack: oneshot::Sender<()>,
}

impl Tick {
    /// Completes the handoff. `None` if the ticker gave up on this
    /// delivery, which only happens once it is closing.
    pub fn accept(self) -> Option<SystemTime> {
        let Tick { time, ack } = self;
        ack.send(()).ok().map(|()| time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerState {
    Created,
    Running,
    Closing,
    Closed,
}

/// Periodic clock that hands the same timestamp to every subscriber.
///
/// Deliveries within a tick are sequential: subscriber k+1 is only offered
/// the tick after subscriber k accepted it, so one slow subscriber holds up
/// the rest. No tick is accepted once `close` has returned.
pub struct MultiChanTicker {
    period: Duration,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Tick>>>>,
    state: Arc<Mutex<TickerState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MultiChanTicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiChanTicker")
            .field("period", &self.period)
            .field("state", &self.state())
            .finish()
    }
}

impl MultiChanTicker {
    pub fn new(period: Duration) -> Result<Self> {
        if period.is_zero() {
            bail!("ticker period must be > 0");
        }

        Ok(Self {
            period,
            subscribers: Arc::new(Mutex::new(Vec::with_capacity(4))),
            state: Arc::new(Mutex::new(TickerState::Created)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn state(&self) -> TickerState {
        *self.state.lock()
    }

    /// Registers a subscriber. Subscribers are never removed explicitly;
    /// dropping the receiver unsubscribes on the next tick.
    pub fn add_channel(&self, tx: mpsc::Sender<Tick>) {
        self.subscribers.lock().push(tx);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Starts broadcasting. The first tick fires one period from now.
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            if *state != TickerState::Created {
                debug!(state = ?*state, "ticker already started");
                return;
            }
            *state = TickerState::Running;
        }

        let period = self.period;
        let subscribers = Arc::clone(&self.subscribers);
        let cancel = self.cancel.clone();

        info!(?period, "ticker started");

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let now = SystemTime::now();
                let targets: Vec<_> = subscribers.lock().clone();
                let mut saw_closed = false;

                for tx in &targets {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!("ticker closed during broadcast");
                            return;
                        }
                        accepted = handoff(tx, now) => {
                            if !accepted {
                                saw_closed = true;
                            }
                        }
                    }
                }

                if saw_closed {
                    let mut subs = subscribers.lock();
                    let before = subs.len();
                    subs.retain(|tx| !tx.is_closed());
                    debug!(pruned = before - subs.len(), "dropped closed ticker subscribers");
                }
            }

            debug!("ticker stopped");
        });

        *self.task.lock() = Some(handle);
    }

    /// Stops the ticker. No tick can be accepted once this returns and
    /// every subscriber channel is closed.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == TickerState::Closed {
                return;
            }
            *state = TickerState::Closing;
        }

        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "ticker task failed");
            }
        }

        // Subscribers see their channel close.
        self.subscribers.lock().clear();
        *self.state.lock() = TickerState::Closed;
    }
}

/// Offers `now` to one subscriber and waits until it is accepted. False
/// when the subscriber is gone or dropped the tick unaccepted.
async fn handoff(tx: &mpsc::Sender<Tick>, now: SystemTime) -> bool {
    let (ack, accepted) = oneshot::channel();
    if tx.send(Tick { time: now, ack }).await.is_err() {
        return false;
    }
    accepted.await.is_ok()
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;

    async fn next_tick(rx: &mut mpsc::Receiver<Tick>) -> SystemTime {
        let tick = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("tick in time")
            .expect("open channel");
        tick.accept().expect("ticker running")
    }

    #[test]
    fn test_new_rejects_zero_period() {
        let err = MultiChanTicker::new(Duration::ZERO).expect_err("zero period");
        assert!(err.to_string().contains("period"));
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_same_timestamp() {
        let ticker = MultiChanTicker::new(Duration::from_millis(20)).expect("valid period");
        let (tx1, mut rx1) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(1);
        ticker.add_channel(tx1);
        ticker.add_channel(tx2);

        ticker.start();
        assert_eq!(ticker.state(), TickerState::Running);

        let a = next_tick(&mut rx1).await;
        let b = next_tick(&mut rx2).await;
        assert_eq!(a, b);

        ticker.close().await;
        assert_eq!(ticker.state(), TickerState::Closed);
    }

    #[tokio::test]
    async fn test_next_subscriber_waits_for_accept() {
        let ticker = MultiChanTicker::new(Duration::from_millis(10)).expect("valid period");
        let (tx1, mut rx1) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(1);
        ticker.add_channel(tx1);
        ticker.add_channel(tx2);
        ticker.start();

        // Subscriber 1 holds its tick without accepting it.
        let held = timeout(Duration::from_secs(2), rx1.recv())
            .await
            .expect("tick in time")
            .expect("open channel");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx2.try_recv().is_err(), "subscriber 2 ticked before subscriber 1 accepted");

        let t = held.accept().expect("ticker running");
        assert_eq!(next_tick(&mut rx2).await, t);

        ticker.close().await;
    }

    #[tokio::test]
    async fn test_close_during_blocked_broadcast() {
        let ticker = MultiChanTicker::new(Duration::from_millis(10)).expect("valid period");
        let (tx1, mut rx1) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(1);
        ticker.add_channel(tx1);
        ticker.add_channel(tx2);
        ticker.start();

        let pending = timeout(Duration::from_secs(2), rx1.recv())
            .await
            .expect("tick in time")
            .expect("open channel");

        timeout(Duration::from_secs(2), ticker.close())
            .await
            .expect("close returns while a handoff is pending");

        // The tick in flight can no longer be accepted and nothing follows.
        assert_eq!(pending.accept(), None);
        assert!(rx2.try_recv().is_err());
        assert!(rx1.recv().await.is_none());
        assert!(rx2.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let ticker = MultiChanTicker::new(Duration::from_millis(10)).expect("valid period");
        let (tx1, rx1) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(1);
        ticker.add_channel(tx1);
        ticker.add_channel(tx2);
        drop(rx1);

        ticker.start();
        next_tick(&mut rx2).await;

        // Pruning happens right after the broadcast that hit the closed one.
        for _ in 0..50 {
            if ticker.subscriber_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ticker.subscriber_count(), 1);

        ticker.close().await;
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let ticker = MultiChanTicker::new(Duration::from_secs(1)).expect("valid period");
        ticker.close().await;
        assert_eq!(ticker.state(), TickerState::Closed);
        ticker.start();
        assert_eq!(ticker.state(), TickerState::Closed);
    }
}
