//! Debounced online/offline signal.
//!
//! Raw reachability is the platform link state combined with the result of
//! the last backend probe. Losing reachability is reported at once; regaining
//! it is reported only after it has held for the hold-down window, so a
//! flapping connection cannot start a drain on every blip.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::remote::{RemoteClient, with_timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    Up,
    #[default]
    Down,
}

/// Pure hold-down state machine. Starts offline.
#[derive(Debug, Clone)]
pub struct Debouncer {
    hold_down: Duration,
    stable: bool,
    candidate_since: Option<Instant>,
}

impl Debouncer {
    pub fn new(hold_down: Duration) -> Self {
        Self {
            hold_down,
            stable: false,
            candidate_since: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.stable
    }

    /// Feed a raw reading. Returns the new stable state when it changed.
    pub fn observe(&mut self, reachable: bool, now: Instant) -> Option<bool> {
        if !reachable {
            self.candidate_since = None;
            if self.stable {
                self.stable = false;
                return Some(false);
            }
            return None;
        }
        if self.stable {
            return None;
        }
        let since = *self.candidate_since.get_or_insert(now);
        self.settle(since, now)
    }

    /// Promote a pending "online" reading once the window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        match self.candidate_since {
            Some(since) if !self.stable => self.settle(since, now),
            _ => None,
        }
    }

    /// When the pending "online" reading becomes stable, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.candidate_since.map(|since| since + self.hold_down)
    }

    fn settle(&mut self, since: Instant, now: Instant) -> Option<bool> {
        if now.duration_since(since) >= self.hold_down {
            self.stable = true;
            self.candidate_since = None;
            Some(true)
        } else {
            None
        }
    }
}

/// Background task publishing the debounced state. Aborted on drop.
pub struct ConnectivityMonitor {
    online: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl ConnectivityMonitor {
    pub fn spawn(
        remote: Arc<dyn RemoteClient>,
        link: watch::Receiver<LinkState>,
        hold_down: Duration,
        probe_interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        let (online_tx, online) = watch::channel(false);
        let task = tokio::spawn(run_monitor(
            remote,
            link,
            online_tx,
            Debouncer::new(hold_down),
            probe_interval,
            call_timeout,
        ));
        Self { online, task }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.clone()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_monitor(
    remote: Arc<dyn RemoteClient>,
    mut link: watch::Receiver<LinkState>,
    online_tx: watch::Sender<bool>,
    mut debouncer: Debouncer,
    probe_interval: Duration,
    call_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut probe_ok = false;

    loop {
        let link_up = *link.borrow_and_update() == LinkState::Up;
        if let Some(online) = debouncer.observe(link_up && probe_ok, Instant::now()) {
            publish(&online_tx, online);
        }
        let deadline = debouncer.deadline();

        tokio::select! {
            changed = link.changed() => {
                if changed.is_err() {
                    break;
                }
                if *link.borrow() == LinkState::Up {
                    probe_ok = probe(remote.as_ref(), call_timeout).await;
                }
            }
            _ = ticker.tick() => {
                if link_up {
                    probe_ok = probe(remote.as_ref(), call_timeout).await;
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(online) = debouncer.poll(Instant::now()) {
                    publish(&online_tx, online);
                }
            }
        }

        if online_tx.is_closed() {
            break;
        }
    }
}

async fn probe(remote: &dyn RemoteClient, call_timeout: Duration) -> bool {
    match with_timeout(call_timeout, remote.probe()).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "reachability probe failed");
            false
        }
    }
}

fn publish(online_tx: &watch::Sender<bool>, online: bool) {
    info!(online, "connectivity changed");
    online_tx.send_replace(online);
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOLD: Duration = Duration::from_secs(2);

    #[test]
    fn online_requires_stable_window() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(HOLD);

        assert_eq!(d.observe(true, t0), None);
        assert_eq!(d.deadline(), Some(t0 + HOLD));
        assert_eq!(d.poll(t0 + Duration::from_millis(1_999)), None);
        assert_eq!(d.poll(t0 + HOLD), Some(true));
        assert!(d.is_online());
        assert_eq!(d.deadline(), None);
    }

    #[test]
    fn offline_is_immediate() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(HOLD);
        d.observe(true, t0);
        d.poll(t0 + HOLD);

        assert_eq!(d.observe(false, t0 + HOLD), Some(false));
        assert_eq!(d.observe(false, t0 + HOLD), None);
    }

    #[test]
    fn flap_restarts_the_window() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(HOLD);
        d.observe(true, t0);
        d.observe(false, t0 + Duration::from_millis(1_500));
        d.observe(true, t0 + Duration::from_millis(1_600));

        assert_eq!(d.poll(t0 + HOLD), None);
        assert_eq!(d.deadline(), Some(t0 + Duration::from_millis(1_600) + HOLD));
        assert_eq!(d.poll(t0 + Duration::from_millis(3_600)), Some(true));
    }

    #[test]
    fn zero_hold_down_is_immediate() {
        let mut d = Debouncer::new(Duration::ZERO);
        assert_eq!(d.observe(true, Instant::now()), Some(true));
    }
}
