//! Cluster-degradation state (C7): a disconnect counter plus a bounded,
//! append-only log of rows written while the cluster was degraded. The
//! engine consults this to decide whether a partially-delivered write needs
//! to be remembered for later reconciliation, and refuses further degraded
//! writes once the log is full (§3 "Cluster-degradation record", §7
//! back-pressure).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ec_types::{EcalError, DEFAULT_WRITE_LOG_CAP};
use tracing::{info, warn};

/// Tracks live disconnect events and the rows written while any peer was
/// unreachable. Draining/resetting the log is an out-of-scope recovery
/// operation (§4.7); from the engine's side only `observe_disconnect` and
/// `record_write` are exercised in the hot path.
pub struct DegradationState {
    dead_peers: AtomicUsize,
    write_log: Mutex<Vec<u64>>,
    cap: usize,
}

impl DegradationState {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WRITE_LOG_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            dead_peers: AtomicUsize::new(0),
            write_log: Mutex::new(Vec::new()),
            cap,
        }
    }

    /// Number of peers currently believed dead.
    pub fn dead_peer_count(&self) -> usize {
        self.dead_peers.load(Ordering::Acquire)
    }

    pub fn is_degraded(&self) -> bool {
        self.dead_peer_count() > 0
    }

    /// Record that a peer disconnected. Monotonic: the transport calls this
    /// once per disconnect event, never decrements it directly (reconnect
    /// handling is out of scope; see §9 design notes).
    pub fn observe_disconnect(&self) {
        let prev = self.dead_peers.fetch_add(1, Ordering::AcqRel);
        warn!(target: "degraded", dead_peers = prev + 1, "peer disconnect observed");
    }

    /// Mark a peer reachable again, decrementing the dead-peer counter. Does
    /// not touch the write log; draining it is the out-of-scope recovery
    /// procedure's job.
    pub fn observe_reconnect(&self) {
        let prev = self.dead_peers.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            Some(n.saturating_sub(1))
        });
        if let Ok(prev) = prev {
            info!(target: "degraded", dead_peers = prev.saturating_sub(1), "peer reconnect observed");
        }
    }

    /// Append `row` to the write log, unless the log is already at
    /// capacity, in which case writes are refused until an out-of-scope
    /// drain resets it (§7 back-pressure; this tightens the source's
    /// silent-drop-after-warning behavior, see §9 design notes).
    pub fn record_write(&self, row: u64) -> Result<(), EcalError> {
        let mut log = self.write_log.lock().expect("write log mutex poisoned");
        if log.len() >= self.cap {
            return Err(EcalError::WriteLogFull);
        }
        log.push(row);
        Ok(())
    }

    pub fn write_log_len(&self) -> usize {
        self.write_log.lock().expect("write log mutex poisoned").len()
    }

    pub fn write_log_snapshot(&self) -> Vec<u64> {
        self.write_log.lock().expect("write log mutex poisoned").clone()
    }

    /// Out-of-scope recovery hook: clears the write log after its rows have
    /// been reconciled elsewhere. Does not touch the dead-peer counter.
    pub fn drain_write_log(&self) -> Vec<u64> {
        let mut log = self.write_log.lock().expect("write log mutex poisoned");
        std::mem::take(&mut *log)
    }
}

impl Default for DegradationState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_not_degraded() {
        let state = DegradationState::new();
        assert!(!state.is_degraded());
        assert_eq!(state.dead_peer_count(), 0);
    }

    #[test]
    fn disconnect_then_reconnect_round_trips_counter() {
        let state = DegradationState::new();
        state.observe_disconnect();
        assert!(state.is_degraded());
        assert_eq!(state.dead_peer_count(), 1);
        state.observe_reconnect();
        assert!(!state.is_degraded());
    }

    #[test]
    fn record_write_appends_rows_in_order() {
        let state = DegradationState::new();
        state.record_write(5).unwrap();
        state.record_write(7).unwrap();
        assert_eq!(state.write_log_snapshot(), vec![5, 7]);
    }

    #[test]
    fn record_write_refuses_once_capacity_is_exceeded() {
        let state = DegradationState::with_capacity(2);
        state.record_write(1).unwrap();
        state.record_write(2).unwrap();
        let err = state.record_write(3).unwrap_err();
        assert!(matches!(err, EcalError::WriteLogFull));
        assert_eq!(state.write_log_len(), 2);
    }

    #[test]
    fn drain_resets_log_but_not_dead_peer_count() {
        let state = DegradationState::new();
        state.observe_disconnect();
        state.record_write(9).unwrap();
        let drained = state.drain_write_log();
        assert_eq!(drained, vec![9]);
        assert_eq!(state.write_log_len(), 0);
        assert!(state.is_degraded());
    }
}
