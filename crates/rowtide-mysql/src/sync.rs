//! Shared engine state: lifecycle, snapshot completion and position.
//!
//! The run loop is the only writer of each cell. Readers on other tasks
//! observe through atomics and `watch` channels, so none of these block the
//! stream.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use rowtide_core::Position;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Created = 0,
    SnapshotRunning = 1,
    SnapshotDone = 2,
    Streaming = 3,
    Closed = 4,
    Failed = 5,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EngineState::Created,
            1 => EngineState::SnapshotRunning,
            2 => EngineState::SnapshotDone,
            3 => EngineState::Streaming,
            4 => EngineState::Closed,
            _ => EngineState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EngineState::Closed | EngineState::Failed)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Created => "created",
            EngineState::SnapshotRunning => "snapshot running",
            EngineState::SnapshotDone => "snapshot done",
            EngineState::Streaming => "streaming",
            EngineState::Closed => "closed",
            EngineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lifecycle state. Terminal states are sticky.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(EngineState::Created as u8))
    }
}

impl StateCell {
    pub fn get(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` unless the engine already reached a terminal state.
    /// Returns the state now in effect.
    pub fn set(&self, next: EngineState) -> EngineState {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if EngineState::from_u8(current).is_terminal() {
                return EngineState::from_u8(current);
            }
            match self.0.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Pending,
    Done,
    /// The snapshot will never complete (engine closed or failed first).
    Aborted,
}

/// One-shot latch released when the snapshot phase ends.
#[derive(Debug)]
pub struct SnapshotLatch {
    tx: watch::Sender<SnapshotStatus>,
}

impl Default for SnapshotLatch {
    fn default() -> Self {
        let (tx, _) = watch::channel(SnapshotStatus::Pending);
        Self { tx }
    }
}

impl SnapshotLatch {
    pub fn status(&self) -> SnapshotStatus {
        *self.tx.borrow()
    }

    /// Release waiters. Only the first resolution counts.
    pub fn resolve(&self, status: SnapshotStatus) {
        self.tx.send_if_modified(|current| {
            if *current == SnapshotStatus::Pending && status != SnapshotStatus::Pending {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the latch is released and return how it ended.
    pub async fn wait(&self) -> SnapshotStatus {
        let mut rx = self.tx.subscribe();
        let status = match rx.wait_for(|s| *s != SnapshotStatus::Pending).await {
            Ok(status) => *status,
            Err(_) => SnapshotStatus::Aborted,
        };
        status
    }
}

/// Last processed position and last synced (transaction boundary) position.
#[derive(Debug)]
pub struct PositionTracker {
    current: watch::Sender<Position>,
    synced: watch::Sender<Position>,
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new(Position::default())
    }
}

impl PositionTracker {
    pub fn new(start: Position) -> Self {
        let (current, _) = watch::channel(start.clone());
        let (synced, _) = watch::channel(start);
        Self { current, synced }
    }

    pub fn current(&self) -> Position {
        self.current.borrow().clone()
    }

    pub fn synced(&self) -> Position {
        self.synced.borrow().clone()
    }

    /// Record a processed position. Positions behind the current one are
    /// ignored so observers never see the position move backwards.
    pub fn advance(&self, to: Position) -> bool {
        self.current.send_if_modified(|current| {
            if to > *current {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// Record a position that is safe to resume from.
    pub fn mark_synced(&self, to: Position) {
        self.advance(to.clone());
        self.synced.send_if_modified(|synced| {
            if to > *synced {
                *synced = to;
                true
            } else {
                false
            }
        });
    }

    /// Reset both cells, only valid before streaming starts.
    pub fn reset(&self, to: Position) {
        self.current.send_replace(to.clone());
        self.synced.send_replace(to);
    }

    pub fn subscribe(&self) -> watch::Receiver<Position> {
        self.current.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_terminal_states_are_sticky() {
        let state = StateCell::default();
        assert_eq!(state.get(), EngineState::Created);
        assert_eq!(state.set(EngineState::Streaming), EngineState::Streaming);
        assert_eq!(state.set(EngineState::Closed), EngineState::Closed);
        assert_eq!(state.set(EngineState::Streaming), EngineState::Closed);
        assert_eq!(state.set(EngineState::Failed), EngineState::Closed);
        assert_eq!(state.get().to_string(), "closed");
    }

    #[tokio::test]
    async fn test_latch_releases_waiters_once() {
        let latch = std::sync::Arc::new(SnapshotLatch::default());
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        latch.resolve(SnapshotStatus::Done);
        latch.resolve(SnapshotStatus::Aborted);

        assert_eq!(waiter.await.unwrap(), SnapshotStatus::Done);
        assert_eq!(latch.status(), SnapshotStatus::Done);
        assert_eq!(latch.wait().await, SnapshotStatus::Done);
    }

    #[test]
    fn test_position_never_moves_back() {
        let tracker = PositionTracker::new(Position::new("mysql-bin.000001", 4));
        assert!(tracker.advance(Position::new("mysql-bin.000001", 200)));
        assert!(!tracker.advance(Position::new("mysql-bin.000001", 100)));
        assert!(tracker.advance(Position::new("mysql-bin.000002", 4)));
        assert_eq!(tracker.current(), Position::new("mysql-bin.000002", 4));
        assert_eq!(tracker.synced(), Position::new("mysql-bin.000001", 4));

        tracker.mark_synced(Position::new("mysql-bin.000002", 120));
        assert_eq!(tracker.synced(), Position::new("mysql-bin.000002", 120));
        assert_eq!(tracker.current(), Position::new("mysql-bin.000002", 120));
    }
}
