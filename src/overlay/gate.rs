//! Per-peer operation admission control.
//!
//! A peer serializes its own state mutations through a cooperative
//! compatibility scheme rather than one global lock: every inbound
//! operation declares its kind, and the gate admits it only when no
//! currently running operation conflicts with it. Routing and query
//! operations run concurrently with everything; two join-introduces on the
//! same peer conflict (racing splits); a join-introduce and leave
//! maintenance are explicitly compatible; lifecycle mutations of the same
//! kind conflict with each other and with load-balancing decisions.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// The kinds of operations a peer executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Read-only routing/query traffic.
    Routing,
    /// Handling a join-introduce (splitting the local zone).
    JoinIntroduce,
    /// Leave-side maintenance (absorbing a zone, neighbor cleanup).
    LeaveMaintenance,
    /// A load-balancing measurement/decision iteration.
    LoadBalance,
}

impl OperationKind {
    fn index(self) -> usize {
        match self {
            OperationKind::Routing => 0,
            OperationKind::JoinIntroduce => 1,
            OperationKind::LeaveMaintenance => 2,
            OperationKind::LoadBalance => 3,
        }
    }

    /// Pairwise compatibility matrix.
    pub fn compatible_with(self, other: OperationKind) -> bool {
        use OperationKind::{JoinIntroduce, LeaveMaintenance, LoadBalance, Routing};
        match (self, other) {
            (Routing, _) | (_, Routing) => true,
            (JoinIntroduce, LeaveMaintenance) | (LeaveMaintenance, JoinIntroduce) => true,
            (JoinIntroduce, JoinIntroduce)
            | (LeaveMaintenance, LeaveMaintenance)
            | (LoadBalance, _)
            | (_, LoadBalance) => false,
        }
    }
}

struct GateInner {
    running: Mutex<[usize; 4]>,
    changed: Notify,
}

/// Admission gate over the compatibility matrix.
#[derive(Clone)]
pub struct OperationGate {
    inner: Arc<GateInner>,
}

impl OperationGate {
    /// A gate with nothing running.
    pub fn new() -> Self {
        OperationGate {
            inner: Arc::new(GateInner { running: Mutex::new([0; 4]), changed: Notify::new() }),
        }
    }

    fn admissible(running: &[usize; 4], kind: OperationKind) -> bool {
        [
            OperationKind::Routing,
            OperationKind::JoinIntroduce,
            OperationKind::LeaveMaintenance,
            OperationKind::LoadBalance,
        ]
        .into_iter()
        .all(|other| running[other.index()] == 0 || kind.compatible_with(other))
    }

    /// Wait until the operation may run, then hold its admission.
    pub async fn acquire(&self, kind: OperationKind) -> OperationPermit {
        loop {
            // Arm the notification before checking, so a release between
            // check and await cannot be missed.
            let notified = self.inner.changed.notified();
            {
                let mut running =
                    self.inner.running.lock().unwrap_or_else(|e| e.into_inner());
                if Self::admissible(&running, kind) {
                    running[kind.index()] += 1;
                    return OperationPermit { gate: Arc::clone(&self.inner), kind };
                }
            }
            notified.await;
        }
    }

    /// Admit the operation only if it can run right now.
    pub fn try_acquire(&self, kind: OperationKind) -> Option<OperationPermit> {
        let mut running = self.inner.running.lock().unwrap_or_else(|e| e.into_inner());
        if Self::admissible(&running, kind) {
            running[kind.index()] += 1;
            Some(OperationPermit { gate: Arc::clone(&self.inner), kind })
        } else {
            None
        }
    }

    /// Number of operations of the given kind currently admitted.
    pub fn running(&self, kind: OperationKind) -> usize {
        self.inner.running.lock().unwrap_or_else(|e| e.into_inner())[kind.index()]
    }
}

/// Held admission; releasing it wakes waiting operations.
pub struct OperationPermit {
    gate: Arc<GateInner>,
    kind: OperationKind,
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        let mut running = self.gate.running.lock().unwrap_or_else(|e| e.into_inner());
        running[self.kind.index()] = running[self.kind.index()].saturating_sub(1);
        drop(running);
        self.gate.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_compatibility_matrix() {
        use OperationKind::{JoinIntroduce, LeaveMaintenance, LoadBalance, Routing};
        assert!(Routing.compatible_with(Routing));
        assert!(Routing.compatible_with(JoinIntroduce));
        assert!(JoinIntroduce.compatible_with(LeaveMaintenance));
        assert!(!JoinIntroduce.compatible_with(JoinIntroduce));
        assert!(!LeaveMaintenance.compatible_with(LeaveMaintenance));
        assert!(!LoadBalance.compatible_with(JoinIntroduce));
        assert!(Routing.compatible_with(LoadBalance));
    }

    #[tokio::test]
    async fn test_conflicting_join_waits_for_release() {
        let gate = OperationGate::new();
        let first = gate.acquire(OperationKind::JoinIntroduce).await;
        assert!(gate.try_acquire(OperationKind::JoinIntroduce).is_none());
        // Compatible kinds are admitted while the join runs.
        assert!(gate.try_acquire(OperationKind::LeaveMaintenance).is_some());

        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move {
            let _permit = gate2.acquire(OperationKind::JoinIntroduce).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be admitted after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_routing_is_always_admitted() {
        let gate = OperationGate::new();
        let _join = gate.acquire(OperationKind::JoinIntroduce).await;
        let _leave = gate.acquire(OperationKind::LeaveMaintenance).await;
        assert!(gate.try_acquire(OperationKind::Routing).is_some());
        assert_eq!(gate.running(OperationKind::Routing), 0);
    }
}
