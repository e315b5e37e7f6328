//! Role and leader observation channels.
//!
//! The engine publishes transitions; long-lived drain tasks consume them.
//! Channels are bounded and delivery is best-effort: a stalled consumer
//! costs observations, never engine progress.

use log::debug;
use raft::StateRole;
use tokio::sync::mpsc;

/// A leader observation. `None` means the cluster currently has no leader.
pub type LeaderObservation = Option<String>;

/// Engine-side publisher.
pub struct Observers {
    role_tx: mpsc::Sender<StateRole>,
    leader_tx: mpsc::Sender<LeaderObservation>,
}

/// Consumer-side receivers, one per observation kind.
pub struct ObserverChannels {
    pub roles: mpsc::Receiver<StateRole>,
    pub leaders: mpsc::Receiver<LeaderObservation>,
}

pub fn channel(capacity: usize) -> (Observers, ObserverChannels) {
    let (role_tx, roles) = mpsc::channel(capacity);
    let (leader_tx, leaders) = mpsc::channel(capacity);
    (
        Observers { role_tx, leader_tx },
        ObserverChannels { roles, leaders },
    )
}

impl Observers {
    pub fn role_changed(&self, role: StateRole) {
        if self.role_tx.try_send(role).is_err() {
            debug!("role observation dropped, consumer is behind");
        }
    }

    pub fn leader_changed(&self, leader: LeaderObservation) {
        if self.leader_tx.try_send(leader).is_err() {
            debug!("leader observation dropped, consumer is behind");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let (observers, mut channels) = channel(1);
        observers.role_changed(StateRole::Candidate);
        observers.role_changed(StateRole::Leader);
        observers.role_changed(StateRole::Follower);

        assert_eq!(channels.roles.recv().await.unwrap(), StateRole::Candidate);
        assert!(channels.roles.try_recv().is_err());
    }

    #[tokio::test]
    async fn leader_loss_is_observable() {
        let (observers, mut channels) = channel(4);
        observers.leader_changed(Some("node2".to_string()));
        observers.leader_changed(None);

        assert_eq!(
            channels.leaders.recv().await.unwrap(),
            Some("node2".to_string())
        );
        assert_eq!(channels.leaders.recv().await.unwrap(), None);
    }
}
