//! Leadership oracle
//!
//! Election itself happens elsewhere. The federation only needs to hear when
//! this instance gains or loses leadership.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Receives leadership transitions
pub trait LeadershipListener: Send + Sync {
    /// This instance became leader
    fn on_leadership_gained(&self);

    /// This instance stopped being leader
    fn on_leadership_lost(&self);
}

/// Boolean leadership signal fanned out to listeners on change
#[derive(Default)]
pub struct LeadershipSignal {
    leader: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn LeadershipListener>>>,
}

impl LeadershipSignal {
    /// Not leader, no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. It is told immediately if this instance already leads.
    pub fn register(&self, listener: Arc<dyn LeadershipListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener.clone());
        }
        if self.is_leader() {
            listener.on_leadership_gained();
        }
    }

    /// Current leadership
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Record the election result; listeners fire only on a change
    pub fn set_leader(&self, leader: bool) {
        if self.leader.swap(leader, Ordering::SeqCst) == leader {
            return;
        }

        let listeners: Vec<_> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            if leader {
                listener.on_leadership_gained();
            } else {
                listener.on_leadership_lost();
            }
        }
    }
}
