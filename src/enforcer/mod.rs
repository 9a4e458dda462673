//! Contract with the host-side traffic-control enforcer.
//!
//! The enforcer maps per-flow priorities onto kernel queueing disciplines on
//! the end hosts. It is an external collaborator: the admission core only
//! pushes priority updates and revocations through this narrow interface,
//! and a failure to reach an enforcer never changes an admission verdict
//! that was already made.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

/// The two operations the admission core consumes.
pub trait Enforcer: Send {
    /// Install or update the priority of the flow between the given hosts.
    fn update(&self, enforcer_addr: &str, dst_addr: &str, src_addr: &str, priority: u32);

    /// Remove the flow's priority configuration.
    fn remove(&self, enforcer_addr: &str, dst_addr: &str, src_addr: &str);
}

impl<T: Enforcer + Sync + ?Sized> Enforcer for Arc<T> {
    fn update(&self, enforcer_addr: &str, dst_addr: &str, src_addr: &str, priority: u32) {
        (**self).update(enforcer_addr, dst_addr, src_addr, priority);
    }

    fn remove(&self, enforcer_addr: &str, dst_addr: &str, src_addr: &str) {
        (**self).remove(enforcer_addr, dst_addr, src_addr);
    }
}

/// Production default: log the intents and let an external wiring deliver
/// them.
#[derive(Debug, Default)]
pub struct LoggingEnforcer;

impl Enforcer for LoggingEnforcer {
    fn update(&self, enforcer_addr: &str, dst_addr: &str, src_addr: &str, priority: u32) {
        info!(
            enforcer = enforcer_addr,
            dst = dst_addr,
            src = src_addr,
            priority,
            "enforcer update",
        );
    }

    fn remove(&self, enforcer_addr: &str, dst_addr: &str, src_addr: &str) {
        info!(
            enforcer = enforcer_addr,
            dst = dst_addr,
            src = src_addr,
            "enforcer remove",
        );
    }
}

/// What a recording enforcer captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcerEvent {
    Update {
        enforcer_addr: String,
        dst_addr: String,
        src_addr: String,
        priority: u32,
    },
    Remove {
        enforcer_addr: String,
        dst_addr: String,
        src_addr: String,
    },
}

/// Test double that records every call.
#[derive(Debug, Default)]
pub struct RecordingEnforcer {
    events: Mutex<Vec<EnforcerEvent>>,
}

impl RecordingEnforcer {
    /// All events recorded so far, in call order.
    pub fn events(&self) -> Vec<EnforcerEvent> {
        self.events.lock().clone()
    }
}

impl Enforcer for RecordingEnforcer {
    fn update(&self, enforcer_addr: &str, dst_addr: &str, src_addr: &str, priority: u32) {
        self.events.lock().push(EnforcerEvent::Update {
            enforcer_addr: enforcer_addr.to_string(),
            dst_addr: dst_addr.to_string(),
            src_addr: src_addr.to_string(),
            priority,
        });
    }

    fn remove(&self, enforcer_addr: &str, dst_addr: &str, src_addr: &str) {
        self.events.lock().push(EnforcerEvent::Remove {
            enforcer_addr: enforcer_addr.to_string(),
            dst_addr: dst_addr.to_string(),
            src_addr: src_addr.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_enforcer_captures_calls_in_order() {
        let rec = RecordingEnforcer::default();
        rec.update("e1", "10.0.0.2", "10.0.0.1", 0);
        rec.remove("e1", "10.0.0.2", "10.0.0.1");

        let events = rec.events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            EnforcerEvent::Update {
                enforcer_addr: "e1".to_string(),
                dst_addr: "10.0.0.2".to_string(),
                src_addr: "10.0.0.1".to_string(),
                priority: 0,
            }
        );
        assert!(matches!(events[1], EnforcerEvent::Remove { .. }));
    }

    #[test]
    fn test_arc_enforcer_forwards() {
        let rec = Arc::new(RecordingEnforcer::default());
        let as_trait: Box<dyn Enforcer> = Box::new(rec.clone());
        as_trait.update("e", "d", "s", 3);
        assert_eq!(rec.events().len(), 1);
    }
}
