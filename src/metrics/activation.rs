//! Event-triggered metric activation. A metric with activations configured
//! is inactive by default and aggregates only while at least one
//! activation's TTL window is open; windows open when the activation
//! matcher fires and close on TTL expiry or an explicit deactivation
//! matcher, whichever comes first.

use crate::matcher::MatcherResults;

/// One activation trigger with its currently-open window, if any.
#[derive(Debug, Clone)]
pub struct EventActivation {
    pub matcher: usize,
    pub ttl_ns: i64,
    pub deactivation_matcher: Option<usize>,
    pub active_until_ns: Option<i64>,
}

/// An activation edge the producer must turn into a bucket split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationTransition {
    pub became_active: bool,
    pub at_ns: i64,
}

/// Activation state for one metric producer. Metrics with no activation
/// config are always active.
#[derive(Debug, Clone, Default)]
pub struct ActivationState {
    activations: Vec<EventActivation>,
    /// Whether the metric was active the last time anyone looked; used to
    /// detect TTL lapses between events.
    was_active: bool,
}

impl ActivationState {
    pub fn new(activations: Vec<EventActivation>) -> Self {
        let always = activations.is_empty();
        Self {
            activations,
            was_active: always,
        }
    }

    pub fn always_active(&self) -> bool {
        self.activations.is_empty()
    }

    /// Whether any activation window is open at `now` (OR across windows).
    pub fn is_active(&self, now_ns: i64) -> bool {
        self.always_active()
            || self
                .activations
                .iter()
                .any(|a| a.active_until_ns.map(|u| now_ns < u).unwrap_or(false))
    }

    /// Detects a TTL lapse since the last check without any event: returns
    /// the deactivation edge at the instant the last window closed.
    pub fn refresh(&mut self, now_ns: i64) -> Option<ActivationTransition> {
        if self.always_active() {
            return None;
        }
        let now_active = self.is_active(now_ns);
        if self.was_active && !now_active {
            let lapse_at = self
                .activations
                .iter()
                .filter_map(|a| a.active_until_ns)
                .max()
                .unwrap_or(now_ns);
            self.was_active = false;
            for a in &mut self.activations {
                a.active_until_ns = None;
            }
            return Some(ActivationTransition {
                became_active: false,
                at_ns: lapse_at,
            });
        }
        self.was_active = now_active;
        None
    }

    /// Applies activation/deactivation matcher firings from one event.
    pub fn on_event(
        &mut self,
        matched: &MatcherResults,
        now_ns: i64,
    ) -> Option<ActivationTransition> {
        if self.always_active() {
            return None;
        }

        // A TTL lapse strictly before this event is its own edge.
        if let Some(t) = self.refresh(now_ns) {
            // Apply the event's triggers below; the lapse edge is reported
            // only when no re-activation happens in the same event.
            self.apply_matchers(matched, now_ns);
            let now_active = self.is_active(now_ns);
            self.was_active = now_active;
            if now_active {
                return Some(ActivationTransition {
                    became_active: true,
                    at_ns: now_ns,
                });
            }
            return Some(t);
        }

        let before = self.is_active(now_ns);
        self.apply_matchers(matched, now_ns);
        let after = self.is_active(now_ns);
        self.was_active = after;

        if before != after {
            Some(ActivationTransition {
                became_active: after,
                at_ns: now_ns,
            })
        } else {
            None
        }
    }

    /// Re-points matcher indices after a modular config update. The
    /// activation definitions are unchanged by contract, so entries align
    /// by position; open windows are preserved.
    pub fn rebind(&mut self, fresh: Vec<EventActivation>) {
        for (slot, new) in self.activations.iter_mut().zip(fresh) {
            slot.matcher = new.matcher;
            slot.deactivation_matcher = new.deactivation_matcher;
            slot.ttl_ns = new.ttl_ns;
        }
    }

    fn apply_matchers(&mut self, matched: &MatcherResults, now_ns: i64) {
        for a in &mut self.activations {
            if matched.matched[a.matcher] {
                // Repeated triggers extend the window from the newest event.
                a.active_until_ns = Some(now_ns + a.ttl_ns);
            }
            if let Some(d) = a.deactivation_matcher {
                if matched.matched[d] {
                    a.active_until_ns = None;
                }
            }
        }
    }
}
