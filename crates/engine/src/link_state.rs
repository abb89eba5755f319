//! Combines a link's carrier flag with a latched IPv6-link-local
//! readiness bit into the [`ObservedState`] the engine drives on
//! (§8 property 5: `IPV6LL` never reverts to false on an address
//! event, only on detach).

use std::cell::Cell;

use rtnl::ObservedState;

#[derive(Default)]
pub struct LinkStateTracker {
    carrier: Cell<bool>,
    ipv6ll_latched: Cell<bool>,
}

impl LinkStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_carrier(&self, carrier: bool) {
        self.carrier.set(carrier);
    }

    /// Feed the result of `RtnlCache::has_ipv6_link_local` for this
    /// link after an address event. Once latched, further `false`
    /// observations are ignored.
    pub fn observe_ipv6ll(&self, formed: bool) {
        if formed {
            self.ipv6ll_latched.set(true);
        }
    }

    /// The link identity object was removed; both bits reset.
    pub fn detach(&self) {
        self.carrier.set(false);
        self.ipv6ll_latched.set(false);
    }

    pub fn observed_state(&self) -> ObservedState {
        let mut state = ObservedState::empty();
        if self.carrier.get() {
            state |= ObservedState::CARRIER;
        }
        if self.ipv6ll_latched.get() {
            state |= ObservedState::IPV6LL;
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6ll_latches_and_survives_a_later_false_observation() {
        let tracker = LinkStateTracker::new();
        tracker.observe_ipv6ll(true);
        assert!(tracker.observed_state().contains(ObservedState::IPV6LL));

        tracker.observe_ipv6ll(false);
        assert!(tracker.observed_state().contains(ObservedState::IPV6LL));
    }

    #[test]
    fn detach_clears_both_bits() {
        let tracker = LinkStateTracker::new();
        tracker.set_carrier(true);
        tracker.observe_ipv6ll(true);

        tracker.detach();

        assert_eq!(tracker.observed_state(), ObservedState::empty());
    }

    #[test]
    fn carrier_alone_does_not_set_ipv6ll() {
        let tracker = LinkStateTracker::new();
        tracker.set_carrier(true);
        assert_eq!(tracker.observed_state(), ObservedState::CARRIER);
    }
}
