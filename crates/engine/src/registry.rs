//! Keeps one [`IpAcquisitionEngine`] per non-loopback link (§4.8).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use rtnl::ObservedState;

use crate::engine::{AddressInstaller, IpAcquisitionEngine};
use crate::error::EngineError;

/// Owns the per-link engines the daemon's integration harness drives
/// from the RTNL cache's link subscription. Not `Send`/`Sync`; lives
/// on the same single-threaded event loop as everything else (§5).
pub struct EngineRegistry<I: AddressInstaller + 'static> {
    engines: RefCell<HashMap<u32, Rc<IpAcquisitionEngine<I>>>>,
}

impl<I: AddressInstaller + 'static> Default for EngineRegistry<I> {
    fn default() -> Self {
        Self {
            engines: RefCell::new(HashMap::new()),
        }
    }
}

impl<I: AddressInstaller + 'static> EngineRegistry<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and start an engine for `ifindex`, bootstrapped at
    /// `initial_state`. Fails if one is already registered for this
    /// link; the caller should `remove` on link-removal events first.
    pub fn insert(
        &self,
        ifindex: u32,
        engine: Rc<IpAcquisitionEngine<I>>,
        initial_state: ObservedState,
    ) -> Result<(), EngineError> {
        let mut engines = self.engines.borrow_mut();
        if engines.contains_key(&ifindex) {
            return Err(EngineError::AlreadyRunning(ifindex));
        }
        engine.start(initial_state);
        engines.insert(ifindex, engine);
        Ok(())
    }

    /// Forward an observed link-state change to the engine for
    /// `ifindex`.
    pub fn on_link_state(&self, ifindex: u32, new_state: ObservedState) -> Result<(), EngineError> {
        let engines = self.engines.borrow();
        let engine = engines.get(&ifindex).ok_or(EngineError::UnknownLink(ifindex))?;
        engine.on_link_state(new_state);
        Ok(())
    }

    /// Stop and drop the engine for a removed link.
    pub fn remove(&self, ifindex: u32) -> Result<(), EngineError> {
        let engine = self
            .engines
            .borrow_mut()
            .remove(&ifindex)
            .ok_or(EngineError::UnknownLink(ifindex))?;
        engine.stop();
        Ok(())
    }

    pub fn contains(&self, ifindex: u32) -> bool {
        self.engines.borrow().contains_key(&ifindex)
    }

    pub fn len(&self) -> usize {
        self.engines.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Dhcp4Client, Dhcp6Client, Ipv4LinkLocal, RouterDiscoveryClient};

    #[derive(Default)]
    struct NullInstaller;

    impl AddressInstaller for NullInstaller {
        fn create_address(&self, _ifindex: u32, _family: u8, _prefix: &[u8], _prefix_len: u8, _broadcast: Option<&[u8]>) {}
        fn destroy_address(&self, _ifindex: u32, _family: u8, _prefix: &[u8], _prefix_len: u8) {}
        fn create_route(&self, _family: u8, _dst: &[u8], _dst_prefix_len: u8, _gateway: Option<&[u8]>, _oif: u32) {}
        fn destroy_route(&self, _family: u8, _dst: &[u8], _dst_prefix_len: u8, _oif: u32) {}
    }

    fn engine(ifindex: u32) -> Rc<IpAcquisitionEngine<NullInstaller>> {
        IpAcquisitionEngine::new(
            ifindex,
            [0; 6],
            0,
            NullInstaller,
            Rc::new(Ipv4LinkLocal::new()),
            Rc::new(Dhcp4Client::new()),
            Rc::new(Dhcp6Client::new()),
            Rc::new(RouterDiscoveryClient::new()),
        )
    }

    #[test]
    fn insert_then_duplicate_insert_fails() {
        let registry: EngineRegistry<NullInstaller> = EngineRegistry::new();
        registry.insert(3, engine(3), ObservedState::empty()).unwrap();

        let err = registry.insert(3, engine(3), ObservedState::empty()).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(3)));
    }

    #[test]
    fn on_link_state_for_unknown_ifindex_fails() {
        let registry: EngineRegistry<NullInstaller> = EngineRegistry::new();
        let err = registry.on_link_state(9, ObservedState::CARRIER).unwrap_err();
        assert!(matches!(err, EngineError::UnknownLink(9)));
    }

    #[test]
    fn remove_stops_and_forgets_the_engine() {
        let registry: EngineRegistry<NullInstaller> = EngineRegistry::new();
        registry.insert(3, engine(3), ObservedState::CARRIER).unwrap();
        assert_eq!(registry.len(), 1);

        registry.remove(3).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.remove(3).unwrap_err(),
            EngineError::UnknownLink(3)
        ));
    }
}
