//! In-memory circuit-breaker store, the default when no persistent store
//! is injected. State survives across runs within one process.

use std::collections::HashMap;
use std::sync::Mutex;

use operon_core::traits::CircuitBreakerStore;
use operon_core::types::{BreakerKey, BreakerState};

#[derive(Default)]
pub struct InMemoryBreakerStore {
    states: Mutex<HashMap<BreakerKey, BreakerState>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CircuitBreakerStore for InMemoryBreakerStore {
    fn load(&self, key: &BreakerKey) -> BreakerState {
        self.states
            .lock()
            .map(|map| map.get(key).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn store(&self, key: &BreakerKey, state: BreakerState) {
        if let Ok(mut map) = self.states.lock() {
            map.insert(key.clone(), state);
        }
    }
}
