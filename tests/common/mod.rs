//! Common utilities for Thoth integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use thoth::prelude::*;

/// Creates an engine with default settings and the given isolation level.
pub fn setup_thoth(isolation: IsolationLevel) -> Arc<Thoth> {
    let config = StmConfig {
        isolation_level: isolation,
        ..StmConfig::default()
    };
    Arc::new(Thoth::new(config).expect("default configuration is valid"))
}

/// Factory for manually driven update transactions: writes are allowed from
/// the first attempt and reads are tracked.
pub fn update_factory(thoth: &Thoth, family: &str) -> TransactionFactory {
    let config = thoth
        .transaction_config(family)
        .with_readonly(false)
        .with_track_reads(true);
    thoth
        .transaction_factory(config)
        .expect("update configuration is valid")
}

/// Lifecycle listener that records every event it sees.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: LifecycleEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|seen| **seen == event)
            .count()
    }
}

impl TransactionLifecycleListener for EventRecorder {
    fn notify(&self, _view: &TransactionView<'_>, event: LifecycleEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn is_conflict(result: &Result<()>) -> bool {
    matches!(result, Err(err) if err.is_conflict())
}
