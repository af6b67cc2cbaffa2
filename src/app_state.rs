use std::sync::Arc;

use crate::pipeline::Submitter;
use crate::services::{job_store::JobStore, queue::StageQueue};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub submitter: Submitter,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn StageQueue>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn StageQueue>) -> Self {
        Self {
            submitter: Submitter::new(store.clone(), queue.clone()),
            store,
            queue,
        }
    }
}
