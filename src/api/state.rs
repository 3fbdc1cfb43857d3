//! Shared state handed to every API handler.

use crate::core::Core;

use std::sync::Arc;
use std::time::Instant;

pub struct ApiState {
    pub core: Arc<Core>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            started_at: Instant::now(),
        }
    }
}
