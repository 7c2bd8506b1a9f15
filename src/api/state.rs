//! Shared state handed to every handler.

use crate::Runtime;
use std::sync::Arc;

pub struct ApiState {
    pub runtime: Arc<Runtime>,
}

impl ApiState {
    pub fn new(runtime: Arc<Runtime>) -> Arc<Self> {
        Arc::new(Self { runtime })
    }
}
