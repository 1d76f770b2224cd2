use std::sync::Arc;

use crate::config::Settings;
use crate::service::QueueService;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub service: Arc<QueueService>,
}

impl AppState {
    pub fn new(settings: Arc<Settings>, service: Arc<QueueService>) -> Self {
        Self { settings, service }
    }
}
