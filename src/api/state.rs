use std::sync::Arc;

use crate::config::ServerConfig;
use crate::pipeline::Application;

#[derive(Clone)]
pub struct AppState {
    pub app: Arc<Application>,
    pub max_payload_bytes: usize,
}

impl AppState {
    pub fn new(app: Arc<Application>, server: &ServerConfig) -> Self {
        Self {
            app,
            max_payload_bytes: server.max_payload_bytes.as_usize(),
        }
    }
}
