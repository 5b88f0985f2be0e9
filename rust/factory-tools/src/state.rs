use crate::{config::AppConfig, tools::ToolDispatcher};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub dispatcher: ToolDispatcher,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, dispatcher: ToolDispatcher) -> Self {
        Self { config, dispatcher }
    }
}
