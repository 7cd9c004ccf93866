use std::sync::Arc;

use axum::Router;

use crate::auth::AuthManager;
use crate::config::Config;
use crate::service::WebRtcRecorder;

pub mod recorder;

#[derive(Clone)]
pub struct AppState {
    pub recorder: Arc<WebRtcRecorder>,
    pub auth: Arc<AuthManager>,
    pub config: Config,
}

pub fn app(state: AppState) -> Router {
    recorder::route().with_state(state)
}
