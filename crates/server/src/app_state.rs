use std::sync::Arc;

use realtime::ChatHub;
use server_api::ApiContext;

use crate::config::TransportSettings;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) hub: Arc<ChatHub>,
    pub(crate) transport: TransportSettings,
}
