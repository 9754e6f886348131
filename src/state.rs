use std::sync::Arc;

use crate::broker::BrokerManager;
use crate::config::Config;
use crate::services::{DeliveryStore, MembershipResolver};
use crate::websocket::SessionRegistry;

/// Shared handles cloned into every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub broker: Arc<BrokerManager>,
    pub store: Arc<dyn DeliveryStore>,
    pub membership: Arc<dyn MembershipResolver>,
    pub config: Arc<Config>,
}
