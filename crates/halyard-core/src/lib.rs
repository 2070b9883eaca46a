pub mod client_caps;
pub mod dispatch;
pub mod error;
pub mod intents;
pub mod member_list;
pub mod permissions;
pub mod registry;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use halyard_data::DataLayer;
use halyard_models::intents::Intents;

use crate::dispatch::Dispatcher;
use crate::registry::SessionRegistry;

/// Heartbeat interval advertised in the HELLO frame.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(45_000);
/// Slack granted past the heartbeat interval before a connection is
/// force-closed; interval + grace is the 65s absolute deadline.
pub const HEARTBEAT_GRACE: Duration = Duration::from_millis(20_000);
/// Window after a socket drop during which a resume can still reattach.
pub const RESUME_GRACE: Duration = Duration::from_secs(10);
/// Per-session replay ring capacity; oldest entries drop first.
pub const REPLAY_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_grace: Duration,
    pub resume_grace: Duration,
    pub replay_capacity: usize,
    /// Robustness fallback: skip incremental member-list diffing and emit
    /// full-range SYNC operations for every subscribed range instead.
    pub sync_only_member_lists: bool,
    pub default_user_intents: Intents,
    pub default_bot_intents: Intents,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_grace: HEARTBEAT_GRACE,
            resume_grace: RESUME_GRACE,
            replay_capacity: REPLAY_CAPACITY,
            sync_only_member_lists: false,
            default_user_intents: Intents::default_for_user(),
            default_bot_intents: Intents::default_for_bot(),
        }
    }
}

impl GatewayConfig {
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval + self.heartbeat_grace
    }
}

#[derive(Clone)]
pub struct AppState {
    pub data: Arc<dyn DataLayer>,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(data: Arc<dyn DataLayer>, config: GatewayConfig) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            data.clone(),
            config.clone(),
        ));
        Self {
            data,
            registry,
            dispatcher,
            config,
        }
    }
}
