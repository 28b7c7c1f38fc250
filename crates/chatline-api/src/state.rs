use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use chatline_db::Store;
use chatline_delivery::{
    BrokerNotifier, CacheConfig, MessageStore, Pipeline, PipelineConfig, PipelineDeps, Reconciler, ReconcilerConfig,
    RoomCache,
};
use chatline_gateway::membership::GateConfig;
use chatline_gateway::{Bridge, Broker, Gate, Hub};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub node_id: String,
    pub store: Store,
    pub hub: Hub,
    pub gate: Gate,
    pub bridge: Bridge,
    pub cache: Arc<RoomCache>,
    pub pipeline: Pipeline,
    pub reconciler: Reconciler,
    /// Bearer token for admin routes. None locks them entirely.
    pub admin_token: Option<String>,
    /// History frames sent on connect.
    pub history_limit: usize,
    /// Cancelled on shutdown; background work started by handlers watches it.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub node_id: String,
    pub admin_token: Option<String>,
    /// Outbound frames buffered per socket before it counts as stalled.
    pub socket_queue: usize,
    pub history_limit: usize,
    pub cache: CacheConfig,
    pub gate: GateConfig,
    pub pipeline: PipelineConfig,
    pub reconciler: ReconcilerConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            admin_token: None,
            socket_queue: 256,
            history_limit: 50,
            cache: CacheConfig::default(),
            gate: GateConfig::default(),
            pipeline: PipelineConfig::default(),
            reconciler: ReconcilerConfig::default(),
        }
    }
}

impl AppStateInner {
    /// Wires every component around one store and one broker. Spawns the
    /// pipeline workers, so it must run inside a tokio runtime.
    pub fn compose(store: Store, broker: Arc<dyn Broker>, config: CoreConfig) -> AppState {
        let hub = Hub::new(config.socket_queue);
        let gate = Gate::new(Arc::new(store.clone()), config.gate);
        let bridge = Bridge::new(config.node_id.clone(), broker.clone(), hub.clone(), gate.clone());
        let cache = Arc::new(RoomCache::new(config.cache));
        let messages: Arc<dyn MessageStore> = Arc::new(store.clone());

        let pipeline = Pipeline::start(
            PipelineDeps {
                store: store.clone(),
                messages,
                cache: cache.clone(),
                notifier: Arc::new(BrokerNotifier::new(broker)),
                gate: gate.clone(),
                bridge: bridge.clone(),
            },
            config.pipeline,
        );
        let reconciler = Reconciler::new(store.clone(), pipeline.clone(), config.reconciler);

        Arc::new(AppStateInner {
            node_id: config.node_id,
            store,
            hub,
            gate,
            bridge,
            cache,
            pipeline,
            reconciler,
            admin_token: config.admin_token.filter(|t| !t.is_empty()),
            history_limit: config.history_limit,
            shutdown: CancellationToken::new(),
        })
    }
}
