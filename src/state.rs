//! `AppState`: everything a handler, the pipeline, or the WS connection
//! manager needs a reference to. Cheap to clone — every field is already an
//! `Arc` (or wraps one), matching the teacher's "`AppState` is cheap to
//! clone per request" convention (see `state.rs`'s original doc comment).

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::fd::FdAllocator;
use crate::profile::ProfileLoader;
use crate::router::GatewayRouter;
use crate::tables::SharedTables;
use crate::task_pool::TaskPool;
use crate::websocket::ConnectionManager;

#[derive(Clone)]
pub struct AppState {
    /// Re-read on `SIGHUP`/`SIGUSR1` without recreating the listener or the
    /// Shared Tables (spec §5, §9 "Config hot-reload").
    pub config: Arc<RwLock<Config>>,
    pub tables: Arc<SharedTables>,
    pub router: Arc<GatewayRouter>,
    pub profiles: Arc<dyn ProfileLoader>,
    pub connections: ConnectionManager,
    pub task_pool: Arc<TaskPool>,
    pub fds: Arc<FdAllocator>,
}
