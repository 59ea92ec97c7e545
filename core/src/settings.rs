use std::sync::Arc;

use crate::client::PostgresClient;

/// How staged rows reach the staging table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadStrategy {
    /// Binary COPY above the copy threshold, multi-row VALUES below it.
    #[default]
    Auto,
    BinaryCopy,
    Values,
}

/// How the staging table is named.
#[derive(Debug, Clone, Default)]
pub enum TempTableNaming {
    /// `stage_<table>_<random token>`; collision-free across concurrent
    /// operations against the same base table.
    #[default]
    UniqueToken,
    Exact(String),
}

/// Per-call configuration for the staged bulk operations. Constructed per
/// call, never shared ambient state.
#[derive(Clone, Default)]
pub struct BulkSettings {
    /// Chunk size for VALUES loads and for the row-by-row fallback.
    pub batch_size: Option<usize>,
    /// When true, a staging-unsupported connection fails the call instead
    /// of degrading to row-by-row statements.
    pub disable_default_fallback: bool,
    pub load_strategy: LoadStrategy,
    pub naming: TempTableNaming,
    /// Overrides the operation's client, for callers whose primary handle
    /// is wrapped in something the engine cannot use directly.
    pub connection: Option<Arc<PostgresClient>>,
}

impl BulkSettings {
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }
}

/// Per-call configuration for the filtered delete path.
#[derive(Clone, Default)]
pub struct DeleteSettings {
    pub connection: Option<Arc<PostgresClient>>,
}

/// Per-call configuration for the filtered single-column update path.
#[derive(Clone, Default)]
pub struct UpdateSettings {
    pub connection: Option<Arc<PostgresClient>>,
}

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Row count above which `LoadStrategy::Auto` switches from VALUES to COPY.
pub const COPY_THRESHOLD: usize = 100;
