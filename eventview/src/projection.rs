use eventview_types::TableCheck;

use crate::reducer::AggregateReducer;

/// A named read model maintained from the event log.
///
/// The name identifies the projection's checkpoints and lock, and is also
/// the name of its base table. Suffix tables are named `<name>_<suffix>`.
pub trait Projection: Send + Sync {
    /// Unique projection name.
    fn name(&self) -> &str;

    /// Tables to create before the first batch.
    ///
    /// `None` for projections writing to tables managed elsewhere.
    fn init(&self) -> Option<TableCheck> {
        None
    }

    /// Reducers per aggregate type.
    fn reducers(&self) -> Vec<AggregateReducer>;
}
