pub mod sales_data;

use std::path::PathBuf;
use std::sync::Arc;

use insights_core::planner::QueryPlanner;

use crate::registry::ToolRegistry;

/// Registry with the sales data tool backed by `planner` and the SQLite
/// database at `db_path`.
pub fn create_default_registry(planner: Arc<dyn QueryPlanner>, db_path: PathBuf) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(sales_data::SalesDataTool::new(planner, db_path)));
    registry
}
