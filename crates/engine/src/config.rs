//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables for a table/solver instance. Hosts usually take the defaults;
/// tests shrink them to exercise edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Initial ever-ensured rows for new sheets.
    pub default_rows: u32,
    /// Initial ever-ensured columns for new sheets.
    pub default_cols: u32,
    /// Maximum formula recursion depth before evaluation gives up with a
    /// reference error. Cycles are caught by the visited set; this bounds
    /// legitimately deep dependency chains.
    pub max_eval_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_rows: 1000,
            default_cols: 100,
            max_eval_depth: 256,
        }
    }
}
