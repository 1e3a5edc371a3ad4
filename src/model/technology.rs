//! Technology labelling for certificate metadata.

use serde::{Deserialize, Serialize};

/// Maps a `(technology_code, fuel_code)` pair to a display label,
/// e.g. ("T010000", "F01010100") -> "Wind".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Technology {
    pub technology_code: String,
    pub fuel_code: String,
    pub label: String,
}
