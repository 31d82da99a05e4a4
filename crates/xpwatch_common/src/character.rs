//! Remote API payload for a single character lookup.

use serde::{Deserialize, Serialize};

/// Body of `GET <api_base>/<id>`.
///
/// The remote API returns more fields than these; everything else is ignored.
/// A body without `experience` does not deserialize and is treated as absent
/// by the fetch client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterInfo {
    /// Display name, may be empty for freshly rolled characters.
    #[serde(default)]
    pub name: String,
    /// Character level.
    #[serde(default)]
    pub level: u32,
    /// Total experience. Decreases are observed in the wild (death penalties),
    /// so this is signed.
    pub experience: i64,
}
