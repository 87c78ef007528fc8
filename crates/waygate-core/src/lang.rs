//! Guest language selection.

use serde::{Deserialize, Serialize};

/// The language a capsule's entry code is written in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// JavaScript (always available).
    #[default]
    Js,
    /// Python (configurable; no runtime is linked in this build).
    Py,
}

impl Language {
    /// Stable string form used in manifests and tool names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Js => "js",
            Self::Py => "py",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
