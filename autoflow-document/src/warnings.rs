//! ABOUTME: Non-fatal parse warnings — unknown top-level keys, deprecated aliases

use std::fmt;

/// A non-fatal finding produced alongside a successfully parsed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    UnknownKey { key: String },
    DeprecatedAlias { alias: String, replacement: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey { key } => write!(f, "unknown top-level key '{key}'"),
            Self::DeprecatedAlias { alias, replacement } => {
                write!(f, "'{alias}' is deprecated, use '{replacement}' instead")
            }
        }
    }
}
