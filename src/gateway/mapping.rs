//! Generic → provider-specific name mapping for voices and models.

use std::collections::HashMap;

/// Two-level mapping `generic name → provider → provider-specific name`.
///
/// Unmapped names pass through unchanged, so callers can always send the
/// result upstream.
#[derive(Debug, Clone, Default)]
pub struct NameMapper {
    mappings: HashMap<String, HashMap<String, String>>,
}

impl NameMapper {
    pub fn new(mappings: HashMap<String, HashMap<String, String>>) -> Self {
        Self { mappings }
    }

    /// Resolve `name` for `provider`, falling back to `name` itself.
    pub fn map<'a>(&'a self, name: &'a str, provider: &str) -> &'a str {
        self.mappings
            .get(name)
            .and_then(|by_provider| by_provider.get(provider))
            .map_or(name, String::as_str)
    }
}
