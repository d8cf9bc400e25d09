//! Active recognition language codes

use std::sync::{Arc, RwLock};
use tracing::warn;

/// Most language codes a recognition stream accepts at once
pub const MAX_LANGUAGE_CODES: usize = 6;

/// Normalize a requested language list.
///
/// Blank entries are dropped, an empty list falls back to `default_code`,
/// and lists longer than [`MAX_LANGUAGE_CODES`] are truncated.
pub fn normalize_language_codes(codes: &[String], default_code: &str) -> Vec<String> {
    let mut normalized: Vec<String> = codes
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();

    if normalized.is_empty() {
        return vec![default_code.to_string()];
    }

    if normalized.len() > MAX_LANGUAGE_CODES {
        warn!(
            "Truncating language list from {} to {} codes",
            normalized.len(),
            MAX_LANGUAGE_CODES
        );
        normalized.truncate(MAX_LANGUAGE_CODES);
    }

    normalized
}

/// Process-wide language list, mutable at runtime
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    default_code: String,
    codes: Arc<RwLock<Vec<String>>>,
}

impl LanguageRegistry {
    pub fn new(default_code: impl Into<String>, codes: &[String]) -> Self {
        let default_code = default_code.into();
        let codes = normalize_language_codes(codes, &default_code);
        Self {
            default_code,
            codes: Arc::new(RwLock::new(codes)),
        }
    }

    pub fn default_code(&self) -> &str {
        &self.default_code
    }

    pub fn current(&self) -> Vec<String> {
        match self.codes.read() {
            Ok(codes) => codes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the list, returning the normalized value that was stored
    pub fn replace(&self, codes: &[String]) -> Vec<String> {
        let normalized = normalize_language_codes(codes, &self.default_code);
        match self.codes.write() {
            Ok(mut guard) => *guard = normalized.clone(),
            Err(poisoned) => *poisoned.into_inner() = normalized.clone(),
        }
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_list_falls_back_to_default() {
        assert_eq!(normalize_language_codes(&[], "en-US"), codes(&["en-US"]));
        assert_eq!(
            normalize_language_codes(&codes(&["  ", ""]), "en-US"),
            codes(&["en-US"])
        );
    }

    #[test]
    fn test_long_list_is_truncated() {
        let requested = codes(&["en-US", "es-ES", "fr-FR", "de-DE", "it-IT", "pt-BR", "ja-JP"]);
        let normalized = normalize_language_codes(&requested, "en-US");
        assert_eq!(normalized.len(), MAX_LANGUAGE_CODES);
        assert_eq!(normalized.last().map(String::as_str), Some("pt-BR"));
    }

    #[test]
    fn test_registry_replace() {
        let registry = LanguageRegistry::new("en-US", &[]);
        assert_eq!(registry.current(), codes(&["en-US"]));

        let stored = registry.replace(&codes(&["es-ES", "en-US"]));
        assert_eq!(stored, codes(&["es-ES", "en-US"]));
        assert_eq!(registry.current(), stored);

        let clone = registry.clone();
        clone.replace(&[]);
        assert_eq!(registry.current(), codes(&["en-US"]));
    }
}
