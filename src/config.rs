use std::env;
#[cfg(test)]
use std::sync::Mutex;

use crate::protocol::ZoomContext;
use crate::session::LoadOptions;

/// Engine configuration: where the document lives and how to present it.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub load: LoadOptions,
    pub zoom: ZoomContext,
    /// Access token expiry as unix epoch milliseconds, when the session
    /// carries a bounded-lifetime token.
    pub access_token_ttl_ms: Option<u64>,
}

impl EngineConfig {
    /// Configuration for a document, with language and form factor picked up
    /// from the environment.
    pub fn for_document(doc_url: impl Into<String>) -> Self {
        let lang = env::var("DRIFTWOOD_LANG").ok().filter(|v| !v.is_empty());
        let form_factor = env::var("DRIFTWOOD_FORM_FACTOR")
            .ok()
            .filter(|v| !v.is_empty());
        Self {
            load: LoadOptions {
                doc_url: doc_url.into(),
                lang,
                device_form_factor: form_factor,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            load: LoadOptions::default(),
            zoom: ZoomContext {
                tile_width_twips: 3840.0,
                default_zoom: 10,
            },
            access_token_ttl_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn default_geometry_matches_reference_tile_size() {
        let config = EngineConfig::default();
        assert_eq!(config.zoom.tile_width_twips, 3840.0);
        assert_eq!(config.zoom.default_zoom, 10);
        assert!(config.access_token_ttl_ms.is_none());
    }

    #[test]
    fn for_document_reads_lang_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let original = env::var("DRIFTWOOD_LANG").ok();
        env::set_var("DRIFTWOOD_LANG", "de-DE");
        let config = EngineConfig::for_document("https://example.com/doc.odt");
        assert_eq!(config.load.doc_url, "https://example.com/doc.odt");
        assert_eq!(config.load.lang.as_deref(), Some("de-DE"));

        if let Some(orig) = original {
            env::set_var("DRIFTWOOD_LANG", orig);
        } else {
            env::remove_var("DRIFTWOOD_LANG");
        }
    }
}
