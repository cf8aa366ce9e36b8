use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use url::form_urlencoded;

/// Connection parameters for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Server base, e.g. `ws://localhost:9980` or `wss://host`.
    pub server: String,
    /// Document URL as the storage layer knows it.
    pub doc_url: String,
    /// Extra query parameters appended to the document URL
    /// (access tokens and the like).
    pub doc_params: Vec<(String, String)>,
}

impl WebSocketConfig {
    pub fn new(server: impl Into<String>, doc_url: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            doc_url: doc_url.into(),
            doc_params: Vec::new(),
        }
    }

    /// Full websocket URL: `<server>/cool/<encoded doc?params>/ws`.
    pub fn build_url(&self) -> String {
        let mut doc = self.doc_url.clone();
        if !self.doc_params.is_empty() {
            let query: String = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.doc_params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
            doc.push('?');
            doc.push_str(&query);
        }
        let encoded: String = utf8_percent_encode(&doc, NON_ALPHANUMERIC).collect();
        format!("{}/cool/{}/ws", self.server.trim_end_matches('/'), encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_url_with_encoded_document() {
        let config = WebSocketConfig::new("ws://localhost:9980", "https://wopi/files/1");
        let url = config.build_url();
        assert!(url.starts_with("ws://localhost:9980/cool/"));
        assert!(url.ends_with("/ws"));
        let segment = &url["ws://localhost:9980/cool/".len()..url.len() - "/ws".len()];
        assert!(!segment.contains('/'), "doc url must be escaped: {url}");
        assert_eq!(segment, "https%3A%2F%2Fwopi%2Ffiles%2F1");
    }

    #[test]
    fn appends_doc_params() {
        let mut config = WebSocketConfig::new("wss://host", "doc.odt");
        config.doc_params.push(("access_token".into(), "abc123".into()));
        let url = config.build_url();
        assert!(url.contains("access%5Ftoken%3Dabc123") || url.contains("access_token%3Dabc123"));
    }
}
