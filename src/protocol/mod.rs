pub mod command;
pub mod frame;

pub use command::{ServerCommand, ZoomContext};
pub use frame::{DataUrlDecoder, DecodedImage, FrameExtractor, ImageDecoder, InboundEvent};

use serde::Deserialize;

/// Protocol version this client speaks. The server must match exactly.
pub const PROTOCOL_VERSION: &str = "0.1";

/// Identification block the server sends first, as a JSON trailer on the
/// `coolserver` line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "Hash", default)]
    pub hash: String,
    #[serde(rename = "Protocol", default)]
    pub protocol: String,
    #[serde(rename = "Options", default)]
    pub options: String,
    #[serde(rename = "TimeZone", default)]
    pub timezone: String,
}

impl ServerInfo {
    /// Parse the JSON trailer of a `coolserver ...` line.
    pub fn from_line(line: &str) -> Option<Self> {
        let json = &line[line.find('{')?..];
        serde_json::from_str(json).ok()
    }
}

/// Extract the JSON trailer of a token-plus-JSON line (`progress:`,
/// `commandresult:`, `wopi:`, ...).
pub fn json_trailer(line: &str) -> Option<serde_json::Value> {
    let json = &line[line.find('{')?..];
    serde_json::from_str(json).ok()
}
