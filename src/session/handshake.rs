//! First two frames of every connection: the client identification line and
//! the `load` command that binds the socket to a document.

use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::protocol::PROTOCOL_VERSION;

/// Percent-encoding set for the document URL inside the `load` line. The
/// characters `-_.!~*'()` travel unescaped, everything else non-alphanumeric
/// is escaped.
const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Epoch for the monotonic half of the timer pair sent in `coolclient`.
static PERF_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Static parameters of the `load` command. The dynamic ones (current part
/// on reconnect, a password obtained from the user) are passed per call.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub doc_url: String,
    pub timestamp: Option<String>,
    pub lang: Option<String>,
    pub device_form_factor: Option<String>,
    pub timezone: Option<String>,
    pub rendering_options: Option<serde_json::Value>,
    pub spell_online: Option<bool>,
}

/// The `coolclient` identification line: protocol version plus a paired
/// wall-clock / monotonic timestamp so the server can translate client
/// performance timings.
pub fn coolclient_line() -> String {
    let wall_before = unix_millis();
    let perf = PERF_EPOCH.elapsed().as_secs_f64() * 1_000.0;
    let wall_after = unix_millis();
    format!(
        "coolclient {} {} {}",
        PROTOCOL_VERSION,
        (wall_before + wall_after) / 2.0,
        perf
    )
}

fn unix_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1_000.0)
        .unwrap_or(0.0)
}

/// Build the `load` command. `reconnect_part` is `Some` only when a document
/// was already open on a previous connection, so the server restores the
/// same part. `password` is whatever the user last supplied, if anything.
pub fn load_command(
    opts: &LoadOptions,
    reconnect_part: Option<i64>,
    password: Option<&str>,
) -> String {
    let mut msg = format!(
        "load url={}",
        utf8_percent_encode(&opts.doc_url, URL_COMPONENT)
    );
    if let Some(part) = reconnect_part {
        msg.push_str(&format!(" part={part}"));
    }
    if let Some(timestamp) = &opts.timestamp {
        msg.push_str(&format!(" timestamp={timestamp}"));
    }
    if let Some(password) = password {
        msg.push_str(&format!(" password={password}"));
    }
    if let Some(lang) = &opts.lang {
        msg.push_str(&format!(" lang={lang}"));
    }
    if let Some(form_factor) = &opts.device_form_factor {
        msg.push_str(&format!(" deviceFormFactor={form_factor}"));
    }
    if let Some(timezone) = &opts.timezone {
        msg.push_str(&format!(" timezone={timezone}"));
    }
    if let Some(rendering) = &opts.rendering_options {
        let options = serde_json::json!({ "rendering": rendering });
        msg.push_str(&format!(" options={options}"));
    }
    if let Some(spell) = opts.spell_online {
        msg.push_str(&format!(" spellOnline={spell}"));
    }
    msg
}
