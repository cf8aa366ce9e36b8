//! Splits one inbound transport payload into a text command line and, for a
//! small set of prefixes, a trailing binary/image payload.

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::transport::SocketPayload;

/// PNG signature byte the tile cache strips before transmission.
const PNG_MAGIC: u8 = 0x89;

/// Line prefixes whose binary payload is an image.
const IMAGE_PREFIXES: [&str; 4] = ["tile:", "delta:", "renderfont:", "windowpaint:"];

pub fn carries_image_payload(text_msg: &str) -> bool {
    IMAGE_PREFIXES.iter().any(|p| text_msg.starts_with(p))
}

/// A resolved image payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedImage {
    /// Incremental tile diff (or raw keyframe) passed through undecoded.
    RawDelta { data: Bytes, is_keyframe: bool },
    /// PNG rendered to a base64 data URL usable as a plain `src` string.
    Png { src: String },
}

#[derive(Debug)]
enum ImageState {
    Pending,
    Complete(DecodedImage),
}

/// Shared completion slot for an asynchronously decoded image. The decode
/// task fills it and wakes the slurp flush; the event itself is never
/// otherwise mutated after creation.
#[derive(Debug, Clone)]
pub struct ImageSlot {
    state: Arc<Mutex<ImageState>>,
}

impl ImageSlot {
    fn pending() -> Self {
        Self {
            state: Arc::new(Mutex::new(ImageState::Pending)),
        }
    }

    fn complete(image: DecodedImage) -> Self {
        Self {
            state: Arc::new(Mutex::new(ImageState::Complete(image))),
        }
    }

    fn fill(&self, image: DecodedImage) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = ImageState::Complete(image);
    }

    fn is_complete(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*state, ImageState::Complete(_))
    }

    fn image(&self) -> Option<DecodedImage> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            ImageState::Complete(image) => Some(image.clone()),
            ImageState::Pending => None,
        }
    }
}

/// One inbound frame after extraction.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub text_msg: String,
    pub img_bytes: Option<Bytes>,
    /// Byte offset of the payload after the first newline.
    pub img_index: usize,
    image: Option<ImageSlot>,
}

impl InboundEvent {
    pub fn text(text_msg: impl Into<String>) -> Self {
        Self {
            text_msg: text_msg.into(),
            img_bytes: None,
            img_index: 0,
            image: None,
        }
    }

    /// True for all non-image events, and for image events once decode has
    /// finished (success or error).
    pub fn is_complete(&self) -> bool {
        match &self.image {
            Some(slot) => slot.is_complete(),
            None => true,
        }
    }

    pub fn image(&self) -> Option<DecodedImage> {
        self.image.as_ref().and_then(ImageSlot::image)
    }

    #[cfg(test)]
    pub(crate) fn with_pending_image(text_msg: impl Into<String>) -> (Self, ImageSlot) {
        let slot = ImageSlot::pending();
        let event = Self {
            text_msg: text_msg.into(),
            img_bytes: None,
            img_index: 0,
            image: Some(slot.clone()),
        };
        (event, slot)
    }

    #[cfg(test)]
    pub(crate) fn complete_for_test(slot: &ImageSlot) {
        slot.fill(DecodedImage::Png {
            src: "data:image/png;base64,".to_string(),
        });
    }
}

/// Validates a lazily decoded image, the way the browser's `Image` element
/// does before a dialog bitmap may be painted.
#[async_trait]
pub trait ImageDecoder: Send + Sync {
    async fn decode(&self, src: &str) -> Result<()>;
}

/// Default decoder: the data URL was produced by us, accept it as-is.
pub struct DataUrlDecoder;

#[async_trait]
impl ImageDecoder for DataUrlDecoder {
    async fn decode(&self, _src: &str) -> Result<()> {
        Ok(())
    }
}

/// Turns transport payloads into `InboundEvent`s, spawning decode tasks for
/// the lazily decoded dialog bitmaps.
pub struct FrameExtractor {
    decoder: Arc<dyn ImageDecoder>,
    wake_tx: mpsc::UnboundedSender<()>,
}

impl FrameExtractor {
    /// `wake_tx` re-arms the slurp flush whenever an async image resolves,
    /// so a stalled batch can resume.
    pub fn new(decoder: Arc<dyn ImageDecoder>, wake_tx: mpsc::UnboundedSender<()>) -> Self {
        Self { decoder, wake_tx }
    }

    pub fn extract(&self, payload: SocketPayload) -> InboundEvent {
        let mut event = match payload {
            SocketPayload::Text(text) => InboundEvent::text(text),
            SocketPayload::Binary(bytes) => extract_binary(bytes),
        };
        self.resolve_image(&mut event);
        event
    }

    fn resolve_image(&self, event: &mut InboundEvent) {
        let is_tile = event.text_msg.starts_with("tile:");
        let is_delta = event.text_msg.starts_with("delta:");
        if !carries_image_payload(&event.text_msg) {
            return;
        }
        // A `nopng` suffix means no payload follows.
        if event.text_msg.contains(" nopng") {
            return;
        }
        let Some(img_bytes) = event.img_bytes.as_ref() else {
            return;
        };
        if event.img_index >= img_bytes.len() {
            return;
        }
        let data = img_bytes.slice(event.img_index..);

        // Fast path: incremental tile diffs skip image decoding entirely.
        if (is_tile || is_delta) && data[0] != b'P' {
            event.image = Some(ImageSlot::complete(DecodedImage::RawDelta {
                data,
                is_keyframe: is_tile,
            }));
            return;
        }

        let src = png_data_url(&data);

        // Tile PNGs are used as a plain `src` string, complete immediately.
        if is_tile {
            event.image = Some(ImageSlot::complete(DecodedImage::Png { src }));
            return;
        }

        // renderfont:/windowpaint: dialog bitmaps decode asynchronously.
        let slot = ImageSlot::pending();
        event.image = Some(slot.clone());
        let decoder = self.decoder.clone();
        let wake_tx = self.wake_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = decoder.decode(&src).await {
                tracing::warn!(target = "driftwood::protocol", error = %e, "image decode failed");
            }
            // Complete on success or error; a broken image must not stall
            // the rest of the batch forever.
            slot.fill(DecodedImage::Png { src });
            let _ = wake_tx.send(());
        });
    }
}

fn extract_binary(bytes: Bytes) -> InboundEvent {
    // Search for the first newline which marks the end of the command line.
    let newline = bytes.iter().position(|&b| b == 10).unwrap_or(bytes.len());
    let text_msg: String = bytes[..newline].iter().map(|&b| b as char).collect();
    let img_index = (newline + 1).min(bytes.len());

    if carries_image_payload(&text_msg) {
        InboundEvent {
            text_msg,
            img_bytes: Some(bytes),
            img_index,
            image: None,
        }
    } else {
        // Not an image frame: the whole payload is the (UTF-8) message.
        InboundEvent {
            text_msg: String::from_utf8_lossy(&bytes).into_owned(),
            img_bytes: None,
            img_index: 0,
            image: None,
        }
    }
}

fn png_data_url(data: &[u8]) -> String {
    // Re-prepend the PNG signature byte the tile cache stripped.
    let mut encoded = String::from("data:image/png;base64,");
    if data.first() == Some(&PNG_MAGIC) {
        encoded.push_str(&BASE64.encode(data));
    } else {
        let mut full = Vec::with_capacity(data.len() + 1);
        full.push(PNG_MAGIC);
        full.extend_from_slice(data);
        encoded.push_str(&BASE64.encode(&full));
    }
    encoded
}
