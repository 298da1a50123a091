//! Relay frame type
//!
//! A [`Frame`] is one WebSocket data message as it travels through the relay.
//! The payload is a `Bytes` handle, so broadcasting a frame to many consumers
//! only bumps a reference count.

use std::borrow::Cow;

use bytes::Bytes;

/// Maximum number of characters of a payload shown in log lines
pub const PREVIEW_CHARS: usize = 200;

/// A single text or binary message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text message (the normal OneBot case)
    Text(Bytes),
    /// Binary message, relayed untouched
    Binary(Bytes),
}

impl Frame {
    /// Create a text frame
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(Bytes::from(text.into()))
    }

    /// Create a binary frame
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Frame::Binary(data.into())
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Text(data) | Frame::Binary(data) => data,
        }
    }

    /// Payload as text, if this is a valid UTF-8 text frame
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(data) => std::str::from_utf8(data).ok(),
            Frame::Binary(_) => None,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload().len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }
}

/// Shortened, lossy rendering of a frame for log lines
pub fn preview(frame: &Frame) -> Cow<'_, str> {
    let text = String::from_utf8_lossy(frame.payload());
    if text.chars().count() <= PREVIEW_CHARS {
        return text;
    }

    let mut short: String = text.chars().take(PREVIEW_CHARS).collect();
    short.push_str("...");
    Cow::Owned(short)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_frame() {
        let frame = Frame::text("{\"a\":1}");

        assert_eq!(frame.as_text(), Some("{\"a\":1}"));
        assert_eq!(frame.len(), 7);
        assert!(!frame.is_empty());
    }

    #[test]
    fn test_binary_frame_has_no_text() {
        let frame = Frame::binary(Bytes::from_static(b"abc"));

        assert_eq!(frame.as_text(), None);
        assert_eq!(frame.payload(), b"abc");
    }

    #[test]
    fn test_preview_short_payload_unchanged() {
        let frame = Frame::text("hello");
        assert_eq!(preview(&frame), "hello");
    }

    #[test]
    fn test_preview_truncates_long_payload() {
        let frame = Frame::text("x".repeat(500));
        let shown = preview(&frame);

        assert_eq!(shown.chars().count(), PREVIEW_CHARS + 3);
        assert!(shown.ends_with("..."));
    }

    #[test]
    fn test_preview_counts_chars_not_bytes() {
        // 300 three-byte characters
        let frame = Frame::text("群".repeat(300));
        let shown = preview(&frame);

        assert!(shown.starts_with("群"));
        assert_eq!(shown.chars().count(), PREVIEW_CHARS + 3);
    }
}
