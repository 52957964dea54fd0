//! Prometheus text exposition format.
//!
//! Thin pass-through over the prometheus crate's own encoder, so whatever
//! serves scrapes can return the registry contents unchanged.

use prometheus::{Encoder, Registry, TextEncoder};

/// Content type for the text exposition format.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// Render every metric in `registry` into the text exposition format.
pub fn render(registry: &Registry) -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&registry.gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
