//! Wire formats spoken by the bridge.
//!
//! - **codec**: Content-Length framing (front-end), NUL delimiting (target) and
//!   UTF-8 text decoding of debuggee output
//! - **protocol**: Request / Response / Event envelopes

pub mod codec;
pub mod protocol;
