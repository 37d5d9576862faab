//! Status codes and decode/encode options, mirroring the small, explicit
//! error taxonomy the teacher favors over a generic `anyhow::Error` on hot
//! paths — `anyhow` stays reserved for the outer, non-hot-path API in
//! `lib.rs`.

use std::fmt;

/// Outcome of a decode or encode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Malformed,
    OutOfMemory,
    MaxDepthExceeded,
    MissingRequired,
    BadUtf8,
    Unlinked,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Malformed => "malformed wire data",
            Status::OutOfMemory => "out of memory",
            Status::MaxDepthExceeded => "maximum nesting depth exceeded",
            Status::MissingRequired => "missing required field",
            Status::BadUtf8 => "invalid utf-8 in string field",
            Status::Unlinked => "mini-table has an unlinked sub-message or extension",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Status {}

bitflags::bitflags! {
    /// Options controlling [`crate::decoding::decode`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DecodeOptions: u32 {
        /// Allow string/bytes fields to alias the input buffer instead of
        /// copying into the arena, when the buffer outlives the message.
        const ALIAS_STRING = 1 << 0;
        /// Fail with `MissingRequired` if any `required` field was absent.
        const CHECK_REQUIRED = 1 << 1;
        /// Drop unrecognized fields instead of storing them verbatim.
        const DISCARD_UNKNOWN = 1 << 2;
        /// Validate UTF-8 on string fields even when the mini-table doesn't
        /// mark the field `MOD_VALIDATE_UTF8` (proto2 bytes-typed strings).
        const ALWAYS_VALIDATE_UTF8 = 1 << 3;
    }
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions::CHECK_REQUIRED
    }
}

bitflags::bitflags! {
    /// Options controlling [`crate::encoding::encode`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EncodeOptions: u32 {
        /// Fail with `MissingRequired` instead of silently emitting a
        /// partial message.
        const CHECK_REQUIRED = 1 << 0;
        /// Serialize message fields in descending field-number order
        /// (deterministic output, at a small cost).
        const DETERMINISTIC = 1 << 1;
    }
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions::empty()
    }
}

pub const DEFAULT_MAX_DEPTH: u32 = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_options_default_checks_required() {
        assert!(DecodeOptions::default().contains(DecodeOptions::CHECK_REQUIRED));
    }

    #[test]
    fn status_display_is_human_readable() {
        assert_eq!(Status::BadUtf8.to_string(), "invalid utf-8 in string field");
    }
}
