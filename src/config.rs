//! Mount-time configuration (SPEC_FULL.md's ambient Configuration section).
//!
//! The core format itself has no configurable layout — block size, inode
//! size, and directory record size are all fixed (spec §6) — but the
//! reservation allocator's tunables and the read-only flag are legitimate
//! per-mount knobs a host passes in, so they get an ordinary
//! `serde::Deserialize`-able struct rather than compile-time constants.

use crate::{DEFAULT_WINDOW, MAX_WINDOW};
use serde::Deserialize;

/// Per-mount tunables (spec §4.4, §9).
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Starting size of a newly placed reservation window, in blocks.
    pub default_window_blocks: u32,
    /// Ceiling a window's goal size may grow to by doubling.
    pub max_window_blocks: u32,
    /// Rejects any operation that would modify the filesystem.
    pub read_only: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            default_window_blocks: DEFAULT_WINDOW,
            max_window_blocks: MAX_WINDOW,
            read_only: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_compiled_in_constants() {
        let opts = MountOptions::default();
        assert_eq!(opts.default_window_blocks, DEFAULT_WINDOW);
        assert_eq!(opts.max_window_blocks, MAX_WINDOW);
        assert!(!opts.read_only);
    }

    #[test]
    fn deserializes_partial_overrides_from_json() {
        let opts: MountOptions = serde_json::from_str(r#"{"read_only": true}"#).unwrap();
        assert!(opts.read_only);
        assert_eq!(opts.default_window_blocks, DEFAULT_WINDOW);
    }
}
