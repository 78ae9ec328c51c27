//! Version identity recorded to the log and to NVRAM.

/// Semantic `X.Y.Z` version, each component a single digit.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build target tag: `REL`, `DBG` or `NPT`.
pub const TARGET: &str = env!("CHRYSALIS_TARGET");

/// Human readable `<TARGET>-<XYZ>-<YYYY-MM-DD>` string, 7-bit ASCII.
pub const VERSION_STRING: &str = env!("CHRYSALIS_VERSION_STRING");

/// How the running image was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTarget {
    /// Optimized release
    Release,
    /// Debug with compiler optimizations
    Debug,
    /// Debug without compiler optimizations
    NoOpt,
}

impl BuildTarget {
    /// Target of the running image.
    pub fn current() -> Self {
        match TARGET {
            "REL" => BuildTarget::Release,
            "NPT" => BuildTarget::NoOpt,
            _ => BuildTarget::Debug,
        }
    }

    /// Three-letter tag.
    pub const fn tag(self) -> &'static str {
        match self {
            BuildTarget::Release => "REL",
            BuildTarget::Debug => "DBG",
            BuildTarget::NoOpt => "NPT",
        }
    }
}
