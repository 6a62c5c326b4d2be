use serde::Serialize;
use std::fmt;
use std::panic::Location;

/// Source location of a declaration. Only used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Frame {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl Frame {
    /// Capture the location of the caller. Builders are `#[track_caller]`, so
    /// this resolves to the user's declaration site.
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }

    pub const fn unknown() -> Self {
        Self {
            file: "<unknown>",
            line: 0,
            column: 0,
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
