use std::path::PathBuf;

use thiserror::Error;

/// Failures raised while opening a binary or its dSYM. All of them are fatal
/// and surface before any symbol lookup starts.
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Can't open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Can't parse {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: object::Error,
    },

    #[error("{} is a fat binary; lipo -thin it to a single architecture first", path.display())]
    FatBinary { path: PathBuf },

    #[error("Segment {segment} not found in {}", path.display())]
    SegmentNotFound { path: PathBuf, segment: String },

    #[error("Can't find DWARF info in {}", path.display())]
    NoDebugInfo { path: PathBuf },

    #[error("Malformed DWARF info in {}: {source}", path.display())]
    MalformedDebugInfo {
        path: PathBuf,
        #[source]
        source: StreamError,
    },

    #[error("Can't locate the DWARF file inside dSYM bundle {}", path.display())]
    BundleLayout { path: PathBuf },
}

/// Errors raised while walking debug information. They abandon the unit they
/// occur in, never the whole walk.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("malformed DWARF: {0}")]
    Dwarf(#[from] gimli::Error),

    #[error("reference {offset:#x} does not point into any unit")]
    DanglingReference { offset: usize },
}
