//! Offline crash symbolication for Mach-O binaries: maps a runtime address
//! from a crash report to the function and declaration line that contain it,
//! using the DWARF information in the matching dSYM.

pub mod dwarf;
pub mod error;
pub mod macho;
pub mod symbolizer;
pub mod target;
pub mod types;
