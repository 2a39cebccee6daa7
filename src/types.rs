use std::fmt;
use std::num::ParseIntError;

/// An address as observed in the crashed process (program counter, image
/// load address).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub u64);

/// A link-time address, as recorded in the binary's segments and in DWARF.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileAddr(pub u64);

impl VirtAddr {
    /// Maps a runtime address back to the address the linker assigned it.
    ///
    /// The slide between `self` and `load` is applied on top of the segment
    /// base. Both steps wrap: a runtime address below the load address gives a
    /// nonsensical target that simply matches nothing.
    pub fn to_file_addr(self, load: VirtAddr, segment_base: FileAddr) -> FileAddr {
        FileAddr(translate(self.0, load.0, segment_base.0))
    }
}

impl FileAddr {
    pub fn addr(self) -> u64 {
        self.0
    }
}

/// `segment_base + (runtime - load)` in modular 64-bit arithmetic.
pub fn translate(runtime: u64, load: u64, segment_base: u64) -> u64 {
    let slide = runtime.wrapping_sub(load);
    segment_base.wrapping_add(slide)
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::LowerHex for FileAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Parses an integer the way crash-report tooling writes them: `0x` prefix
/// for hex, a leading `0` for octal, decimal otherwise.
pub fn parse_address(text: &str) -> Result<u64, ParseIntError> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        u64::from_str_radix(&text[1..], 8)
    } else {
        text.parse::<u64>()
    }
}
