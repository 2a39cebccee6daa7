use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{info, warn};
use object::Architecture;

use crate::dwarf::DebugInfo;
use crate::macho::{format_uuid, resolve_dsym_path, MachO, TEXT_SEGMENT};
use crate::symbolizer::{resolve, ResolvedSymbol};
use crate::types::{FileAddr, VirtAddr};

/// A crashed binary together with the dSYM describing it.
pub struct Target {
    pub binary: PathBuf,
    pub dsym: PathBuf,
    pub segment: String,
}

/// What the driver keeps from the binary once it has been closed.
struct BinaryInfo {
    segment_base: FileAddr,
    uuid: Option<[u8; 16]>,
    arch: Architecture,
}

impl Target {
    pub fn new(binary: impl Into<PathBuf>, dsym: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            dsym: dsym.into(),
            segment: TEXT_SEGMENT.to_string(),
        }
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = segment.into();
        self
    }

    fn binary_info(&self) -> Result<BinaryInfo> {
        let macho = MachO::open(&self.binary).context("Can't open Mach-O file")?;
        let segment_base = macho.segment_base_address(&self.segment)?;
        info!(
            "{} {} segment at {:#x}",
            self.binary.display(),
            self.segment,
            segment_base
        );
        Ok(BinaryInfo {
            segment_base,
            uuid: macho.uuid(),
            arch: macho.architecture(),
        })
    }

    /// Resolves a crash address to the function(s) containing it.
    pub fn symbolicate(&self, runtime: VirtAddr, load: VirtAddr) -> Result<Vec<ResolvedSymbol>> {
        let binary = self.binary_info()?;
        let target = runtime.to_file_addr(load, binary.segment_base);
        info!("runtime {runtime:#x} (load {load:#x}) -> file address {target:#x}");

        let dsym_path = resolve_dsym_path(&self.dsym)?;
        let dsym = MachO::open(&dsym_path).context("Can't open .dSYM file")?;
        check_pairing(&binary, &dsym);

        let dwarf = DebugInfo::load(&dsym)?;
        let mut entries = dwarf.entries();
        Ok(resolve(&mut entries, target))
    }
}

/// Warns when the dSYM does not belong to the binary. The lookup still runs.
fn check_pairing(binary: &BinaryInfo, dsym: &MachO) {
    if let (Some(expected), Some(actual)) = (binary.uuid, dsym.uuid()) {
        if expected != actual {
            warn!(
                "UUID mismatch: binary {} vs dSYM {}",
                format_uuid(&expected),
                format_uuid(&actual)
            );
        }
    }
    if binary.arch != dsym.architecture() {
        warn!(
            "architecture mismatch: binary {:?} vs dSYM {:?}",
            binary.arch,
            dsym.architecture()
        );
    }
}
