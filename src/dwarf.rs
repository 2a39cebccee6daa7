use std::ops::Range;

use gimli::{
    AttributeValue, DebugInfoOffset, DebuggingInformationEntry, DwTag, EndianSlice,
    EntriesCursor, LittleEndian, SectionId, Unit, UnitHeader, UnitOffset,
};
use log::{debug, trace};

use crate::error::{ContainerError, StreamError};
use crate::macho::MachO;

/// Reader over sections borrowed from the mapped dSYM.
pub type Slice<'data> = EndianSlice<'data, LittleEndian>;

/// Entry tags the symbolizer distinguishes; everything else is `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryTag {
    CompileUnit,
    Subprogram,
    Other(DwTag),
}

impl From<DwTag> for EntryTag {
    fn from(tag: DwTag) -> Self {
        match tag {
            gimli::DW_TAG_compile_unit => EntryTag::CompileUnit,
            gimli::DW_TAG_subprogram => EntryTag::Subprogram,
            other => EntryTag::Other(other),
        }
    }
}

/// Attributes retained on a `DebugEntry`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Attribute {
    Name,
    LowPc,
    HighPc,
    DeclLine,
    LinkageName,
    Specification,
    AbstractOrigin,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrValue {
    Address(u64),
    Constant(u64),
    String(String),
    /// Offset of the referenced entry in `.debug_info`.
    Reference(usize),
}

/// One entry of the debug-information tree, as handed out by an
/// [`EntryCursor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugEntry {
    pub offset: usize,
    pub tag: EntryTag,
    pub has_children: bool,
    pub attributes: Vec<(Attribute, AttrValue)>,
}

impl DebugEntry {
    pub fn new(tag: EntryTag) -> Self {
        Self {
            offset: 0,
            tag,
            has_children: false,
            attributes: Vec::new(),
        }
    }

    pub fn with_children(mut self, has_children: bool) -> Self {
        self.has_children = has_children;
        self
    }

    pub fn with_attr(mut self, attr: Attribute, value: AttrValue) -> Self {
        self.attributes.push((attr, value));
        self
    }

    pub fn attr(&self, attr: Attribute) -> Option<&AttrValue> {
        self.attributes
            .iter()
            .find(|(kind, _)| *kind == attr)
            .map(|(_, value)| value)
    }

    fn string_attr(&self, attr: Attribute) -> Option<&str> {
        match self.attr(attr)? {
            AttrValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.string_attr(Attribute::Name)
    }

    pub fn linkage_name(&self) -> Option<&str> {
        self.string_attr(Attribute::LinkageName)
    }

    pub fn low_pc(&self) -> Option<u64> {
        match self.attr(Attribute::LowPc)? {
            AttrValue::Address(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Exclusive upper bound. DWARF 4 and later may encode it as a length
    /// relative to `low_pc`.
    pub fn high_pc(&self) -> Option<u64> {
        match self.attr(Attribute::HighPc)? {
            AttrValue::Address(addr) => Some(*addr),
            AttrValue::Constant(len) => Some(self.low_pc()?.wrapping_add(*len)),
            _ => None,
        }
    }

    /// The half-open code range, or `None` when either bound is missing.
    pub fn pc_range(&self) -> Option<Range<u64>> {
        Some(self.low_pc()?..self.high_pc()?)
    }

    pub fn decl_line(&self) -> Option<u64> {
        match self.attr(Attribute::DeclLine)? {
            AttrValue::Constant(line) => Some(*line),
            _ => None,
        }
    }

    pub fn reference(&self, attr: Attribute) -> Option<usize> {
        match self.attr(attr)? {
            AttrValue::Reference(offset) => Some(*offset),
            _ => None,
        }
    }
}

/// One step of a depth-first, pre-order walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Entry(DebugEntry),
    /// Closes the current run of siblings.
    EndOfChildren,
}

/// Read-once cursor over a debug-information tree.
///
/// After an entry with children is returned, the caller must either read
/// those children (up to the matching [`Step::EndOfChildren`]) or call
/// [`EntryCursor::skip_children`] before moving on to the entry's siblings.
pub trait EntryCursor {
    /// Returns the next step, or `None` once the stream is exhausted.
    fn next_step(&mut self) -> Result<Option<Step>, StreamError>;

    /// Skips the children of the entry returned last. A no-op when that
    /// entry had none.
    fn skip_children(&mut self) -> Result<(), StreamError>;

    /// Random access to the entry at a `.debug_info` offset, used to follow
    /// references. Cursors without random access return `None`.
    fn entry_at(&self, _offset: usize) -> Result<Option<DebugEntry>, StreamError> {
        Ok(None)
    }
}

/// Raw DWARF section contents backing a [`DebugInfo`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DwarfSections<'data> {
    pub debug_info: &'data [u8],
    pub debug_abbrev: &'data [u8],
    pub debug_str: &'data [u8],
    pub debug_str_offsets: &'data [u8],
    pub debug_addr: &'data [u8],
    pub debug_line: &'data [u8],
    pub debug_line_str: &'data [u8],
    pub debug_ranges: &'data [u8],
    pub debug_rnglists: &'data [u8],
}

impl<'data> DwarfSections<'data> {
    fn get(&self, id: SectionId) -> &'data [u8] {
        match id {
            SectionId::DebugInfo => self.debug_info,
            SectionId::DebugAbbrev => self.debug_abbrev,
            SectionId::DebugStr => self.debug_str,
            SectionId::DebugStrOffsets => self.debug_str_offsets,
            SectionId::DebugAddr => self.debug_addr,
            SectionId::DebugLine => self.debug_line,
            SectionId::DebugLineStr => self.debug_line_str,
            SectionId::DebugRanges => self.debug_ranges,
            SectionId::DebugRngLists => self.debug_rnglists,
            _ => &[],
        }
    }
}

struct IndexedUnit<'data> {
    header: UnitHeader<Slice<'data>>,
    /// Abbreviations and root attributes; a unit that fails here is
    /// reported when the walk reaches it.
    unit: Result<Unit<Slice<'data>>, gimli::Error>,
}

pub struct DebugInfo<'data> {
    dwarf: gimli::Dwarf<Slice<'data>>,
    units: Vec<IndexedUnit<'data>>,
}

impl<'data> DebugInfo<'data> {
    /// Loads the DWARF sections embedded in a Mach-O (normally a dSYM).
    pub fn load(macho: &'data MachO) -> Result<Self, ContainerError> {
        let section = |name: &str| macho.section_data(name).unwrap_or_default();
        let sections = DwarfSections {
            debug_info: section(".debug_info"),
            debug_abbrev: section(".debug_abbrev"),
            debug_str: section(".debug_str"),
            debug_str_offsets: section(".debug_str_offsets"),
            debug_addr: section(".debug_addr"),
            debug_line: section(".debug_line"),
            debug_line_str: section(".debug_line_str"),
            debug_ranges: section(".debug_ranges"),
            debug_rnglists: section(".debug_rnglists"),
        };
        if sections.debug_info.is_empty() {
            return Err(ContainerError::NoDebugInfo {
                path: macho.path.clone(),
            });
        }

        Self::from_sections(sections).map_err(|source| ContainerError::MalformedDebugInfo {
            path: macho.path.clone(),
            source,
        })
    }

    /// Indexes every unit header. A header that can't be parsed fails the
    /// whole load.
    pub fn from_sections(sections: DwarfSections<'data>) -> Result<Self, StreamError> {
        let dwarf = gimli::Dwarf::load(|id| {
            Ok::<_, gimli::Error>(EndianSlice::new(sections.get(id), LittleEndian))
        })?;

        let mut units = Vec::new();
        let mut headers = dwarf.units();
        while let Some(header) = headers.next()? {
            let unit = dwarf.unit(header);
            units.push(IndexedUnit { header, unit });
        }
        debug!("indexed {} units", units.len());

        Ok(Self { dwarf, units })
    }

    pub fn unit_headers(&self) -> impl Iterator<Item = &UnitHeader<Slice<'data>>> + '_ {
        self.units.iter().map(|indexed| &indexed.header)
    }

    /// Starts a fresh walk over every unit, in section order.
    pub fn entries(&self) -> EntryReader<'_, 'data> {
        EntryReader {
            dwarf: self,
            next_unit: 0,
            active: None,
            open: 0,
            last: None,
            pending_terminators: 0,
        }
    }

    /// Parses the entry at a `.debug_info` offset.
    pub fn entry_at(&self, offset: usize) -> Result<DebugEntry, StreamError> {
        let dangling = StreamError::DanglingReference { offset };
        let (unit, unit_offset) = self
            .units
            .iter()
            .filter_map(|indexed| indexed.unit.as_ref().ok())
            .find_map(|unit| {
                DebugInfoOffset(offset)
                    .to_unit_offset(&unit.header)
                    .map(|unit_offset| (unit, unit_offset))
            })
            .ok_or(dangling.clone())?;

        let mut cursor = unit.entries_at_offset(unit_offset)?;
        cursor.next_dfs()?;
        let entry = cursor.current().ok_or(dangling)?;
        Ok(self.convert(unit, entry)?.0)
    }

    /// Builds a `DebugEntry` and returns the entry's `DW_AT_sibling`, if any.
    fn convert(
        &self,
        unit: &Unit<Slice<'data>>,
        entry: &DebuggingInformationEntry<'_, '_, Slice<'data>>,
    ) -> Result<(DebugEntry, Option<UnitOffset>), gimli::Error> {
        let mut converted = DebugEntry {
            offset: debug_info_offset(unit, entry.offset()).unwrap_or_default(),
            tag: EntryTag::from(entry.tag()),
            has_children: entry.has_children(),
            attributes: Vec::new(),
        };
        let mut sibling = None;

        let mut attrs = entry.attrs();
        while let Some(attr) = attrs.next()? {
            let value = attr.value();
            let kept = match attr.name() {
                gimli::DW_AT_sibling => {
                    // Only forward jumps within the unit.
                    if let AttributeValue::UnitRef(offset) = value {
                        if offset.0 > entry.offset().0 {
                            sibling = Some(offset);
                        }
                    }
                    None
                }
                gimli::DW_AT_name => self.string(unit, value)?.map(|s| (Attribute::Name, s)),
                gimli::DW_AT_linkage_name | gimli::DW_AT_MIPS_linkage_name => self
                    .string(unit, value)?
                    .map(|s| (Attribute::LinkageName, s)),
                gimli::DW_AT_low_pc => self
                    .dwarf
                    .attr_address(unit, value)?
                    .map(|addr| (Attribute::LowPc, AttrValue::Address(addr))),
                gimli::DW_AT_high_pc => match self.dwarf.attr_address(unit, value.clone())? {
                    Some(addr) => Some((Attribute::HighPc, AttrValue::Address(addr))),
                    None => value
                        .udata_value()
                        .map(|len| (Attribute::HighPc, AttrValue::Constant(len))),
                },
                gimli::DW_AT_decl_line => value
                    .udata_value()
                    .map(|line| (Attribute::DeclLine, AttrValue::Constant(line))),
                gimli::DW_AT_specification => {
                    reference(unit, value).map(|off| (Attribute::Specification, off))
                }
                gimli::DW_AT_abstract_origin => {
                    reference(unit, value).map(|off| (Attribute::AbstractOrigin, off))
                }
                _ => None,
            };
            if let Some(kept) = kept {
                converted.attributes.push(kept);
            }
        }

        Ok((converted, sibling))
    }

    fn string(
        &self,
        unit: &Unit<Slice<'data>>,
        value: AttributeValue<Slice<'data>>,
    ) -> Result<Option<AttrValue>, gimli::Error> {
        let is_string = matches!(
            value,
            AttributeValue::String(_)
                | AttributeValue::DebugStrRef(_)
                | AttributeValue::DebugStrOffsetsIndex(_)
                | AttributeValue::DebugLineStrRef(_)
        );
        if !is_string {
            return Ok(None);
        }
        let s = self.dwarf.attr_string(unit, value)?;
        Ok(Some(AttrValue::String(s.to_string_lossy().into_owned())))
    }
}

fn debug_info_offset(unit: &Unit<Slice<'_>>, offset: UnitOffset) -> Option<usize> {
    unit.header
        .offset()
        .as_debug_info_offset()?
        .0
        .checked_add(offset.0)
}

fn reference(unit: &Unit<Slice<'_>>, value: AttributeValue<Slice<'_>>) -> Option<AttrValue> {
    let offset = match value {
        AttributeValue::UnitRef(offset) => debug_info_offset(unit, offset)?,
        AttributeValue::DebugInfoRef(offset) => offset.0,
        _ => return None,
    };
    Some(AttrValue::Reference(offset))
}

/// The unit being walked and gimli's cursor into it.
struct ActiveUnit<'a, 'data> {
    unit: &'a Unit<Slice<'data>>,
    cursor: EntriesCursor<'a, 'a, Slice<'data>>,
    /// Depth of the cursor's current entry; the unit's root is at 0.
    depth: isize,
    /// The current entry was read by a skip and not handed out yet.
    ready: bool,
    done: bool,
}

/// Entry with children returned last.
#[derive(Clone, Copy)]
struct LastParent {
    depth: isize,
    sibling: Option<UnitOffset>,
}

/// Sequential cursor over every unit of a [`DebugInfo`].
pub struct EntryReader<'a, 'data> {
    dwarf: &'a DebugInfo<'data>,
    next_unit: usize,
    active: Option<ActiveUnit<'a, 'data>>,
    /// Runs of children handed out and not closed yet.
    open: usize,
    last: Option<LastParent>,
    /// Terminators still owed to callers after a unit was abandoned.
    pending_terminators: usize,
}

impl<'a, 'data> EntryReader<'a, 'data> {
    fn enter_next_unit(&mut self) -> Result<bool, StreamError> {
        let dwarf = self.dwarf;
        let Some(indexed) = dwarf.units.get(self.next_unit) else {
            return Ok(false);
        };
        self.next_unit += 1;
        self.open = 0;

        let unit = indexed.unit.as_ref().map_err(|err| StreamError::from(err.clone()))?;
        debug!(
            "unit at {:#x}: DWARF v{}, {}-byte addresses",
            indexed
                .header
                .offset()
                .as_debug_info_offset()
                .map_or(0, |offset| offset.0),
            indexed.header.version(),
            indexed.header.address_size()
        );
        self.active = Some(ActiveUnit {
            unit,
            cursor: unit.entries(),
            depth: 0,
            ready: false,
            done: false,
        });
        Ok(true)
    }

    /// Gives up on the rest of the current unit after a decoding error.
    /// Callers still inside the unit receive synthesized terminators so the
    /// walk resumes with the next unit.
    fn abandon_unit(&mut self) {
        self.pending_terminators = self.open.saturating_sub(1);
        self.open = 0;
        self.last = None;
        self.active = None;
    }

    /// Steps over the subtree below `parent` without converting entries.
    /// Stops on the first entry outside it.
    fn skip_structurally(&mut self, parent: LastParent) -> Result<(), gimli::Error> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        while let Some((delta, _)) = active.cursor.next_dfs()? {
            active.depth += delta;
            if active.depth <= parent.depth {
                active.ready = true;
                return Ok(());
            }
        }
        active.done = true;
        Ok(())
    }
}

impl EntryCursor for EntryReader<'_, '_> {
    fn next_step(&mut self) -> Result<Option<Step>, StreamError> {
        if self.pending_terminators > 0 {
            self.pending_terminators -= 1;
            return Ok(Some(Step::EndOfChildren));
        }
        self.last = None;
        let dwarf = self.dwarf;

        loop {
            if self.active.is_none() && !self.enter_next_unit()? {
                return Ok(None);
            }
            let Some(active) = self.active.as_mut() else {
                continue;
            };

            if !active.ready && !active.done {
                match active.cursor.next_dfs() {
                    Ok(Some((delta, _))) => {
                        active.depth += delta;
                        active.ready = true;
                    }
                    Ok(None) => active.done = true,
                    Err(err) => {
                        self.abandon_unit();
                        return Err(err.into());
                    }
                }
            }

            // Close every run the next entry is not part of.
            let depth = if active.done {
                0
            } else {
                usize::try_from(active.depth).unwrap_or(0)
            };
            if self.open > depth {
                self.open -= 1;
                return Ok(Some(Step::EndOfChildren));
            }
            if active.done {
                self.active = None;
                continue;
            }

            active.ready = false;
            let converted = match active.cursor.current() {
                Some(entry) => dwarf.convert(active.unit, entry),
                None => continue,
            };
            let (entry, sibling) = match converted {
                Ok(converted) => converted,
                Err(err) => {
                    self.abandon_unit();
                    return Err(err.into());
                }
            };
            if entry.has_children {
                self.open += 1;
                self.last = Some(LastParent {
                    depth: active.depth,
                    sibling,
                });
            }
            return Ok(Some(Step::Entry(entry)));
        }
    }

    fn skip_children(&mut self) -> Result<(), StreamError> {
        let Some(parent) = self.last.take() else {
            return Ok(());
        };
        self.open = self.open.saturating_sub(1);

        if let (Some(sibling), Some(active)) = (parent.sibling, self.active.as_mut()) {
            match active.unit.entries_at_offset(sibling) {
                Ok(cursor) => {
                    trace!("skipping to sibling at unit offset {:#x}", sibling.0);
                    active.cursor = cursor;
                    active.depth = parent.depth;
                    active.ready = false;
                    return Ok(());
                }
                Err(err) => trace!("ignoring sibling {:#x}: {err}", sibling.0),
            }
        }

        if let Err(err) = self.skip_structurally(parent) {
            self.abandon_unit();
            return Err(err.into());
        }
        Ok(())
    }

    fn entry_at(&self, offset: usize) -> Result<Option<DebugEntry>, StreamError> {
        self.dwarf.entry_at(offset).map(Some)
    }
}
