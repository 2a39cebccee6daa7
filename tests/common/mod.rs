#![allow(dead_code)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gatos::dwarf::{AttrValue, Attribute, DebugEntry, DwarfSections, EntryCursor, EntryTag, Step};
use gatos::error::StreamError;
use gimli::{DwAt, DwForm, DwTag};

/// Attribute value together with the form it is encoded in.
#[derive(Clone, Debug)]
pub enum Value {
    Str(String),
    Strp(String),
    Addr(u64),
    Data2(u16),
    Data4(u32),
    Udata(u64),
    ImplicitConst(i64),
    /// Unit-relative reference encoded as `DW_FORM_ref_udata`.
    RefUdata(u64),
}

/// A debug-information entry and its subtree, used both to feed the
/// in-memory cursor and to assemble real DWARF bytes.
#[derive(Clone, Debug)]
pub struct Node {
    pub tag: DwTag,
    pub attrs: Vec<(DwAt, Value)>,
    pub children: Vec<Node>,
    pub has_children: bool,
    pub sibling: bool,
    pub raw: Option<Vec<u8>>,
}

impl Node {
    pub fn new(tag: DwTag) -> Self {
        Self {
            tag,
            attrs: Vec::new(),
            children: Vec::new(),
            has_children: false,
            sibling: false,
            raw: None,
        }
    }

    /// Bytes copied verbatim into `.debug_info`, for corrupting a tree.
    pub fn raw(bytes: &[u8]) -> Self {
        Self {
            raw: Some(bytes.to_vec()),
            ..Self::new(DwTag(0))
        }
    }

    pub fn attr(mut self, attr: DwAt, value: Value) -> Self {
        self.attrs.push((attr, value));
        self
    }

    pub fn child(mut self, node: Node) -> Self {
        self.has_children = true;
        self.children.push(node);
        self
    }

    pub fn children(mut self, nodes: Vec<Node>) -> Self {
        self.has_children = true;
        self.children.extend(nodes);
        self
    }

    /// Emits a `DW_AT_sibling` pointing past this entry's subtree.
    pub fn with_sibling(mut self) -> Self {
        self.sibling = true;
        self
    }

    fn to_entry(&self, offset: usize) -> DebugEntry {
        let mut entry = DebugEntry::new(EntryTag::from(self.tag)).with_children(self.has_children);
        entry.offset = offset;
        for (attr, value) in &self.attrs {
            let kind = match *attr {
                gimli::DW_AT_name => Attribute::Name,
                gimli::DW_AT_low_pc => Attribute::LowPc,
                gimli::DW_AT_high_pc => Attribute::HighPc,
                gimli::DW_AT_decl_line => Attribute::DeclLine,
                _ => continue,
            };
            let value = match value {
                Value::Str(s) | Value::Strp(s) => AttrValue::String(s.clone()),
                Value::Addr(addr) => AttrValue::Address(*addr),
                Value::Data2(v) => AttrValue::Constant(*v as u64),
                Value::Data4(v) => AttrValue::Constant(*v as u64),
                Value::Udata(v) => AttrValue::Constant(*v),
                Value::ImplicitConst(v) => AttrValue::Constant(*v as u64),
                Value::RefUdata(v) => AttrValue::Reference(*v as usize),
            };
            entry.attributes.push((kind, value));
        }
        entry
    }
}

pub fn compile_unit(name: &str) -> Node {
    Node::new(gimli::DW_TAG_compile_unit).attr(gimli::DW_AT_name, Value::Str(name.to_string()))
}

pub fn subprogram(name: &str, low: u64, high: u64) -> Node {
    Node::new(gimli::DW_TAG_subprogram)
        .attr(gimli::DW_AT_name, Value::Str(name.to_string()))
        .attr(gimli::DW_AT_low_pc, Value::Addr(low))
        .attr(gimli::DW_AT_high_pc, Value::Addr(high))
}

pub fn subprogram_at_line(name: &str, low: u64, high: u64, line: u32) -> Node {
    subprogram(name, low, high).attr(gimli::DW_AT_decl_line, Value::Data4(line))
}

/// Flattens trees into the pre-order step sequence a cursor produces. Each
/// entry's offset is its index in the sequence.
pub fn flatten(roots: &[Node]) -> Vec<Step> {
    fn push(node: &Node, steps: &mut Vec<Step>) {
        let offset = steps.len();
        steps.push(Step::Entry(node.to_entry(offset)));
        if node.has_children {
            for child in &node.children {
                push(child, steps);
            }
            steps.push(Step::EndOfChildren);
        }
    }

    let mut steps = Vec::new();
    for root in roots {
        push(root, &mut steps);
    }
    steps
}

/// Cursor over a prepared step sequence.
pub struct VecCursor {
    steps: Vec<Step>,
    pos: usize,
    last_children: bool,
    pub skipped: usize,
}

impl VecCursor {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            pos: 0,
            last_children: false,
            skipped: 0,
        }
    }

    pub fn from_tree(roots: &[Node]) -> Self {
        Self::new(flatten(roots))
    }
}

impl EntryCursor for VecCursor {
    fn next_step(&mut self) -> Result<Option<Step>, StreamError> {
        let step = self.steps.get(self.pos).cloned();
        if step.is_some() {
            self.pos += 1;
        }
        self.last_children = matches!(&step, Some(Step::Entry(entry)) if entry.has_children);
        Ok(step)
    }

    fn skip_children(&mut self) -> Result<(), StreamError> {
        if !self.last_children {
            return Ok(());
        }
        self.last_children = false;
        self.skipped += 1;
        let mut nesting = 1usize;
        while nesting > 0 {
            match self.steps.get(self.pos) {
                None => break,
                Some(Step::EndOfChildren) => nesting -= 1,
                Some(Step::Entry(entry)) if entry.has_children => nesting += 1,
                Some(Step::Entry(_)) => {}
            }
            self.pos += 1;
        }
        Ok(())
    }

    fn entry_at(&self, offset: usize) -> Result<Option<DebugEntry>, StreamError> {
        Ok(match self.steps.get(offset) {
            Some(Step::Entry(entry)) => Some(entry.clone()),
            _ => None,
        })
    }
}

fn push_uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn push_sleb(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Owned section contents produced by [`DwarfBuilder`].
#[derive(Clone, Debug, Default)]
pub struct SectionBytes {
    pub debug_info: Vec<u8>,
    pub debug_abbrev: Vec<u8>,
    pub debug_str: Vec<u8>,
}

impl SectionBytes {
    pub fn sections(&self) -> DwarfSections<'_> {
        DwarfSections {
            debug_info: &self.debug_info,
            debug_abbrev: &self.debug_abbrev,
            debug_str: &self.debug_str,
            ..DwarfSections::default()
        }
    }
}

/// Assembles `.debug_info`, `.debug_abbrev` and `.debug_str` for DWARF 4
/// units with 8-byte addresses. Every entry gets its own abbreviation.
pub struct DwarfBuilder {
    abbrev: Vec<u8>,
    info: Vec<u8>,
    strings: Vec<u8>,
    next_code: u64,
}

impl DwarfBuilder {
    pub fn new() -> Self {
        Self {
            abbrev: Vec::new(),
            info: Vec::new(),
            strings: Vec::new(),
            next_code: 1,
        }
    }

    pub fn unit(mut self, root: Node) -> Self {
        let mut unit = Vec::new();
        unit.extend_from_slice(&0u32.to_le_bytes());
        unit.extend_from_slice(&4u16.to_le_bytes());
        unit.extend_from_slice(&0u32.to_le_bytes());
        unit.push(8);
        self.encode(&root, &mut unit);
        let length = (unit.len() - 4) as u32;
        unit[..4].copy_from_slice(&length.to_le_bytes());
        self.info.extend_from_slice(&unit);
        self
    }

    pub fn build(mut self) -> SectionBytes {
        self.abbrev.push(0);
        SectionBytes {
            debug_info: self.info,
            debug_abbrev: self.abbrev,
            debug_str: self.strings,
        }
    }

    fn encode(&mut self, node: &Node, out: &mut Vec<u8>) {
        if let Some(raw) = &node.raw {
            out.extend_from_slice(raw);
            return;
        }

        let code = self.next_code;
        self.next_code += 1;

        push_uleb(&mut self.abbrev, code);
        push_uleb(&mut self.abbrev, node.tag.0.into());
        self.abbrev.push(node.has_children as u8);
        if node.sibling {
            push_uleb(&mut self.abbrev, gimli::DW_AT_sibling.0.into());
            push_uleb(&mut self.abbrev, gimli::DW_FORM_ref4.0.into());
        }
        for (attr, value) in &node.attrs {
            push_uleb(&mut self.abbrev, attr.0.into());
            let form: DwForm = match value {
                Value::Str(_) => gimli::DW_FORM_string,
                Value::Strp(_) => gimli::DW_FORM_strp,
                Value::Addr(_) => gimli::DW_FORM_addr,
                Value::Data2(_) => gimli::DW_FORM_data2,
                Value::Data4(_) => gimli::DW_FORM_data4,
                Value::Udata(_) => gimli::DW_FORM_udata,
                Value::ImplicitConst(_) => gimli::DW_FORM_implicit_const,
                Value::RefUdata(_) => gimli::DW_FORM_ref_udata,
            };
            push_uleb(&mut self.abbrev, form.0.into());
            if let Value::ImplicitConst(v) = value {
                push_sleb(&mut self.abbrev, *v);
            }
        }
        self.abbrev.extend_from_slice(&[0, 0]);

        push_uleb(out, code);
        let sibling_at = node.sibling.then(|| {
            out.extend_from_slice(&[0; 4]);
            out.len() - 4
        });
        for (_, value) in &node.attrs {
            match value {
                Value::Str(s) => {
                    out.extend_from_slice(s.as_bytes());
                    out.push(0);
                }
                Value::Strp(s) => {
                    let offset = self.strings.len() as u32;
                    self.strings.extend_from_slice(s.as_bytes());
                    self.strings.push(0);
                    out.extend_from_slice(&offset.to_le_bytes());
                }
                Value::Addr(addr) => out.extend_from_slice(&addr.to_le_bytes()),
                Value::Data2(v) => out.extend_from_slice(&v.to_le_bytes()),
                Value::Data4(v) => out.extend_from_slice(&v.to_le_bytes()),
                Value::Udata(v) | Value::RefUdata(v) => push_uleb(out, *v),
                Value::ImplicitConst(_) => {}
            }
        }

        if node.has_children {
            for child in &node.children {
                self.encode(child, out);
            }
            out.push(0);
        }

        if let Some(at) = sibling_at {
            let next = out.len() as u32;
            out[at..at + 4].copy_from_slice(&next.to_le_bytes());
        }
    }
}

const MH_MAGIC_64: u32 = 0xfeed_facf;
const CPU_TYPE_X86_64: u32 = 0x0100_0007;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;
const LC_SEGMENT_64: u32 = 0x19;
const LC_UUID: u32 = 0x1b;
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DSYM: u32 = 0xa;

pub struct SegmentSpec {
    pub name: &'static str,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub sections: Vec<(&'static str, Vec<u8>)>,
}

/// Builds a thin 64-bit Mach-O image.
pub struct MachOBuilder {
    filetype: u32,
    cputype: u32,
    uuid: Option<[u8; 16]>,
    segments: Vec<SegmentSpec>,
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; 16];
    field[..name.len()].copy_from_slice(name.as_bytes());
    out.extend_from_slice(&field);
}

impl MachOBuilder {
    pub fn new(filetype: u32) -> Self {
        Self {
            filetype,
            cputype: CPU_TYPE_X86_64,
            uuid: None,
            segments: Vec::new(),
        }
    }

    pub fn arm64(mut self) -> Self {
        self.cputype = CPU_TYPE_ARM64;
        self
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn segment(mut self, segment: SegmentSpec) -> Self {
        self.segments.push(segment);
        self
    }

    /// A dSYM-style `__DWARF` segment carrying the given sections.
    pub fn dwarf(self, sections: &SectionBytes) -> Self {
        let mut list = vec![
            ("__debug_info", sections.debug_info.clone()),
            ("__debug_abbrev", sections.debug_abbrev.clone()),
        ];
        if !sections.debug_str.is_empty() {
            list.push(("__debug_str", sections.debug_str.clone()));
        }
        self.segment(SegmentSpec {
            name: "__DWARF",
            vmaddr: 0x1_0001_0000,
            vmsize: 0x1000,
            sections: list,
        })
    }

    pub fn build(self) -> Vec<u8> {
        let mut sizeofcmds: usize = self
            .segments
            .iter()
            .map(|segment| 72 + 80 * segment.sections.len())
            .sum();
        if self.uuid.is_some() {
            sizeofcmds += 24;
        }
        let ncmds = self.segments.len() + self.uuid.is_some() as usize;

        let mut out = Vec::new();
        out.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
        out.extend_from_slice(&self.cputype.to_le_bytes());
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&self.filetype.to_le_bytes());
        out.extend_from_slice(&(ncmds as u32).to_le_bytes());
        out.extend_from_slice(&(sizeofcmds as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        let mut data = Vec::new();
        let data_start = 32 + sizeofcmds;

        for segment in &self.segments {
            let fileoff = if segment.sections.is_empty() {
                0
            } else {
                data_start + data.len()
            };
            let filesize: usize = segment.sections.iter().map(|(_, bytes)| bytes.len()).sum();

            out.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
            out.extend_from_slice(&((72 + 80 * segment.sections.len()) as u32).to_le_bytes());
            push_name(&mut out, segment.name);
            out.extend_from_slice(&segment.vmaddr.to_le_bytes());
            out.extend_from_slice(&segment.vmsize.to_le_bytes());
            out.extend_from_slice(&(fileoff as u64).to_le_bytes());
            out.extend_from_slice(&(filesize as u64).to_le_bytes());
            out.extend_from_slice(&7u32.to_le_bytes());
            out.extend_from_slice(&5u32.to_le_bytes());
            out.extend_from_slice(&(segment.sections.len() as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());

            let mut addr = segment.vmaddr;
            for (name, bytes) in &segment.sections {
                let offset = data_start + data.len();
                push_name(&mut out, name);
                push_name(&mut out, segment.name);
                out.extend_from_slice(&addr.to_le_bytes());
                out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                out.extend_from_slice(&(offset as u32).to_le_bytes());
                // align, reloff, nreloc, flags, reserved1-3
                out.extend_from_slice(&[0u8; 28]);
                data.extend_from_slice(bytes);
                addr += bytes.len() as u64;
            }
        }

        if let Some(uuid) = self.uuid {
            out.extend_from_slice(&LC_UUID.to_le_bytes());
            out.extend_from_slice(&24u32.to_le_bytes());
            out.extend_from_slice(&uuid);
        }

        out.extend_from_slice(&data);
        out
    }
}

/// An executable whose `__TEXT` segment starts at `text_base`.
pub fn executable(text_base: u64) -> MachOBuilder {
    MachOBuilder::new(MH_EXECUTE).segment(SegmentSpec {
        name: "__TEXT",
        vmaddr: text_base,
        vmsize: 0x10000,
        sections: Vec::new(),
    })
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Lays out `<name>.dSYM/Contents/Resources/DWARF/<name>`.
pub fn write_dsym_bundle(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let bundle = dir.join(format!("{name}.dSYM"));
    let dwarf_dir = bundle.join("Contents").join("Resources").join("DWARF");
    std::fs::create_dir_all(&dwarf_dir)
        .with_context(|| format!("Failed to create {}", dwarf_dir.display()))?;
    write_file(&dwarf_dir, name, bytes)?;
    Ok(bundle)
}

/// The scenario from a real crash report: `-[CPrefsViewController
/// pickImage:]` at `[0x43c0, 0x4400)`, declared on line 332.
pub fn prefs_controller_unit() -> Node {
    compile_unit("/src/CPrefsViewController.mm").children(vec![
        subprogram_at_line("-[CPrefsViewController viewDidLoad]", 0x4300, 0x43c0, 120),
        subprogram_at_line("-[CPrefsViewController pickImage:]", 0x43c0, 0x4400, 332),
    ])
}
