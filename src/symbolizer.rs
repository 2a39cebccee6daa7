use std::fmt;
use std::path::Path;

use log::{debug, error, trace, warn};
use rustc_demangle::try_demangle;

use crate::dwarf::{Attribute, DebugEntry, EntryCursor, EntryTag, Step};
use crate::types::FileAddr;

/// Bound on `DW_AT_specification`/`DW_AT_abstract_origin` chains.
const MAX_REFERENCE_DEPTH: usize = 8;

/// A function whose code range covers the target address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub function_name: Option<String>,
    /// Final path component of the enclosing compile unit's name; empty when
    /// the function was found outside any compile unit.
    pub file_base_name: String,
    pub decl_line: Option<u64>,
}

impl fmt::Display for ResolvedSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.function_name.as_deref().unwrap_or("<unknown>");
        let file = if self.file_base_name.is_empty() {
            "<unknown>"
        } else {
            &self.file_base_name
        };
        match self.decl_line {
            Some(line) => write!(f, "{name} ({file}:{line})"),
            None => write!(f, "{name} ({file})"),
        }
    }
}

/// Compile unit enclosing the entries currently being walked.
#[derive(Clone, Copy, Debug, Default)]
struct Scope<'s> {
    file: Option<&'s str>,
}

/// Walks the whole tree behind `cursor` once and returns every subprogram
/// whose `[low_pc, high_pc)` range contains `target`, in pre-order.
///
/// Malformed entries are logged and end the subtree they occur in; they never
/// abort the walk.
pub fn resolve<C: EntryCursor>(cursor: &mut C, target: FileAddr) -> Vec<ResolvedSymbol> {
    let mut walk = Walk {
        cursor,
        target,
        matches: Vec::new(),
        visited: 0,
    };
    walk.walk_children(Scope::default(), false, true);
    debug!(
        "visited {} entries, {} match(es) for {:#x}",
        walk.visited,
        walk.matches.len(),
        target
    );
    walk.matches
}

struct Walk<'c, C> {
    cursor: &'c mut C,
    target: FileAddr,
    matches: Vec<ResolvedSymbol>,
    visited: usize,
}

impl<C: EntryCursor> Walk<'_, C> {
    fn walk_children(&mut self, scope: Scope<'_>, skip_allowed: bool, top_level: bool) {
        loop {
            let entry = match self.cursor.next_step() {
                Ok(Some(Step::Entry(entry))) => entry,
                // Stray terminators outside any unit carry no structure.
                Ok(Some(Step::EndOfChildren)) if top_level => continue,
                Ok(Some(Step::EndOfChildren)) | Ok(None) => return,
                // The cursor has already moved past the unit that failed.
                Err(err) if top_level => {
                    error!("{err}");
                    continue;
                }
                Err(err) => {
                    error!("{err}");
                    return;
                }
            };

            if !self.visit(&entry, scope, skip_allowed) {
                return;
            }
        }
    }

    /// Handles one entry and its subtree. Returns `false` when the cursor
    /// failed and the current level has to be abandoned.
    fn visit(&mut self, entry: &DebugEntry, scope: Scope<'_>, skip_allowed: bool) -> bool {
        self.visited += 1;
        match entry.tag {
            EntryTag::CompileUnit => {
                let unit = Scope { file: entry.name() };
                debug!(
                    "compile unit {} at {:#x}",
                    unit.file.unwrap_or("<unnamed>"),
                    entry.offset
                );
                if entry.has_children {
                    self.walk_children(unit, true, false);
                }
            }
            EntryTag::Subprogram => {
                if let Some(symbol) = self.match_subprogram(entry, scope) {
                    self.matches.push(symbol);
                }
                if entry.has_children {
                    self.walk_children(scope, skip_allowed, false);
                }
            }
            EntryTag::Other(tag) => {
                if !entry.has_children {
                    return true;
                }
                if skip_allowed {
                    trace!("skipping children of {tag} at {:#x}", entry.offset);
                    if let Err(err) = self.cursor.skip_children() {
                        error!("{err}");
                        return false;
                    }
                } else {
                    self.walk_children(scope, true, false);
                }
            }
        }
        true
    }

    fn match_subprogram(&self, entry: &DebugEntry, scope: Scope<'_>) -> Option<ResolvedSymbol> {
        let range = entry.pc_range()?;
        trace!(
            "subprogram at {:#x}: [{:#x}, {:#x})",
            entry.offset,
            range.start,
            range.end
        );
        if !range.contains(&self.target.addr()) {
            return None;
        }

        let (function_name, decl_line) = self.describe(entry);
        let symbol = ResolvedSymbol {
            function_name,
            file_base_name: base_name(scope.file.unwrap_or_default()),
            decl_line,
        };
        debug!("{:#x} matched {symbol}", self.target);
        Some(symbol)
    }

    /// Name and declaration line of a subprogram, following references to
    /// its declaration or abstract origin for whatever it lacks.
    fn describe(&self, entry: &DebugEntry) -> (Option<String>, Option<u64>) {
        let mut name = display_name(entry);
        let mut line = entry.decl_line();
        let mut next = origin_of(entry);

        for _ in 0..MAX_REFERENCE_DEPTH {
            if name.is_some() && line.is_some() {
                break;
            }
            let Some(offset) = next else {
                break;
            };
            let origin = match self.cursor.entry_at(offset) {
                Ok(Some(origin)) => origin,
                Ok(None) => break,
                Err(err) => {
                    warn!("can't follow reference to {offset:#x}: {err}");
                    break;
                }
            };
            name = name.or_else(|| display_name(&origin));
            line = line.or(origin.decl_line());
            next = origin_of(&origin);
        }

        (name, line)
    }
}

fn origin_of(entry: &DebugEntry) -> Option<usize> {
    entry
        .reference(Attribute::Specification)
        .or_else(|| entry.reference(Attribute::AbstractOrigin))
}

fn display_name(entry: &DebugEntry) -> Option<String> {
    if let Some(name) = entry.name() {
        return Some(name.to_string());
    }
    entry.linkage_name().map(|linkage| match try_demangle(linkage) {
        Ok(demangled) => format!("{demangled:#}"),
        Err(_) => linkage.to_string(),
    })
}

/// Final path component, e.g. `/src/app/Foo.mm` -> `Foo.mm`.
pub fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
