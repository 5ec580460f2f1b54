//! Symbols, line tables and call frame information of the debuggee's object files.
//!
//! Addresses inside [`ObjectInfo`] are link time addresses. A [`Module`] maps an object file into
//! the debuggee and carries the bias between both.
use crate::debugger::error::Error;
use crate::debugger::location::Location;
use crate::weak_error;
use gimli::{
    BaseAddresses, CfaRule, EhFrame, LineProgramHeader, Reader as _, RegisterRule, RunTimeEndian,
    UnwindContext, UnwindSection, X86_64,
};
use indexmap::IndexSet;
use log::debug;
use nix::unistd::Pid;
use object::{Object, ObjectKind, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};
use proc_maps::MapRange;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type Reader = gimli::EndianArcSlice<RunTimeEndian>;

const PAGE_MASK: u64 = !0xfff;

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionSymbol {
    /// Demangled name without hash suffix.
    pub name: String,
    pub address: u64,
    pub size: u64,
}

impl FunctionSymbol {
    pub fn contains(&self, addr: u64) -> bool {
        addr == self.address || (addr > self.address && addr < self.address + self.size)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LineRow {
    pub address: u64,
    pub file: usize,
    pub line: u64,
    pub is_stmt: bool,
    pub end_sequence: bool,
}

/// Address sorted line table of an object file.
#[derive(Default)]
pub struct LineTable {
    files: IndexSet<PathBuf>,
    rows: Vec<LineRow>,
}

impl LineTable {
    fn new(files: IndexSet<PathBuf>, mut rows: Vec<LineRow>) -> Self {
        // sequence ends sort before sequence starts at the same address
        rows.sort_by_key(|r| (r.address, !r.end_sequence));
        Self { files, rows }
    }

    pub fn file(&self, row: &LineRow) -> Option<&Path> {
        self.files.get_index(row.file).map(PathBuf::as_path)
    }

    /// Row covering `addr`.
    pub fn row_for(&self, addr: u64) -> Option<&LineRow> {
        let idx = self.rows.partition_point(|r| r.address <= addr);
        let row = self.rows.get(idx.checked_sub(1)?)?;
        (!row.end_sequence && row.line != 0).then_some(row)
    }

    /// Statement row beginning exactly at `addr`.
    pub fn row_starting_at(&self, addr: u64) -> Option<&LineRow> {
        let row = self.row_for(addr)?;
        (row.address == addr && row.is_stmt).then_some(row)
    }

    /// First address of the nearest line at or after `line` in `file`.
    pub fn resolve(&self, file: &Path, line: u64) -> Option<(u64, PathBuf, u64)> {
        let files: Vec<usize> = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| Location::at_line(f.as_path(), 0).same_file(file))
            .map(|(idx, _)| idx)
            .collect();
        let candidates = || {
            self.rows
                .iter()
                .filter(|r| r.is_stmt && !r.end_sequence && files.contains(&r.file))
        };

        let obtained = candidates()
            .map(|r| r.line)
            .filter(|l| *l >= line)
            .min()?;
        let row = candidates()
            .filter(|r| r.line == obtained)
            .min_by_key(|r| r.address)?;
        Some((row.address, self.files.get_index(row.file)?.clone(), obtained))
    }

    /// Address right after the prologue of a function starting at `start`.
    pub fn prologue_end(&self, start: u64, end: u64) -> Option<u64> {
        let idx = self.rows.partition_point(|r| r.address <= start);
        self.rows[idx..]
            .iter()
            .take_while(|r| r.address < end)
            .find(|r| r.is_stmt && !r.end_sequence && r.line != 0)
            .map(|r| r.address)
    }
}

/// Registers needed to walk the stack.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameRegs {
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
}

/// Debug information of one object file.
pub struct ObjectInfo {
    pub path: PathBuf,
    /// Position independent, loaded at a bias.
    pub relocatable: bool,
    /// Lowest segment address, page aligned.
    segment_base: u64,
    functions: Vec<FunctionSymbol>,
    pub lines: LineTable,
    eh_frame: EhFrame<Reader>,
    bases: BaseAddresses,
}

fn load_section(id: gimli::SectionId, file: &object::File, endian: RunTimeEndian) -> Reader {
    let data = file
        .section_by_name(id.name())
        .and_then(|section| section.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[]));
    gimli::EndianArcSlice::new(Arc::from(&*data), endian)
}

fn file_path(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    header: &LineProgramHeader<Reader>,
    index: u64,
    comp_dir: &Path,
) -> Result<PathBuf, Error> {
    let Some(file) = header.file(index) else {
        return Ok(PathBuf::new());
    };
    let mut path = comp_dir.to_path_buf();
    if let Some(dir) = file.directory(header) {
        let dir = dwarf.attr_string(unit, dir)?;
        path.push(dir.to_string_lossy()?.as_ref());
    }
    let name = dwarf.attr_string(unit, file.path_name())?;
    path.push(name.to_string_lossy()?.as_ref());
    Ok(path)
}

fn line_table(dwarf: &gimli::Dwarf<Reader>) -> Result<LineTable, Error> {
    let mut files = IndexSet::new();
    let mut rows = vec![];

    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let Some(program) = unit.line_program.clone() else {
            continue;
        };
        let comp_dir = match unit.comp_dir.as_ref() {
            Some(dir) => PathBuf::from(dir.to_string_lossy()?.as_ref()),
            None => PathBuf::new(),
        };

        let mut file_idx: HashMap<u64, usize> = HashMap::new();
        let mut sequence = vec![];
        let mut program_rows = program.rows();
        while let Some((header, row)) = program_rows.next_row()? {
            let file = match file_idx.get(&row.file_index()) {
                Some(idx) => *idx,
                None => {
                    let path = file_path(dwarf, &unit, header, row.file_index(), &comp_dir)?;
                    let idx = files.insert_full(path).0;
                    file_idx.insert(row.file_index(), idx);
                    idx
                }
            };
            sequence.push(LineRow {
                address: row.address(),
                file,
                line: row.line().map(|l| l.get()).unwrap_or(0),
                is_stmt: row.is_stmt(),
                end_sequence: row.end_sequence(),
            });

            if row.end_sequence() {
                // sequences of functions dropped by the linker start at zero
                if sequence.first().is_some_and(|r| r.address != 0) {
                    rows.append(&mut sequence);
                }
                sequence.clear();
            }
        }
    }

    Ok(LineTable::new(files, rows))
}

impl ObjectInfo {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;
        Self::from_object(path, &object)
    }

    fn from_object(path: &Path, object: &object::File) -> Result<Self, Error> {
        let endian = if object.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let dwarf = gimli::Dwarf::load(|id| -> Result<Reader, Error> {
            Ok(load_section(id, object, endian))
        })?;
        let lines = line_table(&dwarf)?;
        let eh_frame = EhFrame::from(load_section(gimli::SectionId::EhFrame, object, endian));

        let section_addr = |name: &str| object.section_by_name(name).map(|s| s.address());
        let mut bases = BaseAddresses::default();
        if let Some(got) = section_addr(".got") {
            bases = bases.set_got(got);
        }
        if let Some(text) = section_addr(".text") {
            bases = bases.set_text(text);
        }
        if let Some(eh) = section_addr(".eh_frame") {
            bases = bases.set_eh_frame(eh);
        }
        if let Some(eh_frame_hdr) = section_addr(".eh_frame_hdr") {
            bases = bases.set_eh_frame_hdr(eh_frame_hdr);
        }

        let mut functions: Vec<FunctionSymbol> = object
            .symbols()
            .filter(|s| s.kind() == SymbolKind::Text && s.address() != 0)
            .filter_map(|s| {
                let name = s.name().ok()?;
                Some(FunctionSymbol {
                    name: format!("{:#}", rustc_demangle::demangle(name)),
                    address: s.address(),
                    size: s.size(),
                })
            })
            .collect();
        functions.sort_by_key(|f| f.address);
        functions.dedup_by_key(|f| f.address);

        let segment_base = object
            .segments()
            .map(|s| s.address())
            .min()
            .unwrap_or_default()
            & PAGE_MASK;

        debug!(
            target: "ptrace",
            "{} loaded: {} functions, {} line rows",
            path.display(),
            functions.len(),
            lines.rows.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            relocatable: object.kind() == ObjectKind::Dynamic,
            segment_base,
            functions,
            lines,
            eh_frame,
            bases,
        })
    }

    pub fn function_at(&self, addr: u64) -> Option<&FunctionSymbol> {
        let idx = self.functions.partition_point(|f| f.address <= addr);
        let function = self.functions.get(idx.checked_sub(1)?)?;
        function.contains(addr).then_some(function)
    }

    /// Function by its full name or by its last path segments, `compute` finds `calc::compute`.
    pub fn find_function(&self, name: &str) -> Option<&FunctionSymbol> {
        let suffix = format!("::{name}");
        self.functions
            .iter()
            .find(|f| f.name == name)
            .or_else(|| self.functions.iter().find(|f| f.name.ends_with(&suffix)))
    }

    /// Canonical frame address of the frame executing `pc`.
    pub fn cfa(&self, pc: u64, regs: &FrameRegs) -> Option<u64> {
        let mut ctx: UnwindContext<Reader> = UnwindContext::new();
        let row = self
            .eh_frame
            .unwind_info_for_address(&self.bases, &mut ctx, pc, EhFrame::cie_from_offset)
            .ok()?;
        match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                let base = match *register {
                    X86_64::RSP => regs.sp,
                    X86_64::RBP => regs.fp,
                    _ => return None,
                };
                Some(base.wrapping_add_signed(*offset))
            }
            CfaRule::Expression(_) => None,
        }
    }

    /// Registers of the caller of the frame executing `pc` (link time address).
    ///
    /// `None` when there is no unwind information or the frame is the outermost one.
    pub fn caller(
        &self,
        pc: u64,
        regs: &FrameRegs,
        read: &mut dyn FnMut(u64) -> Option<u64>,
    ) -> Option<FrameRegs> {
        let mut ctx: UnwindContext<Reader> = UnwindContext::new();
        let row = self
            .eh_frame
            .unwind_info_for_address(&self.bases, &mut ctx, pc, EhFrame::cie_from_offset)
            .ok()?;
        let cfa = match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                let base = match *register {
                    X86_64::RSP => regs.sp,
                    X86_64::RBP => regs.fp,
                    _ => return None,
                };
                base.wrapping_add_signed(*offset)
            }
            CfaRule::Expression(_) => return None,
        };

        let return_address = match row.register(X86_64::RA) {
            RegisterRule::Undefined => return None,
            RegisterRule::Offset(offset) => read(cfa.wrapping_add_signed(offset))?,
            _ => read(cfa - 8)?,
        };
        let fp = match row.register(X86_64::RBP) {
            RegisterRule::Offset(offset) => read(cfa.wrapping_add_signed(offset))?,
            _ => regs.fp,
        };

        Some(FrameRegs {
            pc: return_address,
            sp: cfa,
            fp,
        })
    }
}

/// Object file mapped into the debuggee.
#[derive(Clone)]
pub struct Module {
    pub path: PathBuf,
    pub start: u64,
    pub end: u64,
    /// Runtime address minus link time address.
    pub bias: u64,
    pub info: Option<Arc<ObjectInfo>>,
}

impl Module {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn to_global(&self, addr: u64) -> u64 {
        addr.wrapping_sub(self.bias)
    }

    pub fn to_relocated(&self, addr: u64) -> u64 {
        addr.wrapping_add(self.bias)
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Changes of the module list after a refresh.
#[derive(Debug, Default, PartialEq)]
pub struct ModuleChanges {
    pub loaded: Vec<String>,
    pub unloaded: Vec<String>,
}

/// Modules of a debuggee, rebuilt from `/proc/<pid>/maps`.
#[derive(Default)]
pub struct Modules {
    main: PathBuf,
    modules: Vec<Module>,
    cache: HashMap<PathBuf, Option<Arc<ObjectInfo>>>,
}

/// File backed mappings grouped by file: `(path, lowest start, highest end)`.
fn file_ranges<'a>(
    maps: impl IntoIterator<Item = (Option<&'a Path>, u64, u64)>,
) -> Vec<(PathBuf, u64, u64)> {
    let mut ranges: Vec<(PathBuf, u64, u64)> = vec![];
    for (path, start, size) in maps {
        let Some(path) = path else {
            continue;
        };
        if !path.is_absolute() {
            continue;
        }
        let end = start + size;
        match ranges.iter_mut().find(|(p, _, _)| p == path) {
            Some(range) => {
                range.1 = range.1.min(start);
                range.2 = range.2.max(end);
            }
            None => ranges.push((path.to_path_buf(), start, end)),
        }
    }
    ranges
}

impl Modules {
    pub fn new(main: PathBuf) -> Self {
        Self {
            main,
            modules: vec![],
            cache: HashMap::new(),
        }
    }

    fn info(&mut self, path: &Path) -> Option<Arc<ObjectInfo>> {
        self.cache
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                weak_error!(ObjectInfo::load(path), "load object file:").map(Arc::new)
            })
            .clone()
    }

    /// Reread the memory map of `pid`.
    pub fn refresh(&mut self, pid: Pid) -> Result<ModuleChanges, Error> {
        let maps: Vec<MapRange> = proc_maps::get_process_maps(pid.as_raw())?;
        let ranges = file_ranges(
            maps.iter()
                .map(|m| (m.filename(), m.start() as u64, m.size() as u64)),
        );

        let mut modules = vec![];
        for (path, start, end) in ranges {
            let info = self.info(&path);
            let bias = match info.as_ref() {
                Some(info) if info.relocatable => start.wrapping_sub(info.segment_base),
                _ => 0,
            };
            modules.push(Module {
                path,
                start,
                end,
                bias,
                info,
            });
        }

        let mut changes = ModuleChanges::default();
        for module in &modules {
            if !self.modules.iter().any(|m| m.path == module.path) {
                changes.loaded.push(module.name());
            }
        }
        for module in &self.modules {
            if !modules.iter().any(|m| m.path == module.path) {
                changes.unloaded.push(module.name());
            }
        }
        self.modules = modules;
        Ok(changes)
    }

    pub fn module_at(&self, addr: u64) -> Option<&Module> {
        self.modules.iter().find(|m| m.contains(addr))
    }

    pub fn main(&self) -> Option<&Module> {
        self.modules.iter().find(|m| m.path == self.main)
    }

    /// Modules with debug information, the main program first.
    pub fn with_info(&self) -> impl Iterator<Item = (&Module, &ObjectInfo)> {
        let main = self.main().into_iter();
        let rest = self.modules.iter().filter(|m| m.path != self.main);
        main.chain(rest)
            .filter_map(|m| m.info.as_deref().map(|info| (m, info)))
    }

    /// Source location of a runtime address, `lookup` shifts the address used for
    /// the line lookup (return addresses point past the call).
    pub fn location(&self, addr: u64, lookup: u64) -> Location {
        let mut location = Location::default().with_address(addr);
        let Some(module) = self.module_at(addr) else {
            return location;
        };
        let Some(info) = module.info.as_deref() else {
            return location;
        };
        let global = module.to_global(addr - lookup);
        if let Some(function) = info.function_at(global) {
            location.function = Some(function.name.clone());
        }
        if let Some(row) = info.lines.row_for(global) {
            location.file = info.lines.file(row).map(Path::to_path_buf);
            location.line = Some(row.line);
        }
        location
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> LineTable {
        let files: IndexSet<PathBuf> = ["/src/calc.c", "/src/util.c"]
            .into_iter()
            .map(PathBuf::from)
            .collect();
        let row = |address, file, line, is_stmt, end_sequence| LineRow {
            address,
            file,
            line,
            is_stmt,
            end_sequence,
        };
        LineTable::new(
            files,
            vec![
                row(0x2000, 1, 3, true, false),
                row(0x2010, 1, 4, true, false),
                row(0x2020, 1, 4, false, true),
                row(0x1000, 0, 10, true, false),
                row(0x1008, 0, 11, true, false),
                row(0x100c, 0, 10, false, false),
                row(0x1010, 0, 14, true, false),
                row(0x1020, 0, 14, false, true),
            ],
        )
    }

    #[test]
    fn test_row_lookup() {
        struct TestCase {
            addr: u64,
            line: Option<u64>,
            starts_row: bool,
        }

        let cases = vec![
            TestCase {
                addr: 0x1000,
                line: Some(10),
                starts_row: true,
            },
            TestCase {
                addr: 0x1009,
                line: Some(11),
                starts_row: false,
            },
            TestCase {
                addr: 0x100c,
                line: Some(10),
                starts_row: false,
            },
            TestCase {
                addr: 0x1020,
                line: None,
                starts_row: false,
            },
            TestCase {
                addr: 0x2010,
                line: Some(4),
                starts_row: true,
            },
            TestCase {
                addr: 0x0fff,
                line: None,
                starts_row: false,
            },
        ];

        let table = table();
        for tc in cases {
            assert_eq!(table.row_for(tc.addr).map(|r| r.line), tc.line, "{:#x}", tc.addr);
            assert_eq!(
                table.row_starting_at(tc.addr).is_some(),
                tc.starts_row,
                "{:#x}",
                tc.addr
            );
        }
    }

    #[test]
    fn test_resolve_line() {
        let table = table();
        assert_eq!(
            table.resolve(Path::new("calc.c"), 11),
            Some((0x1008, PathBuf::from("/src/calc.c"), 11))
        );
        // no code at 12 and 13, the next line with code is taken
        assert_eq!(
            table.resolve(Path::new("calc.c"), 12),
            Some((0x1010, PathBuf::from("/src/calc.c"), 14))
        );
        assert_eq!(table.resolve(Path::new("calc.c"), 15), None);
        assert_eq!(table.resolve(Path::new("main.c"), 1), None);
        assert_eq!(table.prologue_end(0x1000, 0x1020), Some(0x1008));
    }

    #[test]
    fn test_file_ranges() {
        let maps = vec![
            (Some(Path::new("/bin/prog")), 0x1000, 0x1000),
            (Some(Path::new("/bin/prog")), 0x3000, 0x2000),
            (Some(Path::new("[stack]")), 0x9000, 0x1000),
            (None, 0xa000, 0x1000),
            (Some(Path::new("/lib/libc.so.6")), 0x7000, 0x1000),
        ];
        assert_eq!(
            file_ranges(maps),
            vec![
                (PathBuf::from("/bin/prog"), 0x1000, 0x5000),
                (PathBuf::from("/lib/libc.so.6"), 0x7000, 0x8000),
            ]
        );
    }

    #[test]
    fn test_load_own_executable() {
        let exe = std::env::current_exe().unwrap();
        let info = ObjectInfo::load(&exe).unwrap();

        let function = info.find_function("test_load_own_executable").unwrap();
        assert!(function.name.ends_with("symbols::test::test_load_own_executable"));
        assert_eq!(info.function_at(function.address), Some(function));

        let row = info.lines.row_for(function.address).unwrap();
        assert!(info
            .lines
            .file(row)
            .unwrap()
            .to_string_lossy()
            .ends_with("symbols.rs"));
    }
}
