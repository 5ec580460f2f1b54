//! Pluggable value renderers.
//!
//! A dumper is chosen in a fixed fallback order: exact type name, type name pattern,
//! type category (raw pointer), then the generic member-by-member renderer.
mod generic;
mod pointer;
mod string;

pub use generic::GenericDumper;
pub use pointer::PointerDumper;
pub use string::StringDumper;

use crate::debugger::error::Error;
use crate::debugger::variable::format::{FormatHint, NumericBase, StringEncoding};
use crate::debugger::variable::value::Variable;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// Debuggee memory access needed by dumpers that follow pointers.
pub trait MemoryReader {
    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>, Error>;
}

pub struct DumpContext<'a> {
    pub memory: &'a mut dyn MemoryReader,
    /// Hint set by the user for this value's type, if any.
    pub hint: Option<FormatHint>,
    pub default_base: NumericBase,
    pub max_string_length: usize,
}

impl DumpContext<'_> {
    pub fn base(&self) -> NumericBase {
        match self.hint {
            Some(FormatHint::Base(base)) => base,
            _ => self.default_base,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rendered {
    pub value: String,
    pub expandable: bool,
}

pub trait Dumper: Send + Sync {
    fn name(&self) -> &str;

    fn render(&self, var: &Variable, ctx: &mut DumpContext) -> Result<Rendered, Error>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeCategory {
    Pointer,
}

/// Collapse whitespace so `const char *` and `const char*` name the same type.
pub fn normalize_type_name(name: &str) -> String {
    let joined = name.split_whitespace().collect::<Vec<_>>().join(" ");
    joined.replace(" *", "*")
}

pub struct DumperRegistry {
    exact: HashMap<String, Arc<dyn Dumper>>,
    patterns: Vec<(Regex, Arc<dyn Dumper>)>,
    categories: HashMap<TypeCategory, Arc<dyn Dumper>>,
    strings: HashMap<StringEncoding, Arc<dyn Dumper>>,
    generic: Arc<dyn Dumper>,
}

impl DumperRegistry {
    /// Registry with the generic dumper only.
    pub fn empty() -> Self {
        let strings = [
            StringEncoding::Latin1,
            StringEncoding::Utf8,
            StringEncoding::Utf16,
            StringEncoding::Ucs4,
        ]
        .into_iter()
        .map(|enc| (enc, Arc::new(StringDumper::new(enc)) as Arc<dyn Dumper>))
        .collect();

        Self {
            exact: HashMap::new(),
            patterns: vec![],
            categories: HashMap::new(),
            strings,
            generic: Arc::new(GenericDumper),
        }
    }

    pub fn register_exact(&mut self, type_name: &str, dumper: Arc<dyn Dumper>) {
        self.exact.insert(normalize_type_name(type_name), dumper);
    }

    /// Patterns are tried in registration order.
    pub fn register_pattern(&mut self, pattern: &str, dumper: Arc<dyn Dumper>) -> Result<(), Error> {
        self.patterns.push((Regex::new(pattern)?, dumper));
        Ok(())
    }

    pub fn register_category(&mut self, category: TypeCategory, dumper: Arc<dyn Dumper>) {
        self.categories.insert(category, dumper);
    }

    /// Select a dumper for `var`.
    pub fn lookup(&self, var: &Variable, hint: Option<FormatHint>) -> &dyn Dumper {
        if var.is_pointer() {
            match hint {
                Some(FormatHint::Encoding(enc)) => return self.strings[&enc].as_ref(),
                Some(FormatHint::Raw) => {
                    if let Some(dumper) = self.categories.get(&TypeCategory::Pointer) {
                        return dumper.as_ref();
                    }
                }
                _ => {}
            }
        }

        let type_name = normalize_type_name(&var.type_name);
        if let Some(dumper) = self.exact.get(&type_name) {
            return dumper.as_ref();
        }
        if let Some((_, dumper)) = self.patterns.iter().find(|(re, _)| re.is_match(&type_name)) {
            return dumper.as_ref();
        }
        if var.is_pointer() {
            if let Some(dumper) = self.categories.get(&TypeCategory::Pointer) {
                return dumper.as_ref();
            }
        }
        self.generic.as_ref()
    }
}

impl Default for DumperRegistry {
    /// Registry with built-in string and pointer dumpers.
    fn default() -> Self {
        let mut registry = Self::empty();

        let table: &[(StringEncoding, &[&str])] = &[
            (
                StringEncoding::Latin1,
                &["char*", "const char*", "signed char*", "unsigned char*", "const unsigned char*"],
            ),
            (
                StringEncoding::Utf8,
                &["char8_t*", "const char8_t*", "u8*", "*const u8", "*mut u8"],
            ),
            (
                StringEncoding::Utf16,
                &["char16_t*", "const char16_t*", "u16*", "*const u16", "*mut u16"],
            ),
            (
                StringEncoding::Ucs4,
                &["char32_t*", "const char32_t*", "wchar_t*", "const wchar_t*", "u32*"],
            ),
        ];
        for (enc, types) in table {
            let dumper = registry.strings[enc].clone();
            for ty in *types {
                registry.register_exact(ty, dumper.clone());
            }
        }

        registry.register_category(TypeCategory::Pointer, Arc::new(PointerDumper));
        registry
    }
}
