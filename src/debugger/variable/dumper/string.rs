use crate::debugger::error::Error;
use crate::debugger::variable::dumper::{DumpContext, Dumper, MemoryReader, Rendered};
use crate::debugger::variable::format::StringEncoding;
use crate::debugger::variable::value::Variable;
use itertools::Itertools;

const CHUNK: usize = 64;

/// NUL terminated string behind a pointer, decoded with a fixed code unit size.
pub struct StringDumper {
    encoding: StringEncoding,
    name: String,
}

impl StringDumper {
    pub fn new(encoding: StringEncoding) -> Self {
        Self {
            encoding,
            name: format!("{encoding} string"),
        }
    }

    /// Read code units until NUL or `max_units`. Returns units and a truncation flag.
    fn read_units(
        &self,
        memory: &mut dyn MemoryReader,
        address: u64,
        max_units: usize,
    ) -> Result<(Vec<u32>, bool), Error> {
        let unit = self.encoding.unit_size();
        let mut units = vec![];
        let mut cursor = address;

        while units.len() < max_units {
            let want = ((max_units - units.len()) * unit).min(CHUNK * unit);
            let bytes = match memory.read_memory(cursor, want) {
                Ok(bytes) => bytes,
                Err(e) if units.is_empty() || e.is_fatal() => return Err(e),
                Err(_) => return Ok((units, true)),
            };
            if bytes.len() < unit {
                // end of readable memory without terminator
                return Ok((units, true));
            }
            for chunk in bytes.chunks_exact(unit) {
                let code = match unit {
                    1 => chunk[0] as u32,
                    2 => u16::from_le_bytes([chunk[0], chunk[1]]) as u32,
                    _ => u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                };
                if code == 0 {
                    return Ok((units, false));
                }
                units.push(code);
                if units.len() == max_units {
                    break;
                }
            }
            cursor += (bytes.len() - bytes.len() % unit) as u64;
        }
        Ok((units, true))
    }

    fn decode(&self, units: &[u32]) -> String {
        match self.encoding {
            StringEncoding::Latin1 => units
                .iter()
                .map(|&u| char::from_u32(u).unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect(),
            StringEncoding::Utf8 => {
                let bytes = units.iter().map(|&u| u as u8).collect_vec();
                String::from_utf8_lossy(&bytes).into_owned()
            }
            StringEncoding::Utf16 => {
                let units = units.iter().map(|&u| u as u16).collect_vec();
                String::from_utf16_lossy(&units)
            }
            StringEncoding::Ucs4 => units
                .iter()
                .map(|&u| char::from_u32(u).unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect(),
        }
    }
}

impl Dumper for StringDumper {
    fn name(&self) -> &str {
        &self.name
    }

    fn render(&self, var: &Variable, ctx: &mut DumpContext) -> Result<Rendered, Error> {
        let Some(address) = var.pointer_target() else {
            return Ok(Rendered {
                value: "<not a pointer>".to_string(),
                expandable: false,
            });
        };
        if address == 0 {
            return Ok(Rendered {
                value: "0x0".to_string(),
                expandable: false,
            });
        }

        let value = match self.read_units(ctx.memory, address, ctx.max_string_length) {
            Ok((units, truncated)) => {
                let text = self.decode(&units);
                let ellipsis = if truncated { "..." } else { "" };
                format!("{address:#x} {:?}{ellipsis}", text)
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => format!("{address:#x} <unreadable: {e}>"),
        };

        Ok(Rendered {
            value,
            expandable: false,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::variable::dumper::test::FakeMemory;
    use crate::debugger::variable::format::NumericBase;
    use crate::debugger::variable::value::RawValue;

    fn render(enc: StringEncoding, data: Vec<u8>, max: usize) -> String {
        let mut memory = FakeMemory { base: 0x1000, data };
        let mut ctx = DumpContext {
            memory: &mut memory,
            hint: None,
            default_base: NumericBase::Dec,
            max_string_length: max,
        };
        let var = Variable::new("s", "s", "ptr", RawValue::Pointer(0x1000));
        StringDumper::new(enc).render(&var, &mut ctx).unwrap().value
    }

    #[test]
    fn test_string_encodings() {
        struct TestCase {
            encoding: StringEncoding,
            data: Vec<u8>,
            max: usize,
            expected: &'static str,
        }

        let utf16: Vec<u8> = "héllo"
            .encode_utf16()
            .chain([0])
            .flat_map(|u| u.to_le_bytes())
            .collect();
        let ucs4: Vec<u8> = "ok😀"
            .chars()
            .map(|c| c as u32)
            .chain([0])
            .flat_map(|u| u.to_le_bytes())
            .collect();

        let cases = vec![
            TestCase {
                encoding: StringEncoding::Latin1,
                data: b"caf\xe9\0junk".to_vec(),
                max: 100,
                expected: "0x1000 \"café\"",
            },
            TestCase {
                encoding: StringEncoding::Utf8,
                data: "café\0".as_bytes().to_vec(),
                max: 100,
                expected: "0x1000 \"café\"",
            },
            TestCase {
                encoding: StringEncoding::Utf16,
                data: utf16,
                max: 100,
                expected: "0x1000 \"héllo\"",
            },
            TestCase {
                encoding: StringEncoding::Ucs4,
                data: ucs4,
                max: 100,
                expected: "0x1000 \"ok😀\"",
            },
            TestCase {
                encoding: StringEncoding::Latin1,
                data: b"abcdef\0".to_vec(),
                max: 3,
                expected: "0x1000 \"abc\"...",
            },
            TestCase {
                encoding: StringEncoding::Latin1,
                data: b"abc".to_vec(),
                max: 100,
                expected: "0x1000 \"abc\"...",
            },
        ];

        for tc in cases {
            assert_eq!(render(tc.encoding, tc.data, tc.max), tc.expected);
        }
    }

    #[test]
    fn test_null_and_unreadable() {
        let mut memory = FakeMemory {
            base: 0x1000,
            data: vec![],
        };
        let mut ctx = DumpContext {
            memory: &mut memory,
            hint: None,
            default_base: NumericBase::Dec,
            max_string_length: 10,
        };
        let dumper = StringDumper::new(StringEncoding::Latin1);

        let null = Variable::new("s", "s", "char*", RawValue::Pointer(0));
        assert_eq!(dumper.render(&null, &mut ctx).unwrap().value, "0x0");

        let dangling = Variable::new("s", "s", "char*", RawValue::Pointer(0x10));
        let value = dumper.render(&dangling, &mut ctx).unwrap().value;
        assert!(value.starts_with("0x10 <unreadable"), "{value}");
    }
}
