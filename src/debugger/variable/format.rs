//! Format hints, sticky per type name.
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use strum_macros::{Display as StrumDisplay, EnumString};

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, StrumDisplay, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NumericBase {
    #[default]
    Dec,
    Hex,
    Oct,
    Bin,
}

impl NumericBase {
    pub fn format_u64(self, v: u64) -> String {
        match self {
            NumericBase::Dec => v.to_string(),
            NumericBase::Hex => format!("{v:#x}"),
            NumericBase::Oct => format!("{v:#o}"),
            NumericBase::Bin => format!("{v:#b}"),
        }
    }

    /// Negative numbers are shown as two's complement in non decimal bases.
    pub fn format_i64(self, v: i64) -> String {
        match self {
            NumericBase::Dec => v.to_string(),
            _ => self.format_u64(v as u64),
        }
    }
}

/// Code unit of a NUL terminated string in debuggee memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, StrumDisplay, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    Latin1,
    Utf8,
    Utf16,
    Ucs4,
}

impl StringEncoding {
    pub fn unit_size(self) -> usize {
        match self {
            StringEncoding::Latin1 | StringEncoding::Utf8 => 1,
            StringEncoding::Utf16 => 2,
            StringEncoding::Ucs4 => 4,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatHint {
    Base(NumericBase),
    Encoding(StringEncoding),
    /// Show pointers as bare addresses, no string decoding.
    Raw,
}

impl Display for FormatHint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatHint::Base(base) => write!(f, "{base}"),
            FormatHint::Encoding(enc) => write!(f, "{enc}"),
            FormatHint::Raw => f.write_str("raw"),
        }
    }
}

impl FromStr for FormatHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "raw" {
            return Ok(FormatHint::Raw);
        }
        if let Ok(base) = NumericBase::from_str(&s) {
            return Ok(FormatHint::Base(base));
        }
        if let Ok(enc) = StringEncoding::from_str(&s) {
            return Ok(FormatHint::Encoding(enc));
        }
        Err(format!("unknown format `{s}`"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_numeric_formatting() {
        struct TestCase {
            base: NumericBase,
            value: i64,
            expected: &'static str,
        }

        let cases = vec![
            TestCase { base: NumericBase::Dec, value: -5, expected: "-5" },
            TestCase { base: NumericBase::Hex, value: 255, expected: "0xff" },
            TestCase { base: NumericBase::Hex, value: -1, expected: "0xffffffffffffffff" },
            TestCase { base: NumericBase::Oct, value: 8, expected: "0o10" },
            TestCase { base: NumericBase::Bin, value: 5, expected: "0b101" },
        ];

        for tc in cases {
            assert_eq!(tc.base.format_i64(tc.value), tc.expected);
        }
    }

    #[test]
    fn test_hint_parsing() {
        assert_eq!("HEX".parse(), Ok(FormatHint::Base(NumericBase::Hex)));
        assert_eq!("utf16".parse(), Ok(FormatHint::Encoding(StringEncoding::Utf16)));
        assert_eq!("raw".parse(), Ok(FormatHint::Raw));
        assert!("utf7".parse::<FormatHint>().is_err());
    }
}
