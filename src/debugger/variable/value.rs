use serde::{Deserialize, Serialize};

/// Backend view of a value, before any dumper rendered it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    /// Already rendered by the backend (GDB value strings, script strings).
    Text(String),
    Pointer(u64),
    /// Value with members, `children` is the member count when the backend knows it.
    Aggregate {
        summary: Option<String>,
        children: Option<usize>,
    },
    /// Value exists but cannot be read (optimized out, no memory...).
    Unavailable(String),
}

impl RawValue {
    pub fn has_children(&self) -> bool {
        match self {
            RawValue::Aggregate { children, .. } => children.map(|c| c > 0).unwrap_or(true),
            _ => false,
        }
    }
}

/// Named value as returned by locals/evaluate/children queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Display name, a member name or an index for children.
    pub name: String,
    /// Expression that evaluates to this value in its frame.
    pub expression: String,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
    pub value: RawValue,
}

impl Variable {
    pub fn new(
        name: impl Into<String>,
        expression: impl Into<String>,
        type_name: impl Into<String>,
        value: RawValue,
    ) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
            type_name: type_name.into(),
            address: None,
            value,
        }
    }

    /// True for raw pointer types (`T*` style and `*const T` style names) or pointer values.
    pub fn is_pointer(&self) -> bool {
        let ty = self.type_name.trim();
        matches!(self.value, RawValue::Pointer(_))
            || ty.ends_with('*')
            || ty.starts_with("*const ")
            || ty.starts_with("*mut ")
    }

    /// Pointer target address, if this is a pointer.
    pub fn pointer_target(&self) -> Option<u64> {
        match self.value {
            RawValue::Pointer(addr) => Some(addr),
            RawValue::UInt(addr) if self.is_pointer() => Some(addr),
            RawValue::Int(addr) if self.is_pointer() => Some(addr as u64),
            _ => None,
        }
    }
}
