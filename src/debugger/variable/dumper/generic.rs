use crate::debugger::error::Error;
use crate::debugger::variable::dumper::{DumpContext, Dumper, Rendered};
use crate::debugger::variable::value::{RawValue, Variable};

/// Fallback renderer, members are expanded one by one through the backend.
pub struct GenericDumper;

impl Dumper for GenericDumper {
    fn name(&self) -> &str {
        "generic"
    }

    fn render(&self, var: &Variable, ctx: &mut DumpContext) -> Result<Rendered, Error> {
        let base = ctx.base();
        let value = match &var.value {
            RawValue::Int(v) => base.format_i64(*v),
            RawValue::UInt(v) => base.format_u64(*v),
            RawValue::Float(v) => v.to_string(),
            RawValue::Bool(v) => v.to_string(),
            RawValue::Text(text) => text.clone(),
            RawValue::Pointer(addr) => format!("{addr:#x}"),
            RawValue::Aggregate { summary, .. } => {
                summary.clone().unwrap_or_else(|| "{...}".to_string())
            }
            RawValue::Unavailable(reason) => format!("<{reason}>"),
        };

        Ok(Rendered {
            value,
            expandable: var.value.has_children(),
        })
    }
}
