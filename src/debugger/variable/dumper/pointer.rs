use crate::debugger::error::Error;
use crate::debugger::variable::dumper::{DumpContext, Dumper, Rendered};
use crate::debugger::variable::value::Variable;

/// Raw pointers: the address, expandable into the pointee when not null.
pub struct PointerDumper;

impl Dumper for PointerDumper {
    fn name(&self) -> &str {
        "pointer"
    }

    fn render(&self, var: &Variable, _: &mut DumpContext) -> Result<Rendered, Error> {
        let target = var.pointer_target().unwrap_or_default();
        Ok(Rendered {
            value: format!("{target:#x}"),
            expandable: target != 0,
        })
    }
}
