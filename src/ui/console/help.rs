use crate::ui::command::parser;

pub const HELP: &str = r#"
Available debugger commands:

r, run, start                               -- start the program, or restart it
c, continue                                 -- continue program being debugged, after signal or breakpoint
n, next                                     -- step program, stepping over subroutine calls
s, step                                     -- step program until it reaches a different source line
finish                                      -- execute program until selected stack frame returns
stepi                                       -- step one instruction
u, until <file:line>|<function>             -- run until a location is reached in the current frame
return                                      -- pop the selected frame without executing the rest of it
interrupt                                   -- stop the running program
b, break <addr>|<file:line>|<function>      -- set a breakpoint
enable|disable|delete <number>              -- manage breakpoints
info breakpoints|threads|watch|frame|registers
watch[!] <expression>                       -- add a watch expression
unwatch|expand|collapse <id>                -- manage the inspection tree
format <format> <type>                      -- set the display format of a type
p, print[!] <expression>                    -- evaluate an expression once
locals                                      -- show local variables of the selected frame
bt, backtrace <>|all                        -- print backtrace of the current thread or of all threads
thread <>|<number>                          -- show threads or switch the current one
f, frame <>|<number>                        -- show the selected frame or select another one
x, memory <addr> <>|<length>                -- dump debuggee memory
reg, registers                              -- show registers of the selected frame
snapshot save <>|<path>|load <path>         -- save the stopped session, or open a saved one
h, help <>|<command>                        -- show help
q, quit                                     -- exit the debugger
"#;

pub const HELP_BREAK: &str = "\
\x1b[32;1mbreak\x1b[0m
Set a breakpoint at a location.

Locations:
break <file>:<line>    - source line, a line without code moves to the next line with code
break <function>       - function entry
break <addr>           - instruction address, hexadecimal with `0x` prefix

Modifiers (after the location, in this order):
ignore <count>         - skip the first <count> hits
if <condition>         - stop only when the condition holds (not every backend supports it)

Breakpoints set before `run` are installed when the program starts. Breakpoints in code that is
not loaded yet stay pending and are installed once a module containing it is loaded.

Examples of usage:
break main.c:42
b compute ignore 3
b main.c:10 if i > 5
";

pub const HELP_WATCH: &str = "\
\x1b[32;1mwatch\x1b[0m
Add an expression to the inspection tree, it is evaluated at every stop.

Expressions that look like they have side effects (assignments, increments, calls) are refused,
use `watch!` to evaluate them anyway.

Related commands:
info watch             - show the inspection tree
unwatch <id>           - remove a watch, <id> is shown in brackets after each item
expand <id>            - show children of an item
collapse <id>          - hide children of an item
format <format> <type> - show values of <type> as dec, hex, oct, bin or raw, strings as latin1,
                         utf8, utf16 or ucs4; `format reset <type>` drops the format
";

pub const HELP_RUN: &str = "\
\x1b[32;1mrun\x1b[0m
Start the program. If it runs already or the session is over, a new session is created, the
breakpoints and watches of the old one are carried over.
";

pub const HELP_UNTIL: &str = "\
\x1b[32;1muntil\x1b[0m
Run until a source line or a function entry is reached.

Examples of usage:
until main.c:60
u compute
";

pub const HELP_SNAPSHOT: &str = "\
\x1b[32;1msnapshot\x1b[0m
Save the stopped session into a file: threads, frames, registers, the inspection tree and the
memory read so far. A saved snapshot is opened as a session that can be inspected but not resumed.

Available subcomands:
snapshot save          - save into the configured snapshot directory
snapshot save <path>   - save into a file
snapshot load <path>   - open a snapshot, the current program is terminated
";

pub const HELP_MEMORY: &str = "\
\x1b[32;1mmemory\x1b[0m
Dump debuggee memory as hexadecimal bytes.

Examples of usage:
memory 0x7ffe1000      - 64 bytes at address
x 0x7ffe1000 16        - 16 bytes at address
";

pub fn help_for_command(command: Option<&str>) -> &'static str {
    match command {
        None => HELP,
        Some(parser::BREAK_COMMAND) | Some(parser::BREAK_COMMAND_SHORT) => HELP_BREAK,
        Some(parser::WATCH_COMMAND) | Some(parser::UNWATCH_COMMAND) => HELP_WATCH,
        Some(parser::RUN_COMMAND) | Some(parser::RUN_COMMAND_SHORT) => HELP_RUN,
        Some(parser::UNTIL_COMMAND) | Some(parser::UNTIL_COMMAND_SHORT) => HELP_UNTIL,
        Some(parser::SNAPSHOT_COMMAND) => HELP_SNAPSHOT,
        Some(parser::MEMORY_COMMAND) | Some(parser::MEMORY_COMMAND_SHORT) => HELP_MEMORY,
        _ => "unknown command",
    }
}
