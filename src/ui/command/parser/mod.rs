use super::{BreakpointCommand, Command, CommandError, CommandResult, SnapshotCommand, WatchCommand};
use crate::debugger::command::{ResumeCommand, StepKind};
use crate::debugger::variable::format::FormatHint;
use crate::debugger::{BreakpointId, BreakpointRequest, ThreadId};
use chumsky::error::Rich;
use chumsky::prelude::{any, choice, end, just};
use chumsky::{extra, text, Boxed, Parser};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

pub const RUN_COMMAND: &str = "run";
pub const RUN_COMMAND_SHORT: &str = "r";
pub const START_COMMAND: &str = "start";
pub const CONTINUE_COMMAND: &str = "continue";
pub const CONTINUE_COMMAND_SHORT: &str = "c";
pub const STEP_OVER_COMMAND: &str = "next";
pub const STEP_OVER_COMMAND_SHORT: &str = "n";
pub const STEP_INTO_COMMAND: &str = "step";
pub const STEP_INTO_COMMAND_SHORT: &str = "s";
pub const STEP_OUT_COMMAND: &str = "finish";
pub const STEP_INSTRUCTION_COMMAND: &str = "stepi";
pub const UNTIL_COMMAND: &str = "until";
pub const UNTIL_COMMAND_SHORT: &str = "u";
pub const RETURN_COMMAND: &str = "return";
pub const INTERRUPT_COMMAND: &str = "interrupt";
pub const BREAK_COMMAND: &str = "break";
pub const BREAK_COMMAND_SHORT: &str = "b";
pub const BREAK_IGNORE_KEY: &str = "ignore";
pub const BREAK_CONDITION_KEY: &str = "if";
pub const ENABLE_COMMAND: &str = "enable";
pub const DISABLE_COMMAND: &str = "disable";
pub const DELETE_COMMAND: &str = "delete";
pub const DELETE_COMMAND_SHORT: &str = "d";
pub const INFO_COMMAND: &str = "info";
pub const INFO_BREAKPOINTS_SUBCOMMAND: &str = "breakpoints";
pub const INFO_BREAKPOINTS_SUBCOMMAND_SHORT: &str = "b";
pub const INFO_THREADS_SUBCOMMAND: &str = "threads";
pub const INFO_WATCH_SUBCOMMAND: &str = "watch";
pub const INFO_FRAME_SUBCOMMAND: &str = "frame";
pub const INFO_REGISTERS_SUBCOMMAND: &str = "registers";
pub const WATCH_COMMAND: &str = "watch";
pub const UNWATCH_COMMAND: &str = "unwatch";
pub const EXPAND_COMMAND: &str = "expand";
pub const COLLAPSE_COMMAND: &str = "collapse";
pub const FORMAT_COMMAND: &str = "format";
pub const FORMAT_RESET_KEY: &str = "reset";
pub const PRINT_COMMAND: &str = "print";
pub const PRINT_COMMAND_SHORT: &str = "p";
pub const LOCALS_COMMAND: &str = "locals";
pub const BACKTRACE_COMMAND: &str = "backtrace";
pub const BACKTRACE_COMMAND_SHORT: &str = "bt";
pub const BACKTRACE_ALL_SUBCOMMAND: &str = "all";
pub const THREAD_COMMAND: &str = "thread";
pub const FRAME_COMMAND: &str = "frame";
pub const FRAME_COMMAND_SHORT: &str = "f";
pub const MEMORY_COMMAND: &str = "memory";
pub const MEMORY_COMMAND_SHORT: &str = "x";
pub const REGISTERS_COMMAND: &str = "registers";
pub const REGISTERS_COMMAND_SHORT: &str = "reg";
pub const SNAPSHOT_COMMAND: &str = "snapshot";
pub const SNAPSHOT_SAVE_SUBCOMMAND: &str = "save";
pub const SNAPSHOT_LOAD_SUBCOMMAND: &str = "load";
pub const HELP_COMMAND: &str = "help";
pub const HELP_COMMAND_SHORT: &str = "h";
pub const QUIT_COMMAND: &str = "quit";
pub const QUIT_COMMAND_SHORT: &str = "q";

/// Bytes shown by `memory` when no length is given.
pub const DEFAULT_MEMORY_LEN: usize = 64;

type Err<'a> = extra::Err<Rich<'a, char>>;

pub fn hex<'a>() -> impl Parser<'a, &'a str, u64, Err<'a>> + Clone {
    let prefix = just("0x").or(just("0X"));
    prefix
        .ignore_then(
            text::digits(16)
                .at_least(1)
                .to_slice()
                .try_map(|s: &str, span| {
                    u64::from_str_radix(s, 16).map_err(|e| Rich::custom(span, e))
                }),
        )
        .padded()
        .labelled("hexadecimal number")
}

pub fn number<'a, T>() -> impl Parser<'a, &'a str, T, Err<'a>> + Clone
where
    T: FromStr,
    T::Err: Display,
{
    text::int(10)
        .try_map(|s: &str, span| s.parse::<T>().map_err(|e| Rich::custom(span, e)))
        .padded()
        .labelled("number")
}

/// Anything up to the next whitespace.
fn token<'a>() -> impl Parser<'a, &'a str, &'a str, Err<'a>> + Clone {
    any()
        .filter(|c: &char| !c.is_whitespace())
        .repeated()
        .at_least(1)
        .to_slice()
        .padded()
}

/// The rest of the line, trimmed.
fn rest<'a>() -> impl Parser<'a, &'a str, String, Err<'a>> + Clone {
    any()
        .repeated()
        .at_least(1)
        .to_slice()
        .map(|s: &str| s.trim().to_string())
        .labelled("expression")
}

pub fn location<'a>() -> impl Parser<'a, &'a str, BreakpointRequest, Err<'a>> + Clone {
    let address = hex().map(BreakpointRequest::Address);

    let line = any()
        .filter(|c: &char| *c != ':' && !c.is_whitespace())
        .repeated()
        .at_least(1)
        .to_slice()
        .then_ignore(just(':'))
        .then(number::<u64>())
        .map(|(file, line): (&str, u64)| BreakpointRequest::Line {
            file: PathBuf::from(file),
            line,
        });

    let function = token().map(|name: &str| BreakpointRequest::Function(name.to_string()));

    choice((address, line, function))
        .padded()
        .labelled("location")
}

fn command<'a, I>(ctx: &'static str, inner: I) -> Boxed<'a, 'a, &'a str, Command, Err<'a>>
where
    I: Parser<'a, &'a str, Command, Err<'a>> + 'a,
{
    inner.then_ignore(end()).labelled(ctx).boxed()
}

impl Command {
    /// Parse input string into command.
    pub fn parse(input: &str) -> CommandResult<Command> {
        Self::parser()
            .parse(input)
            .into_result()
            .map_err(|e| {
                CommandError::Parsing(e.first().map(ToString::to_string).unwrap_or_default())
            })
    }

    fn parser<'a>() -> impl Parser<'a, &'a str, Command, Err<'a>> {
        let op = |sym| just(sym).padded();
        let op2 = |full, short| op(full).or(op(short));
        // keyword that takes arguments, `b` must not match the head of `bt`
        let word = |sym| just(sym).then_ignore(text::whitespace().at_least(1)).padded();
        let word2 = |full, short| word(full).or(word(short));
        // keyword with an optional `!`, which forces evaluation of expressions with side effects
        let forced = |sym| {
            just(sym)
                .ignore_then(just('!').or_not().map(|bang| bang.is_some()))
                .then_ignore(text::whitespace().at_least(1))
                .padded()
        };
        let breakpoint_id = || number::<u32>().map(BreakpointId);

        let run = choice((op(RUN_COMMAND), op(RUN_COMMAND_SHORT), op(START_COMMAND)))
            .to(Command::Run)
            .boxed();

        let r#continue = op2(CONTINUE_COMMAND, CONTINUE_COMMAND_SHORT)
            .to(Command::Resume(ResumeCommand::Continue));
        let step_over = op2(STEP_OVER_COMMAND, STEP_OVER_COMMAND_SHORT)
            .to(Command::Resume(ResumeCommand::Step(StepKind::Over)));
        let step_into = op2(STEP_INTO_COMMAND, STEP_INTO_COMMAND_SHORT)
            .to(Command::Resume(ResumeCommand::Step(StepKind::Into)));
        let step_out =
            op(STEP_OUT_COMMAND).to(Command::Resume(ResumeCommand::Step(StepKind::Out)));
        let stepi = op(STEP_INSTRUCTION_COMMAND)
            .to(Command::Resume(ResumeCommand::Step(StepKind::Instruction)));
        let r#return = op(RETURN_COMMAND).to(Command::Resume(ResumeCommand::ReturnFromFrame));
        let interrupt = op(INTERRUPT_COMMAND).to(Command::Interrupt);

        let until = word2(UNTIL_COMMAND, UNTIL_COMMAND_SHORT)
            .ignore_then(location().try_map(|request, span| match request {
                BreakpointRequest::Line { file, line } => {
                    Ok(Command::Resume(ResumeCommand::RunToLine { file, line }))
                }
                BreakpointRequest::Function(function) => {
                    Ok(Command::Resume(ResumeCommand::RunToFunction(function)))
                }
                BreakpointRequest::Address(_) => {
                    Err(Rich::custom(span, "expect a source line or a function"))
                }
            }))
            .boxed();

        let r#break = word2(BREAK_COMMAND, BREAK_COMMAND_SHORT)
            .ignore_then(location())
            .then(op(BREAK_IGNORE_KEY).ignore_then(number::<u32>()).or_not())
            .then(op(BREAK_CONDITION_KEY).ignore_then(rest()).or_not())
            .map(|((request, ignore_count), condition)| {
                Command::Breakpoint(BreakpointCommand::Add {
                    request,
                    condition,
                    ignore_count: ignore_count.unwrap_or_default(),
                })
            })
            .boxed();

        let enable = word(ENABLE_COMMAND)
            .ignore_then(breakpoint_id())
            .map(|id| Command::Breakpoint(BreakpointCommand::Enable(id)));
        let disable = word(DISABLE_COMMAND)
            .ignore_then(breakpoint_id())
            .map(|id| Command::Breakpoint(BreakpointCommand::Disable(id)));
        let delete = word2(DELETE_COMMAND, DELETE_COMMAND_SHORT)
            .ignore_then(breakpoint_id())
            .map(|id| Command::Breakpoint(BreakpointCommand::Delete(id)));

        let info = op(INFO_COMMAND)
            .ignore_then(choice((
                op2(INFO_BREAKPOINTS_SUBCOMMAND, INFO_BREAKPOINTS_SUBCOMMAND_SHORT)
                    .to(Command::Breakpoint(BreakpointCommand::Info)),
                op(INFO_THREADS_SUBCOMMAND).to(Command::Thread(None)),
                op(INFO_WATCH_SUBCOMMAND).to(Command::Watch(WatchCommand::Info)),
                op(INFO_FRAME_SUBCOMMAND).to(Command::Frame(None)),
                op(INFO_REGISTERS_SUBCOMMAND).to(Command::Registers),
            )))
            .boxed();

        let watch = forced(WATCH_COMMAND)
            .then(rest())
            .map(|(force, expression)| Command::Watch(WatchCommand::Add { expression, force }))
            .boxed();
        let unwatch = word(UNWATCH_COMMAND)
            .ignore_then(token())
            .map(|id: &str| Command::Watch(WatchCommand::Remove(id.to_string())));
        let expand = word(EXPAND_COMMAND)
            .ignore_then(token())
            .map(|id: &str| Command::Watch(WatchCommand::Expand(id.to_string())));
        let collapse = word(COLLAPSE_COMMAND)
            .ignore_then(token())
            .map(|id: &str| Command::Watch(WatchCommand::Collapse(id.to_string())));

        let hint = token().try_map(|s: &str, span| {
            if s == FORMAT_RESET_KEY {
                return Ok(None);
            }
            FormatHint::from_str(s)
                .map(Some)
                .map_err(|e| Rich::custom(span, e))
        });
        let format = word(FORMAT_COMMAND)
            .ignore_then(hint)
            .then(rest())
            .map(|(hint, type_name)| Command::Watch(WatchCommand::Format { type_name, hint }))
            .boxed();

        let print = forced(PRINT_COMMAND)
            .or(forced(PRINT_COMMAND_SHORT))
            .then(rest())
            .map(|(force, expression)| Command::Print { expression, force })
            .boxed();

        let locals = op(LOCALS_COMMAND).to(Command::Locals);

        let backtrace = op2(BACKTRACE_COMMAND, BACKTRACE_COMMAND_SHORT)
            .ignore_then(op(BACKTRACE_ALL_SUBCOMMAND).or_not())
            .map(|all| Command::Backtrace { all: all.is_some() })
            .boxed();

        let thread = op(THREAD_COMMAND)
            .ignore_then(number::<u64>().or_not())
            .map(|num| Command::Thread(num.map(ThreadId)));

        let frame = op2(FRAME_COMMAND, FRAME_COMMAND_SHORT)
            .ignore_then(number::<u32>().or_not())
            .map(Command::Frame);

        let memory = word2(MEMORY_COMMAND, MEMORY_COMMAND_SHORT)
            .ignore_then(hex())
            .then(number::<usize>().or_not())
            .map(|(address, len)| Command::Memory {
                address,
                len: len.unwrap_or(DEFAULT_MEMORY_LEN),
            })
            .boxed();

        let registers = op2(REGISTERS_COMMAND, REGISTERS_COMMAND_SHORT).to(Command::Registers);

        let snapshot = op(SNAPSHOT_COMMAND)
            .ignore_then(choice((
                op(SNAPSHOT_SAVE_SUBCOMMAND)
                    .ignore_then(rest().or_not())
                    .map(|path| Command::Snapshot(SnapshotCommand::Save(path.map(PathBuf::from)))),
                op(SNAPSHOT_LOAD_SUBCOMMAND)
                    .ignore_then(rest())
                    .map(|path| Command::Snapshot(SnapshotCommand::Load(PathBuf::from(path)))),
            )))
            .boxed();

        let help = op2(HELP_COMMAND, HELP_COMMAND_SHORT)
            .ignore_then(rest().or_not())
            .map(Command::Help)
            .boxed();

        let quit = op2(QUIT_COMMAND, QUIT_COMMAND_SHORT).to(Command::Quit);

        let execution = choice((
            command(RUN_COMMAND, run),
            command(CONTINUE_COMMAND, r#continue),
            command(STEP_INSTRUCTION_COMMAND, stepi),
            command(STEP_OVER_COMMAND, step_over),
            command(STEP_INTO_COMMAND, step_into),
            command(STEP_OUT_COMMAND, step_out),
            command(UNTIL_COMMAND, until),
            command(RETURN_COMMAND, r#return),
            command(INTERRUPT_COMMAND, interrupt),
        ));

        let breakpoints = choice((
            command(BACKTRACE_COMMAND, backtrace),
            command(BREAK_COMMAND, r#break),
            command(ENABLE_COMMAND, enable),
            command(DISABLE_COMMAND, disable),
            command(DELETE_COMMAND, delete),
            command(INFO_COMMAND, info),
        ));

        let inspection = choice((
            command(WATCH_COMMAND, watch),
            command(UNWATCH_COMMAND, unwatch),
            command(EXPAND_COMMAND, expand),
            command(COLLAPSE_COMMAND, collapse),
            command(FORMAT_COMMAND, format),
            command(PRINT_COMMAND, print),
            command(LOCALS_COMMAND, locals),
            command(THREAD_COMMAND, thread),
            command(FRAME_COMMAND, frame),
            command(MEMORY_COMMAND, memory),
            command(REGISTERS_COMMAND, registers),
        ));

        let other = choice((
            command(SNAPSHOT_COMMAND, snapshot),
            command(HELP_COMMAND, help),
            command(QUIT_COMMAND, quit),
        ));

        choice((execution, breakpoints, inspection, other))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::variable::format::NumericBase;

    #[test]
    fn test_hex() {
        struct TestCase {
            string: &'static str,
            result: Result<u64, ()>,
        }
        let cases = vec![
            TestCase {
                string: "0x123AbcD",
                result: Ok(0x123abcd),
            },
            TestCase {
                string: "0X0",
                result: Ok(0),
            },
            TestCase {
                string: "  0x7ffe0000  ",
                result: Ok(0x7ffe0000),
            },
            TestCase {
                string: "0x",
                result: Err(()),
            },
            TestCase {
                string: "123",
                result: Err(()),
            },
            TestCase {
                string: "0x1ffffffffffffffff",
                result: Err(()),
            },
        ];

        for tc in cases {
            let parsed = hex().then_ignore(end()).parse(tc.string).into_result();
            assert_eq!(parsed.map_err(|_| ()), tc.result, "input: {}", tc.string);
        }
    }

    #[test]
    fn test_location() {
        struct TestCase {
            string: &'static str,
            expected: BreakpointRequest,
        }
        let cases = vec![
            TestCase {
                string: "0x401000",
                expected: BreakpointRequest::Address(0x401000),
            },
            TestCase {
                string: "src/main.c:12",
                expected: BreakpointRequest::Line {
                    file: PathBuf::from("src/main.c"),
                    line: 12,
                },
            },
            TestCase {
                string: " main.mds:3 ",
                expected: BreakpointRequest::Line {
                    file: PathBuf::from("main.mds"),
                    line: 3,
                },
            },
            TestCase {
                string: "main",
                expected: BreakpointRequest::Function("main".to_string()),
            },
            TestCase {
                string: "ns::Type::method",
                expected: BreakpointRequest::Function("ns::Type::method".to_string()),
            },
        ];

        for tc in cases {
            let parsed = location()
                .then_ignore(end())
                .parse(tc.string)
                .into_result()
                .unwrap();
            assert_eq!(parsed, tc.expected, "input: {}", tc.string);
        }
    }

    #[test]
    fn test_parser() {
        struct TestCase {
            inputs: Vec<&'static str>,
            expected: Command,
        }
        let cases = vec![
            TestCase {
                inputs: vec!["run", "r", "start", "  run  "],
                expected: Command::Run,
            },
            TestCase {
                inputs: vec!["continue", "c"],
                expected: Command::Resume(ResumeCommand::Continue),
            },
            TestCase {
                inputs: vec!["next", "n"],
                expected: Command::Resume(ResumeCommand::Step(StepKind::Over)),
            },
            TestCase {
                inputs: vec!["step", "s"],
                expected: Command::Resume(ResumeCommand::Step(StepKind::Into)),
            },
            TestCase {
                inputs: vec!["finish"],
                expected: Command::Resume(ResumeCommand::Step(StepKind::Out)),
            },
            TestCase {
                inputs: vec!["stepi"],
                expected: Command::Resume(ResumeCommand::Step(StepKind::Instruction)),
            },
            TestCase {
                inputs: vec!["until main.c:20", "u main.c:20"],
                expected: Command::Resume(ResumeCommand::RunToLine {
                    file: PathBuf::from("main.c"),
                    line: 20,
                }),
            },
            TestCase {
                inputs: vec!["until compute"],
                expected: Command::Resume(ResumeCommand::RunToFunction("compute".to_string())),
            },
            TestCase {
                inputs: vec!["return"],
                expected: Command::Resume(ResumeCommand::ReturnFromFrame),
            },
            TestCase {
                inputs: vec!["interrupt"],
                expected: Command::Interrupt,
            },
            TestCase {
                inputs: vec!["break main", "b main", "b   main "],
                expected: Command::Breakpoint(BreakpointCommand::Add {
                    request: BreakpointRequest::Function("main".to_string()),
                    condition: None,
                    ignore_count: 0,
                }),
            },
            TestCase {
                inputs: vec!["break main.c:10 ignore 2 if i > 3"],
                expected: Command::Breakpoint(BreakpointCommand::Add {
                    request: BreakpointRequest::Line {
                        file: PathBuf::from("main.c"),
                        line: 10,
                    },
                    condition: Some("i > 3".to_string()),
                    ignore_count: 2,
                }),
            },
            TestCase {
                inputs: vec!["b 0x1000 if x == 1"],
                expected: Command::Breakpoint(BreakpointCommand::Add {
                    request: BreakpointRequest::Address(0x1000),
                    condition: Some("x == 1".to_string()),
                    ignore_count: 0,
                }),
            },
            TestCase {
                inputs: vec!["enable 2"],
                expected: Command::Breakpoint(BreakpointCommand::Enable(BreakpointId(2))),
            },
            TestCase {
                inputs: vec!["disable 3"],
                expected: Command::Breakpoint(BreakpointCommand::Disable(BreakpointId(3))),
            },
            TestCase {
                inputs: vec!["delete 1", "d 1"],
                expected: Command::Breakpoint(BreakpointCommand::Delete(BreakpointId(1))),
            },
            TestCase {
                inputs: vec!["info breakpoints", "info b"],
                expected: Command::Breakpoint(BreakpointCommand::Info),
            },
            TestCase {
                inputs: vec!["watch s.items[2]"],
                expected: Command::Watch(WatchCommand::Add {
                    expression: "s.items[2]".to_string(),
                    force: false,
                }),
            },
            TestCase {
                inputs: vec!["watch! next_id()"],
                expected: Command::Watch(WatchCommand::Add {
                    expression: "next_id()".to_string(),
                    force: true,
                }),
            },
            TestCase {
                inputs: vec!["unwatch watch.1"],
                expected: Command::Watch(WatchCommand::Remove("watch.1".to_string())),
            },
            TestCase {
                inputs: vec!["expand local.v"],
                expected: Command::Watch(WatchCommand::Expand("local.v".to_string())),
            },
            TestCase {
                inputs: vec!["collapse local.v"],
                expected: Command::Watch(WatchCommand::Collapse("local.v".to_string())),
            },
            TestCase {
                inputs: vec!["format hex unsigned int"],
                expected: Command::Watch(WatchCommand::Format {
                    type_name: "unsigned int".to_string(),
                    hint: Some(FormatHint::Base(NumericBase::Hex)),
                }),
            },
            TestCase {
                inputs: vec!["format reset int"],
                expected: Command::Watch(WatchCommand::Format {
                    type_name: "int".to_string(),
                    hint: None,
                }),
            },
            TestCase {
                inputs: vec!["info watch"],
                expected: Command::Watch(WatchCommand::Info),
            },
            TestCase {
                inputs: vec!["print a + b", "p a + b"],
                expected: Command::Print {
                    expression: "a + b".to_string(),
                    force: false,
                },
            },
            TestCase {
                inputs: vec!["print! counter++"],
                expected: Command::Print {
                    expression: "counter++".to_string(),
                    force: true,
                },
            },
            TestCase {
                inputs: vec!["locals"],
                expected: Command::Locals,
            },
            TestCase {
                inputs: vec!["bt", "backtrace"],
                expected: Command::Backtrace { all: false },
            },
            TestCase {
                inputs: vec!["bt all"],
                expected: Command::Backtrace { all: true },
            },
            TestCase {
                inputs: vec!["thread", "info threads"],
                expected: Command::Thread(None),
            },
            TestCase {
                inputs: vec!["thread 2"],
                expected: Command::Thread(Some(ThreadId(2))),
            },
            TestCase {
                inputs: vec!["frame", "f", "info frame"],
                expected: Command::Frame(None),
            },
            TestCase {
                inputs: vec!["frame 1", "f 1"],
                expected: Command::Frame(Some(1)),
            },
            TestCase {
                inputs: vec!["memory 0x1000", "x 0x1000"],
                expected: Command::Memory {
                    address: 0x1000,
                    len: DEFAULT_MEMORY_LEN,
                },
            },
            TestCase {
                inputs: vec!["memory 0x1000 16"],
                expected: Command::Memory {
                    address: 0x1000,
                    len: 16,
                },
            },
            TestCase {
                inputs: vec!["registers", "reg", "info registers"],
                expected: Command::Registers,
            },
            TestCase {
                inputs: vec!["snapshot save"],
                expected: Command::Snapshot(SnapshotCommand::Save(None)),
            },
            TestCase {
                inputs: vec!["snapshot save /tmp/a.mdsnap"],
                expected: Command::Snapshot(SnapshotCommand::Save(Some(PathBuf::from(
                    "/tmp/a.mdsnap",
                )))),
            },
            TestCase {
                inputs: vec!["snapshot load a.mdsnap"],
                expected: Command::Snapshot(SnapshotCommand::Load(PathBuf::from("a.mdsnap"))),
            },
            TestCase {
                inputs: vec!["help", "h"],
                expected: Command::Help(None),
            },
            TestCase {
                inputs: vec!["help break"],
                expected: Command::Help(Some("break".to_string())),
            },
            TestCase {
                inputs: vec!["quit", "q"],
                expected: Command::Quit,
            },
        ];

        for tc in cases {
            for input in tc.inputs {
                let parsed = Command::parse(input);
                assert!(parsed.is_ok(), "input `{input}`: {:?}", parsed.err());
                assert_eq!(parsed.unwrap(), tc.expected, "input `{input}`");
            }
        }
    }

    #[test]
    fn test_parser_errors() {
        let inputs = [
            "",
            "runx",
            "break",
            "enable x",
            "until 0x1000",
            "memory 1000",
            "format bogus int",
            "watch",
            "frame -1",
            "snapshot load",
            "thread two",
        ];
        for input in inputs {
            assert!(
                matches!(Command::parse(input), Err(CommandError::Parsing(_))),
                "input `{input}` must be rejected"
            );
        }
    }
}
