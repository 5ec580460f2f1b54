use crate::ui::command::parser::{
    BACKTRACE_ALL_SUBCOMMAND, BACKTRACE_COMMAND, BACKTRACE_COMMAND_SHORT, BREAK_COMMAND,
    BREAK_COMMAND_SHORT, COLLAPSE_COMMAND, CONTINUE_COMMAND, CONTINUE_COMMAND_SHORT,
    DELETE_COMMAND, DELETE_COMMAND_SHORT, DISABLE_COMMAND, ENABLE_COMMAND, EXPAND_COMMAND,
    FORMAT_COMMAND, FORMAT_RESET_KEY, FRAME_COMMAND, FRAME_COMMAND_SHORT, HELP_COMMAND,
    HELP_COMMAND_SHORT, INFO_BREAKPOINTS_SUBCOMMAND, INFO_COMMAND, INFO_FRAME_SUBCOMMAND,
    INFO_REGISTERS_SUBCOMMAND, INFO_THREADS_SUBCOMMAND, INFO_WATCH_SUBCOMMAND, INTERRUPT_COMMAND,
    LOCALS_COMMAND, MEMORY_COMMAND, MEMORY_COMMAND_SHORT, PRINT_COMMAND, PRINT_COMMAND_SHORT,
    QUIT_COMMAND, QUIT_COMMAND_SHORT, REGISTERS_COMMAND, REGISTERS_COMMAND_SHORT, RETURN_COMMAND,
    RUN_COMMAND, RUN_COMMAND_SHORT, SNAPSHOT_COMMAND, SNAPSHOT_LOAD_SUBCOMMAND,
    SNAPSHOT_SAVE_SUBCOMMAND, START_COMMAND, STEP_INSTRUCTION_COMMAND, STEP_INTO_COMMAND,
    STEP_INTO_COMMAND_SHORT, STEP_OUT_COMMAND, STEP_OVER_COMMAND, STEP_OVER_COMMAND_SHORT,
    THREAD_COMMAND, UNTIL_COMMAND, UNTIL_COMMAND_SHORT, UNWATCH_COMMAND, WATCH_COMMAND,
};
use chumsky::prelude::{any, choice, just};
use chumsky::text::whitespace;
use chumsky::{extra, text, Parser};
use crossterm::style::{Color, Stylize};
use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::HistoryHinter;
use rustyline::history::MemHistory;
use rustyline::line_buffer::LineBuffer;
use rustyline::{Changeset, CompletionType, Config, Context, Editor};
use rustyline_derive::{Helper, Hinter, Validator};
use std::borrow::Cow;
use std::borrow::Cow::{Borrowed, Owned};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct CommandHint {
    short: Option<String>,
    long: String,
    subcommands: Vec<String>,
}

impl CommandHint {
    fn long(&self) -> String {
        self.long.clone()
    }

    fn display_with_short(&self) -> String {
        if let Some(ref short) = self.short {
            if self.long.starts_with(short) {
                format!(
                    "{}{}",
                    short.clone().bold().underlined(),
                    &self.long[short.len()..]
                )
            } else {
                format!("{}|{}", &self.long, short.clone().bold().underlined())
            }
        } else {
            self.long()
        }
    }

    fn with_subcommands(mut self, subcommands: &[&str]) -> Self {
        self.subcommands = subcommands.iter().map(ToString::to_string).collect();
        self
    }
}

impl From<&str> for CommandHint {
    fn from(value: &str) -> Self {
        CommandHint {
            short: None,
            long: value.to_string(),
            subcommands: vec![],
        }
    }
}

impl From<(&str, &str)> for CommandHint {
    fn from((short, long): (&str, &str)) -> Self {
        CommandHint {
            short: Some(short.to_string()),
            long: long.to_string(),
            subcommands: vec![],
        }
    }
}

pub struct CommandCompleter {
    commands: Vec<CommandHint>,
    subcommand_hints: HashMap<String, Vec<String>>,
    /// Names of inspection tree roots, refreshed at stops.
    expression_hints: Vec<String>,
}

impl CommandCompleter {
    fn new(commands: impl IntoIterator<Item = CommandHint>) -> Self {
        let commands: Vec<CommandHint> = commands.into_iter().collect();
        let subcommand_hints = commands
            .iter()
            .flat_map(|cmd| {
                let mut hints = vec![(cmd.long.clone(), cmd.subcommands.clone())];
                if let Some(ref short) = cmd.short {
                    hints.push((short.clone(), cmd.subcommands.clone()));
                }
                hints
            })
            .filter(|(_, subcommands)| !subcommands.is_empty())
            .collect::<HashMap<String, Vec<String>>>();

        Self {
            commands,
            subcommand_hints,
            expression_hints: vec![],
        }
    }

    pub fn replace_expression_hints(&mut self, names: impl IntoIterator<Item = String>) {
        self.expression_hints = names.into_iter().collect();
        self.expression_hints.sort();
        self.expression_hints.dedup();
    }
}

#[derive(Debug, PartialEq)]
enum CompletableCommand<'a> {
    Expression(&'a str),
    Unrecognized(&'a str, Option<&'a str>),
}

impl<'a> CompletableCommand<'a> {
    fn recognize(line: &'a str) -> Option<CompletableCommand<'a>> {
        let op = just::<_, _, extra::Default>;

        let expression = choice((
            op(PRINT_COMMAND),
            op(PRINT_COMMAND_SHORT),
            op(WATCH_COMMAND),
        ))
        .then(just('!').or_not())
        .then(whitespace().at_least(1))
        .ignore_then(any().repeated().to_slice())
        .map(CompletableCommand::Expression);

        let other = text::ident()
            .then_ignore(whitespace().at_least(1))
            .then(text::ident().or_not())
            .map(|(s1, s2): (&str, Option<&str>)| CompletableCommand::Unrecognized(s1.trim(), s2))
            .padded();

        let r = choice((expression, other)).parse(line);
        r.into_result().ok()
    }
}

impl Completer for CommandCompleter {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        _pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Self::Candidate>)> {
        match CompletableCommand::recognize(line) {
            Some(CompletableCommand::Expression(maybe_expr)) => {
                let pos = line.len() - maybe_expr.len();
                let pairs = self
                    .expression_hints
                    .iter()
                    .filter(|name| name.starts_with(maybe_expr))
                    .map(|name| Pair {
                        display: name.clone(),
                        replacement: name.clone(),
                    })
                    .collect();
                return Ok((pos, pairs));
            }
            Some(CompletableCommand::Unrecognized(cmd, mb_subcmd_part)) => {
                if let Some(subcommands) = self.subcommand_hints.get(cmd) {
                    let pos = cmd.len() + 1;
                    let subcmd_part = mb_subcmd_part.unwrap_or_default();
                    let subcommands = subcommands
                        .iter()
                        .filter(|&subcmd| subcmd.starts_with(subcmd_part))
                        .map(|subcmd| Pair {
                            display: subcmd.to_string(),
                            replacement: subcmd.to_string(),
                        })
                        .collect();

                    return Ok((pos, subcommands));
                }
            }
            None => {}
        }

        let pairs = self
            .commands
            .iter()
            .filter(|&cmd| cmd.long.starts_with(line))
            .map(|cmd| Pair {
                display: cmd.display_with_short(),
                replacement: cmd.long(),
            })
            .collect();
        Ok((0, pairs))
    }
}

#[derive(Helper, Hinter, Validator)]
pub struct RLHelper {
    pub completer: Arc<Mutex<CommandCompleter>>,
    #[rustyline(Hinter)]
    hinter: HistoryHinter,
    pub colored_prompt: String,
}

impl Completer for RLHelper {
    type Candidate = <CommandCompleter as Completer>::Candidate;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Self::Candidate>)> {
        self.completer.lock().unwrap().complete(line, pos, ctx)
    }

    fn update(&self, line: &mut LineBuffer, start: usize, elected: &str, cl: &mut Changeset) {
        self.completer
            .lock()
            .unwrap()
            .update(line, start, elected, cl)
    }
}

impl Highlighter for RLHelper {
    fn highlight_prompt<'b, 's: 'b, 'p: 'b>(
        &'s self,
        prompt: &'p str,
        default: bool,
    ) -> Cow<'b, str> {
        if default {
            Borrowed(&self.colored_prompt)
        } else {
            Borrowed(prompt)
        }
    }

    fn highlight_hint<'h>(&self, hint: &'h str) -> Cow<'h, str> {
        Owned(format!("{}", hint.with(Color::Grey)))
    }
}

fn command_hints() -> Vec<CommandHint> {
    vec![
        (RUN_COMMAND_SHORT, RUN_COMMAND).into(),
        START_COMMAND.into(),
        (CONTINUE_COMMAND_SHORT, CONTINUE_COMMAND).into(),
        (STEP_OVER_COMMAND_SHORT, STEP_OVER_COMMAND).into(),
        (STEP_INTO_COMMAND_SHORT, STEP_INTO_COMMAND).into(),
        STEP_OUT_COMMAND.into(),
        STEP_INSTRUCTION_COMMAND.into(),
        (UNTIL_COMMAND_SHORT, UNTIL_COMMAND).into(),
        RETURN_COMMAND.into(),
        INTERRUPT_COMMAND.into(),
        (BREAK_COMMAND_SHORT, BREAK_COMMAND).into(),
        ENABLE_COMMAND.into(),
        DISABLE_COMMAND.into(),
        (DELETE_COMMAND_SHORT, DELETE_COMMAND).into(),
        CommandHint::from(INFO_COMMAND).with_subcommands(&[
            INFO_BREAKPOINTS_SUBCOMMAND,
            INFO_THREADS_SUBCOMMAND,
            INFO_WATCH_SUBCOMMAND,
            INFO_FRAME_SUBCOMMAND,
            INFO_REGISTERS_SUBCOMMAND,
        ]),
        WATCH_COMMAND.into(),
        UNWATCH_COMMAND.into(),
        EXPAND_COMMAND.into(),
        COLLAPSE_COMMAND.into(),
        CommandHint::from(FORMAT_COMMAND).with_subcommands(&[
            "dec",
            "hex",
            "oct",
            "bin",
            "raw",
            "latin1",
            "utf8",
            "utf16",
            "ucs4",
            FORMAT_RESET_KEY,
        ]),
        (PRINT_COMMAND_SHORT, PRINT_COMMAND).into(),
        LOCALS_COMMAND.into(),
        CommandHint::from((BACKTRACE_COMMAND_SHORT, BACKTRACE_COMMAND))
            .with_subcommands(&[BACKTRACE_ALL_SUBCOMMAND]),
        THREAD_COMMAND.into(),
        (FRAME_COMMAND_SHORT, FRAME_COMMAND).into(),
        (MEMORY_COMMAND_SHORT, MEMORY_COMMAND).into(),
        (REGISTERS_COMMAND_SHORT, REGISTERS_COMMAND).into(),
        CommandHint::from(SNAPSHOT_COMMAND)
            .with_subcommands(&[SNAPSHOT_SAVE_SUBCOMMAND, SNAPSHOT_LOAD_SUBCOMMAND]),
        (HELP_COMMAND_SHORT, HELP_COMMAND).into(),
        (QUIT_COMMAND_SHORT, QUIT_COMMAND).into(),
    ]
}

pub fn create_editor(promt: &str) -> anyhow::Result<Editor<RLHelper, MemHistory>> {
    let config = Config::builder()
        .history_ignore_space(true)
        .completion_type(CompletionType::List)
        .build();

    let h = RLHelper {
        completer: Arc::new(Mutex::new(CommandCompleter::new(command_hints()))),
        hinter: HistoryHinter {},
        colored_prompt: format!("{}", promt.with(Color::DarkGreen)),
    };

    let mut editor = Editor::with_history(config, MemHistory::new())?;
    editor.set_helper(Some(h));

    Ok(editor)
}
