//! GDB machine interface (MI2) output records.
//!
//! ```text
//! record  = [token] ("^" | "*" | "+" | "=") class ("," result)*
//!         | ("~" | "@" | "&") c-string
//!         | "(gdb)"
//! result  = name "=" value
//! value   = c-string | "{" results "}" | "[" (values | results) "]"
//! ```
use crate::debugger::error::Error;
use chumsky::prelude::*;
use chumsky::Parser;
use std::fmt::Write;

/// MI value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Const(String),
    Tuple(Tuple),
    /// List of values or of results, result names are dropped (`stack=[frame={..},frame={..}]`).
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Const(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&Tuple> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> &[Value] {
        match self {
            Value::List(l) => l,
            _ => &[],
        }
    }
}

/// Ordered `name=value` pairs, names may repeat.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tuple(pub Vec<(String, Value)>);

impl Tuple {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn tuple(&self, name: &str) -> Option<&Tuple> {
        self.get(name).and_then(Value::as_tuple)
    }

    pub fn list(&self, name: &str) -> &[Value] {
        self.get(name).map(Value::as_list).unwrap_or_default()
    }

    pub fn u64(&self, name: &str) -> Option<u64> {
        self.str(name).and_then(parse_u64)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AsyncKind {
    /// `*`
    Exec,
    /// `+`
    Status,
    /// `=`
    Notify,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamKind {
    /// `~`
    Console,
    /// `@`
    Target,
    /// `&`
    Log,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Result {
        token: Option<u64>,
        class: ResultClass,
        results: Tuple,
    },
    Async {
        token: Option<u64>,
        kind: AsyncKind,
        class: String,
        results: Tuple,
    },
    Stream {
        kind: StreamKind,
        text: String,
    },
    Prompt,
}

/// Decimal or `0x` prefixed hexadecimal number.
pub fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Quote `s` as an MI c-string argument.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\{:03o}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

type Err<'a> = extra::Err<Rich<'a, char>>;

fn name<'a>() -> impl Parser<'a, &'a str, String, Err<'a>> + Clone {
    any()
        .filter(|c: &char| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .repeated()
        .at_least(1)
        .to_slice()
        .map(|s: &str| s.to_string())
        .labelled("name")
}

/// Quoted string with C escapes, octal escapes are raw bytes of a UTF-8 sequence.
fn c_string<'a>() -> impl Parser<'a, &'a str, String, Err<'a>> + Clone {
    let octal = any()
        .filter(|c: &char| c.is_digit(8))
        .repeated()
        .at_least(1)
        .at_most(3)
        .to_slice()
        .map(|s: &str| u32::from_str_radix(s, 8).map_or(0, |v| v as u8));
    let named = choice((
        just('n').to(b'\n'),
        just('t').to(b'\t'),
        just('r').to(b'\r'),
        just('e').to(0x1b),
        just('a').to(0x07),
        just('b').to(0x08),
        just('f').to(0x0c),
        just('v').to(0x0b),
    ));
    let escape = just('\\').ignore_then(
        octal
            .or(named)
            .map(|b| vec![b])
            .or(any().map(|c: char| c.to_string().into_bytes())),
    );

    none_of("\"\\")
        .map(|c: char| c.to_string().into_bytes())
        .or(escape)
        .repeated()
        .collect::<Vec<_>>()
        .delimited_by(just('"'), just('"'))
        .map(|parts| String::from_utf8_lossy(&parts.concat()).into_owned())
        .labelled("c-string")
}

fn value<'a>() -> impl Parser<'a, &'a str, Value, Err<'a>> + Clone {
    recursive(|value| {
        let result = name().then_ignore(just('=')).then(value.clone());

        let tuple = result
            .clone()
            .separated_by(just(','))
            .collect::<Vec<_>>()
            .delimited_by(just('{'), just('}'))
            .map(|results| Value::Tuple(Tuple(results)));

        let list = value
            .or(result.map(|(_, v)| v))
            .separated_by(just(','))
            .collect::<Vec<_>>()
            .delimited_by(just('['), just(']'))
            .map(Value::List);

        choice((c_string().map(Value::Const), tuple, list)).labelled("value")
    })
}

/// Trailing `,name=value` pairs of a result or async record.
fn tail<'a>() -> impl Parser<'a, &'a str, Tuple, Err<'a>> + Clone {
    just(',')
        .ignore_then(name().then_ignore(just('=')).then(value()))
        .repeated()
        .collect::<Vec<_>>()
        .map(Tuple)
}

fn record_parser<'a>() -> impl Parser<'a, &'a str, Record, Err<'a>> {
    let token = text::digits(10)
        .to_slice()
        .try_map(|s: &str, span| {
            s.parse::<u64>()
                .map_err(|e| Rich::custom(span, e.to_string()))
        })
        .or_not();

    let prompt = just("(gdb)")
        .then_ignore(text::whitespace())
        .to(Record::Prompt);

    let stream = choice((
        just('~').to(StreamKind::Console),
        just('@').to(StreamKind::Target),
        just('&').to(StreamKind::Log),
    ))
    .then(c_string())
    .map(|(kind, text)| Record::Stream { kind, text });

    let result_class = name().try_map(|class: String, span| match class.as_str() {
        "done" => Ok(ResultClass::Done),
        "running" => Ok(ResultClass::Running),
        "connected" => Ok(ResultClass::Connected),
        "error" => Ok(ResultClass::Error),
        "exit" => Ok(ResultClass::Exit),
        other => Err(Rich::custom(span, format!("unknown result class `{other}`"))),
    });
    let result = token
        .clone()
        .then_ignore(just('^'))
        .then(result_class)
        .then(tail())
        .map(|((token, class), results)| Record::Result {
            token,
            class,
            results,
        });

    let asynchronous = token
        .then(choice((
            just('*').to(AsyncKind::Exec),
            just('+').to(AsyncKind::Status),
            just('=').to(AsyncKind::Notify),
        )))
        .then(name())
        .then(tail())
        .map(|(((token, kind), class), results)| Record::Async {
            token,
            kind,
            class,
            results,
        });

    choice((prompt, stream, result, asynchronous)).then_ignore(end())
}

/// Parse one output line (without the line terminator).
pub fn parse_record(line: &str) -> Result<Record, Error> {
    let line = line.trim_end_matches(['\r', '\n']);
    record_parser()
        .parse(line)
        .into_result()
        .map_err(|errs| {
            let reasons: Vec<_> = errs.iter().map(ToString::to_string).collect();
            Error::MiParsing(format!("`{line}`: {}", reasons.join("; ")))
        })
}
