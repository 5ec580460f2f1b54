//! Parser of the line oriented script language.
//!
//! Every statement takes exactly one line, blocks are opened by a trailing `{` and closed by a
//! line holding `}` (or `} else {`). Lines without a statement (blank, comments, braces, function
//! headers) carry no code.
use crate::debugger::error::Error;
use chumsky::prelude::*;
use chumsky::Parser;
use indexmap::IndexMap;

type Err<'a> = extra::Err<Rich<'a, char>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Nil,
    Int(i64),
    Bool(bool),
    Str(String),
    Var(String),
    List(Vec<Expr>),
    Record(Vec<(String, Expr)>),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// Statement as written on one line.
#[derive(Clone, Debug, PartialEq)]
enum LineStmt {
    Module(String),
    Fn { name: String, params: Vec<String> },
    Let(String, Expr),
    Assign(String, Expr),
    Print(Expr),
    Return(Option<Expr>),
    If(Expr),
    Else,
    While(Expr),
    Close,
    Spawn(String, Vec<Expr>),
    Load(String),
    Unload(String),
    Poke(Expr, Expr),
    Exit(Expr),
    Expr(Expr),
}

#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
    Let(String, Expr),
    Assign(String, Expr),
    Print(Expr),
    Return(Option<Expr>),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Spawn(String, Vec<Expr>),
    Load(String),
    Unload(String),
    Poke(Expr, Expr),
    Exit(Expr),
    Expr(Expr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stmt {
    pub line: u64,
    pub kind: StmtKind,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    /// Module the function lives in, `None` for the main program.
    pub module: Option<String>,
    /// Line of the `fn` header.
    pub line: u64,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Program {
    pub functions: IndexMap<String, Function>,
}

fn kw<'a>(word: &'static str) -> impl Parser<'a, &'a str, (), Err<'a>> + Clone {
    text::ascii::ident()
        .filter(move |s: &&str| *s == word)
        .ignored()
        .padded()
        .labelled(word)
}

fn ident<'a>() -> impl Parser<'a, &'a str, String, Err<'a>> + Clone {
    text::ascii::ident()
        .map(|s: &str| s.to_string())
        .padded()
        .labelled("identifier")
}

fn string<'a>() -> impl Parser<'a, &'a str, String, Err<'a>> + Clone {
    let escape = just('\\').ignore_then(choice((
        just('n').to('\n'),
        just('t').to('\t'),
        just('0').to('\0'),
        just('\\'),
        just('"'),
    )));
    none_of("\"\\")
        .or(escape)
        .repeated()
        .collect::<String>()
        .delimited_by(just('"'), just('"'))
        .padded()
        .labelled("string")
}

fn integer<'a>() -> impl Parser<'a, &'a str, i64, Err<'a>> + Clone {
    let hex = just("0x")
        .or(just("0X"))
        .ignore_then(text::digits(16).at_least(1).to_slice())
        .try_map(|s: &str, span| {
            i64::from_str_radix(s, 16).map_err(|e| Rich::custom(span, e.to_string()))
        });
    let dec = text::int(10).try_map(|s: &str, span| {
        s.parse::<i64>()
            .map_err(|e| Rich::custom(span, e.to_string()))
    });
    hex.or(dec).padded().labelled("integer")
}

pub fn expr_parser<'a>() -> impl Parser<'a, &'a str, Expr, Err<'a>> + Clone {
    recursive(|expr| {
        let op = |s| just(s).padded();

        let args = expr
            .clone()
            .separated_by(op(","))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(op("("), op(")"));
        let call = ident()
            .then(args)
            .map(|(name, args)| Expr::Call(name, args));

        let list = expr
            .clone()
            .separated_by(op(","))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(op("["), op("]"))
            .map(Expr::List);

        let record = ident()
            .then_ignore(op(":"))
            .then(expr.clone())
            .separated_by(op(","))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(op("{"), op("}"))
            .map(Expr::Record);

        let name = ident().map(|name| match name.as_str() {
            "true" => Expr::Bool(true),
            "false" => Expr::Bool(false),
            "nil" => Expr::Nil,
            _ => Expr::Var(name),
        });

        let atom = choice((
            integer().map(Expr::Int),
            string().map(Expr::Str),
            list,
            record,
            call,
            name,
            expr.clone().delimited_by(op("("), op(")")),
        ))
        .boxed();

        enum Postfix {
            Field(String),
            Index(Expr),
        }
        let postfix = atom.foldl(
            choice((
                op(".").ignore_then(ident()).map(Postfix::Field),
                expr.clone()
                    .delimited_by(op("["), op("]"))
                    .map(Postfix::Index),
            ))
            .repeated(),
            |lhs, p| match p {
                Postfix::Field(name) => Expr::Field(Box::new(lhs), name),
                Postfix::Index(idx) => Expr::Index(Box::new(lhs), Box::new(idx)),
            },
        );

        let unary = choice((op("-").to(UnOp::Neg), op("!").to(UnOp::Not)))
            .repeated()
            .foldr(postfix, |op, rhs| Expr::Unary(op, Box::new(rhs)))
            .boxed();

        let binary = |lhs: chumsky::Boxed<'a, 'a, &'a str, Expr, Err<'a>>,
                      ops: chumsky::Boxed<'a, 'a, &'a str, BinOp, Err<'a>>| {
            lhs.clone()
                .foldl(ops.then(lhs).repeated(), |l, (op, r)| {
                    Expr::Binary(op, Box::new(l), Box::new(r))
                })
                .boxed()
        };

        let product = binary(
            unary,
            choice((
                op("*").to(BinOp::Mul),
                op("/").to(BinOp::Div),
                op("%").to(BinOp::Rem),
            ))
            .boxed(),
        );
        let sum = binary(
            product,
            choice((op("+").to(BinOp::Add), op("-").to(BinOp::Sub))).boxed(),
        );
        let cmp = binary(
            sum,
            choice((
                op("==").to(BinOp::Eq),
                op("!=").to(BinOp::Ne),
                op("<=").to(BinOp::Le),
                op(">=").to(BinOp::Ge),
                op("<").to(BinOp::Lt),
                op(">").to(BinOp::Gt),
            ))
            .boxed(),
        );
        let and = binary(cmp, op("&&").to(BinOp::And).boxed());
        binary(and, op("||").to(BinOp::Or).boxed())
    })
}

fn line_parser<'a>() -> impl Parser<'a, &'a str, LineStmt, Err<'a>> {
    let op = |s| just(s).padded();
    let expr = expr_parser();
    let open = op("{");

    let params = ident()
        .separated_by(op(","))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(op("("), op(")"));
    let args = expr
        .clone()
        .separated_by(op(","))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(op("("), op(")"));

    let module = kw("module")
        .ignore_then(string())
        .then_ignore(open.clone())
        .map(LineStmt::Module);
    let function = kw("fn")
        .ignore_then(ident())
        .then(params)
        .then_ignore(open.clone())
        .map(|(name, params)| LineStmt::Fn { name, params });
    let let_stmt = kw("let")
        .ignore_then(ident())
        .then_ignore(op("="))
        .then(expr.clone())
        .map(|(name, e)| LineStmt::Let(name, e));
    let print = kw("print").ignore_then(expr.clone()).map(LineStmt::Print);
    let ret = kw("return")
        .ignore_then(expr.clone().or_not())
        .map(LineStmt::Return);
    let if_stmt = kw("if")
        .ignore_then(expr.clone())
        .then_ignore(open.clone())
        .map(LineStmt::If);
    let else_stmt = op("}")
        .then(kw("else"))
        .then(open.clone())
        .to(LineStmt::Else);
    let while_stmt = kw("while")
        .ignore_then(expr.clone())
        .then_ignore(open)
        .map(LineStmt::While);
    let close = op("}").to(LineStmt::Close);
    let spawn = kw("spawn")
        .ignore_then(ident())
        .then(args)
        .map(|(name, args)| LineStmt::Spawn(name, args));
    let load = kw("load").ignore_then(string()).map(LineStmt::Load);
    let unload = kw("unload").ignore_then(string()).map(LineStmt::Unload);
    let poke = kw("poke")
        .ignore_then(expr.clone())
        .then_ignore(op(","))
        .then(expr.clone())
        .map(|(addr, data)| LineStmt::Poke(addr, data));
    let exit = kw("exit").ignore_then(expr.clone()).map(LineStmt::Exit);
    let assign = ident()
        .then_ignore(op("="))
        .then(expr.clone())
        .map(|(name, e)| LineStmt::Assign(name, e));

    choice((
        module,
        function,
        let_stmt,
        print,
        ret,
        if_stmt,
        else_stmt,
        while_stmt,
        close,
        spawn,
        load,
        unload,
        poke,
        exit,
        assign,
        expr.map(LineStmt::Expr),
    ))
    .then_ignore(end())
}

/// Cut a `//` comment, string literals are respected.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '\\' if in_string => escaped = !escaped,
            '"' if !escaped => in_string = !in_string,
            '/' if !in_string && line[i..].starts_with("//") => return &line[..i],
            _ => escaped = false,
        }
        if c != '\\' {
            escaped = false;
        }
    }
    line
}

/// Parse a standalone expression (watches, conditions, tooltips).
pub fn parse_expr(input: &str) -> Result<Expr, Error> {
    expr_parser()
        .then_ignore(end())
        .parse(input)
        .into_result()
        .map_err(|e| Error::ScriptParsing(format!("`{input}`: {}", e[0])))
}

struct Lines {
    items: Vec<(u64, LineStmt)>,
    pos: usize,
}

enum BlockEnd {
    Close,
    Else,
}

impl Lines {
    fn next(&mut self) -> Option<(u64, LineStmt)> {
        let item = self.items.get(self.pos).cloned();
        self.pos += 1;
        item
    }

    fn block(&mut self, opened_at: u64) -> Result<(Vec<Stmt>, BlockEnd), Error> {
        let mut stmts = vec![];
        loop {
            let Some((line, stmt)) = self.next() else {
                return Err(Error::ScriptParsing(format!(
                    "block opened at line {opened_at} is not closed"
                )));
            };
            let kind = match stmt {
                LineStmt::Close => return Ok((stmts, BlockEnd::Close)),
                LineStmt::Else => return Ok((stmts, BlockEnd::Else)),
                LineStmt::Module(_) | LineStmt::Fn { .. } => {
                    return Err(Error::ScriptParsing(format!(
                        "line {line}: declarations are only allowed at top level"
                    )))
                }
                LineStmt::If(cond) => {
                    let (then, end) = self.block(line)?;
                    let otherwise = match end {
                        BlockEnd::Close => vec![],
                        BlockEnd::Else => self.closed_block(line)?,
                    };
                    StmtKind::If {
                        cond,
                        then,
                        otherwise,
                    }
                }
                LineStmt::While(cond) => StmtKind::While {
                    cond,
                    body: self.closed_block(line)?,
                },
                LineStmt::Let(name, e) => StmtKind::Let(name, e),
                LineStmt::Assign(name, e) => StmtKind::Assign(name, e),
                LineStmt::Print(e) => StmtKind::Print(e),
                LineStmt::Return(e) => StmtKind::Return(e),
                LineStmt::Spawn(name, args) => StmtKind::Spawn(name, args),
                LineStmt::Load(m) => StmtKind::Load(m),
                LineStmt::Unload(m) => StmtKind::Unload(m),
                LineStmt::Poke(addr, data) => StmtKind::Poke(addr, data),
                LineStmt::Exit(e) => StmtKind::Exit(e),
                LineStmt::Expr(e) => StmtKind::Expr(e),
            };
            stmts.push(Stmt { line, kind });
        }
    }

    fn closed_block(&mut self, opened_at: u64) -> Result<Vec<Stmt>, Error> {
        match self.block(opened_at)? {
            (stmts, BlockEnd::Close) => Ok(stmts),
            (_, BlockEnd::Else) => Err(Error::ScriptParsing(format!(
                "unexpected `else` in block opened at line {opened_at}"
            ))),
        }
    }

    fn function(
        &mut self,
        program: &mut Program,
        line: u64,
        name: String,
        params: Vec<String>,
        module: Option<String>,
    ) -> Result<(), Error> {
        let body = self.closed_block(line)?;
        if program.functions.contains_key(&name) {
            return Err(Error::ScriptParsing(format!(
                "line {line}: function `{name}` is already defined"
            )));
        }
        program.functions.insert(
            name.clone(),
            Function {
                name,
                params,
                module,
                line,
                body,
            },
        );
        Ok(())
    }
}

/// Parse a whole program. A `main` function is required.
pub fn parse_program(source: &str) -> Result<Program, Error> {
    let parser = line_parser();
    let mut items = vec![];
    for (n, raw) in source.lines().enumerate() {
        let line = n as u64 + 1;
        let text = strip_comment(raw).trim();
        if text.is_empty() {
            continue;
        }
        let stmt = parser
            .parse(text)
            .into_result()
            .map_err(|e| Error::ScriptParsing(format!("line {line}: {}", e[0])))?;
        items.push((line, stmt));
    }

    let mut lines = Lines { items, pos: 0 };
    let mut program = Program::default();
    let mut module: Option<(u64, String)> = None;

    while let Some((line, stmt)) = lines.next() {
        match stmt {
            LineStmt::Fn { name, params } => {
                let owner = module.as_ref().map(|(_, m)| m.clone());
                lines.function(&mut program, line, name, params, owner)?;
            }
            LineStmt::Module(name) if module.is_none() => module = Some((line, name)),
            LineStmt::Close if module.is_some() => module = None,
            _ => {
                return Err(Error::ScriptParsing(format!(
                    "line {line}: only functions and modules are allowed at top level"
                )))
            }
        }
    }
    if let Some((line, _)) = module {
        return Err(Error::ScriptParsing(format!(
            "module opened at line {line} is not closed"
        )));
    }
    if !program.functions.contains_key("main") {
        return Err(Error::ScriptParsing("function `main` not found".to_string()));
    }
    Ok(program)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_expr_parsing() {
        struct TestCase {
            string: &'static str,
            expr: Expr,
        }

        let var = |n: &str| Box::new(Expr::Var(n.to_string()));
        let cases = vec![
            TestCase {
                string: "42",
                expr: Expr::Int(42),
            },
            TestCase {
                string: "0x10",
                expr: Expr::Int(16),
            },
            TestCase {
                string: "a + b * 2",
                expr: Expr::Binary(
                    BinOp::Add,
                    var("a"),
                    Box::new(Expr::Binary(BinOp::Mul, var("b"), Box::new(Expr::Int(2)))),
                ),
            },
            TestCase {
                string: "p.x[1]",
                expr: Expr::Index(
                    Box::new(Expr::Field(var("p"), "x".to_string())),
                    Box::new(Expr::Int(1)),
                ),
            },
            TestCase {
                string: "!done && n <= 3",
                expr: Expr::Binary(
                    BinOp::And,
                    Box::new(Expr::Unary(UnOp::Not, var("done"))),
                    Box::new(Expr::Binary(BinOp::Le, var("n"), Box::new(Expr::Int(3)))),
                ),
            },
            TestCase {
                string: "{x: 1, y: \"a\\n\"}",
                expr: Expr::Record(vec![
                    ("x".to_string(), Expr::Int(1)),
                    ("y".to_string(), Expr::Str("a\n".to_string())),
                ]),
            },
            TestCase {
                string: "ptr(\"char*\", 16)",
                expr: Expr::Call(
                    "ptr".to_string(),
                    vec![Expr::Str("char*".to_string()), Expr::Int(16)],
                ),
            },
            TestCase {
                string: "[true, nil]",
                expr: Expr::List(vec![Expr::Bool(true), Expr::Nil]),
            },
        ];

        for tc in cases {
            assert_eq!(parse_expr(tc.string).unwrap(), tc.expr, "{}", tc.string);
        }

        assert!(parse_expr("a +").is_err());
        assert!(parse_expr("x = 1").is_err());
    }

    #[test]
    fn test_program_structure() {
        let source = r#"
// sample
fn add(a, b) {
    return a + b
}

module "libmath" {
    fn square(x) {
        return x * x
    }
}

fn main() {
    let x = 1   // one
    if x == 1 {
        x = add(x, 2)
    } else {
        print "never"
    }
    while x < 10 {
        x = x + 1
    }
    load "libmath"
}
"#;
        let program = parse_program(source).unwrap();
        assert_eq!(program.functions.len(), 3);

        let square = &program.functions["square"];
        assert_eq!(square.module.as_deref(), Some("libmath"));
        assert_eq!(square.line, 8);

        let main = &program.functions["main"];
        assert_eq!(main.line, 13);
        let lines: Vec<u64> = main.body.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![14, 15, 20, 23]);
        match &main.body[1].kind {
            StmtKind::If { then, otherwise, .. } => {
                assert_eq!(then[0].line, 16);
                assert_eq!(otherwise[0].line, 18);
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn test_program_errors() {
        struct TestCase {
            source: &'static str,
            message: &'static str,
        }

        let cases = vec![
            TestCase {
                source: "fn helper() {\n}\n",
                message: "function `main` not found",
            },
            TestCase {
                source: "fn main() {\n let x = 1\n",
                message: "not closed",
            },
            TestCase {
                source: "let x = 1\n",
                message: "line 1: only functions",
            },
            TestCase {
                source: "fn main() {\n let x = \n}\n",
                message: "line 2",
            },
            TestCase {
                source: "fn main() {\n}\nfn main() {\n}\n",
                message: "already defined",
            },
        ];

        for tc in cases {
            match parse_program(tc.source) {
                Err(Error::ScriptParsing(msg)) => assert!(msg.contains(tc.message), "{msg}"),
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    #[test]
    fn test_strip_comment() {
        assert_eq!(strip_comment("let x = 1 // c"), "let x = 1 ");
        assert_eq!(strip_comment("print \"a//b\""), "print \"a//b\"");
        assert_eq!(strip_comment("// only"), "");
    }
}
