//! Script virtual machine: compiled functions, threads with call stacks and a linear memory.
use crate::debugger::backend::script::parser::{BinOp, Expr, Program, Stmt, StmtKind, UnOp};
use crate::debugger::error::Error;
use crate::debugger::location::{Frame, Location};
use crate::debugger::thread::ThreadId;
use crate::debugger::variable::value::{RawValue, Variable};
use indexmap::IndexMap;
use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Address of the first instruction.
pub const CODE_BASE: u64 = 0x40_0000;
pub const INSTR_SIZE: u64 = 4;
pub const MEMORY_SIZE: usize = 0x1_0000;

const BUILTINS: &[&str] = &["ptr", "len", "peek"];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Bool(bool),
    Str(String),
    List(Vec<Value>),
    Record(IndexMap<String, Value>),
    Pointer { kind: String, address: u64 },
}

impl Value {
    pub fn type_name(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Str(_) => "string".to_string(),
            Value::List(_) => "list".to_string(),
            Value::Record(_) => "record".to_string(),
            Value::Pointer { kind, .. } => kind.clone(),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Int(v) => *v != 0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Record(_) => true,
            Value::Pointer { address, .. } => *address != 0,
        }
    }

    /// Text written by `print`.
    pub fn display(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    fn repr(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => format!("{s:?}"),
            Value::List(items) => format!("[{}]", items.iter().map(Value::repr).join(", ")),
            Value::Record(fields) => format!(
                "{{{}}}",
                fields
                    .iter()
                    .map(|(k, v)| format!("{k}: {}", v.repr()))
                    .join(", ")
            ),
            Value::Pointer { address, .. } => format!("{address:#x}"),
        }
    }

    pub fn to_variable(&self, name: &str, expression: &str) -> Variable {
        let raw = match self {
            Value::Nil => RawValue::Text("nil".to_string()),
            Value::Int(v) => RawValue::Int(*v),
            Value::Bool(b) => RawValue::Bool(*b),
            Value::Str(s) => RawValue::Text(format!("{s:?}")),
            Value::List(items) => RawValue::Aggregate {
                summary: Some(format!("[{} items]", items.len())),
                children: Some(items.len()),
            },
            Value::Record(fields) => RawValue::Aggregate {
                summary: None,
                children: Some(fields.len()),
            },
            Value::Pointer { address, .. } => RawValue::Pointer(*address),
        };
        Variable::new(name, expression, self.type_name(), raw)
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Dest {
    name: String,
    declare: bool,
}

#[derive(Clone, Debug, PartialEq)]
enum Op {
    Let(String, Expr),
    Assign(String, Expr),
    Call {
        dest: Option<Dest>,
        function: String,
        args: Vec<Expr>,
    },
    Print(Expr),
    Return(Option<Expr>),
    /// Jump to `otherwise` if the condition is false.
    Branch {
        cond: Expr,
        otherwise: usize,
    },
    Jump(usize),
    Spawn(String, Vec<Expr>),
    Load(String),
    Unload(String),
    Poke(Expr, Expr),
    Exit(Expr),
    Eval(Expr),
}

#[derive(Clone, Debug, PartialEq)]
struct Instr {
    /// Source line, `None` for compiler generated jumps and returns.
    line: Option<u64>,
    op: Op,
}

#[derive(Clone, Debug)]
struct CompiledFn {
    name: String,
    params: Vec<String>,
    module: Option<String>,
    /// Global index of the first instruction.
    base: usize,
    instrs: Vec<Instr>,
}

struct Compiler<'a> {
    functions: &'a HashSet<String>,
    out: Vec<Instr>,
}

impl Compiler<'_> {
    fn user_call<'e>(&self, e: &'e Expr) -> Option<(&'e String, &'e Vec<Expr>)> {
        match e {
            Expr::Call(name, args) if self.functions.contains(name) => Some((name, args)),
            _ => None,
        }
    }

    fn emit(&mut self, line: Option<u64>, op: Op) -> usize {
        self.out.push(Instr { line, op });
        self.out.len() - 1
    }

    fn block(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            let line = Some(stmt.line);
            match &stmt.kind {
                StmtKind::Let(name, e) | StmtKind::Assign(name, e) => {
                    let declare = matches!(stmt.kind, StmtKind::Let(..));
                    let op = match self.user_call(e) {
                        Some((function, args)) => Op::Call {
                            dest: Some(Dest {
                                name: name.clone(),
                                declare,
                            }),
                            function: function.clone(),
                            args: args.clone(),
                        },
                        None if declare => Op::Let(name.clone(), e.clone()),
                        None => Op::Assign(name.clone(), e.clone()),
                    };
                    self.emit(line, op);
                }
                StmtKind::Expr(e) => {
                    let op = match self.user_call(e) {
                        Some((function, args)) => Op::Call {
                            dest: None,
                            function: function.clone(),
                            args: args.clone(),
                        },
                        None => Op::Eval(e.clone()),
                    };
                    self.emit(line, op);
                }
                StmtKind::Print(e) => {
                    self.emit(line, Op::Print(e.clone()));
                }
                StmtKind::Return(e) => {
                    self.emit(line, Op::Return(e.clone()));
                }
                StmtKind::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    let branch = self.emit(
                        line,
                        Op::Branch {
                            cond: cond.clone(),
                            otherwise: 0,
                        },
                    );
                    self.block(then);
                    let skip = (!otherwise.is_empty()).then(|| self.emit(None, Op::Jump(0)));
                    self.patch(branch, self.out.len());
                    self.block(otherwise);
                    if let Some(skip) = skip {
                        self.patch(skip, self.out.len());
                    }
                }
                StmtKind::While { cond, body } => {
                    let start = self.emit(
                        line,
                        Op::Branch {
                            cond: cond.clone(),
                            otherwise: 0,
                        },
                    );
                    self.block(body);
                    self.emit(None, Op::Jump(start));
                    self.patch(start, self.out.len());
                }
                StmtKind::Spawn(name, args) => {
                    self.emit(line, Op::Spawn(name.clone(), args.clone()));
                }
                StmtKind::Load(m) => {
                    self.emit(line, Op::Load(m.clone()));
                }
                StmtKind::Unload(m) => {
                    self.emit(line, Op::Unload(m.clone()));
                }
                StmtKind::Poke(addr, data) => {
                    self.emit(line, Op::Poke(addr.clone(), data.clone()));
                }
                StmtKind::Exit(e) => {
                    self.emit(line, Op::Exit(e.clone()));
                }
            }
        }
    }

    fn patch(&mut self, at: usize, target: usize) {
        match &mut self.out[at].op {
            Op::Branch { otherwise, .. } => *otherwise = target,
            Op::Jump(to) => *to = target,
            _ => {}
        }
    }
}

#[derive(Clone, Debug)]
pub struct CallFrame {
    function: usize,
    pc: usize,
    locals: IndexMap<String, Value>,
    dest: Option<Dest>,
}

#[derive(Clone, Debug)]
pub struct ScriptThread {
    pub id: ThreadId,
    pub label: String,
    stack: Vec<CallFrame>,
}

/// Observable side effect of one executed instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    Output(String),
    ModuleLoaded(String),
    ModuleUnloaded(String),
    ThreadCreated(ThreadId),
    ThreadExited(ThreadId),
    Exited(i32),
}

pub struct Machine {
    file: PathBuf,
    functions: Vec<CompiledFn>,
    by_name: HashMap<String, usize>,
    threads: Vec<ScriptThread>,
    next_thread: u64,
    loaded: HashSet<String>,
    memory: Vec<u8>,
    exit_code: Option<i32>,
}

impl Machine {
    pub fn new(program: &Program, file: impl Into<PathBuf>) -> Result<Self, Error> {
        let names: HashSet<String> = program.functions.keys().cloned().collect();
        let mut functions = vec![];
        let mut by_name = HashMap::new();
        let mut base = 0;

        for (name, function) in &program.functions {
            if is_builtin(name) {
                return Err(Error::ScriptParsing(format!(
                    "line {}: `{name}` is a builtin function",
                    function.line
                )));
            }
            let mut compiler = Compiler {
                functions: &names,
                out: vec![],
            };
            compiler.block(&function.body);
            compiler.emit(None, Op::Return(None));

            by_name.insert(name.clone(), functions.len());
            let len = compiler.out.len();
            functions.push(CompiledFn {
                name: name.clone(),
                params: function.params.clone(),
                module: function.module.clone(),
                base,
                instrs: compiler.out,
            });
            base += len;
        }

        let main = *by_name
            .get("main")
            .ok_or_else(|| Error::ScriptParsing("function `main` not found".to_string()))?;
        let mut machine = Self {
            file: file.into(),
            functions,
            by_name,
            threads: vec![],
            next_thread: 1,
            loaded: HashSet::new(),
            memory: vec![0; MEMORY_SIZE],
            exit_code: None,
        };
        machine.create_thread(main, IndexMap::new());
        Ok(machine)
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn is_finished(&self) -> bool {
        self.exit_code.is_some()
    }

    pub fn threads(&self) -> &[ScriptThread] {
        &self.threads
    }

    pub fn thread_index(&self, id: ThreadId) -> Option<usize> {
        self.threads.iter().position(|t| t.id == id)
    }

    fn create_thread(&mut self, function: usize, locals: IndexMap<String, Value>) -> ThreadId {
        let id = ThreadId(self.next_thread);
        self.next_thread += 1;
        self.threads.push(ScriptThread {
            id,
            label: self.functions[function].name.clone(),
            stack: vec![CallFrame {
                function,
                pc: 0,
                locals,
                dest: None,
            }],
        });
        id
    }

    pub fn depth(&self, thread: usize) -> usize {
        self.threads[thread].stack.len()
    }

    fn instr(&self, function: usize, pc: usize) -> Option<&Instr> {
        self.functions[function].instrs.get(pc)
    }

    fn address(&self, function: usize, pc: usize) -> u64 {
        CODE_BASE + (self.functions[function].base + pc) as u64 * INSTR_SIZE
    }

    /// Address of the next instruction of a thread.
    pub fn pc(&self, thread: usize) -> Option<u64> {
        let frame = self.threads[thread].stack.last()?;
        Some(self.address(frame.function, frame.pc))
    }

    /// Source line of the next instruction of a thread.
    pub fn line(&self, thread: usize) -> Option<u64> {
        let frame = self.threads[thread].stack.last()?;
        self.instr(frame.function, frame.pc)?.line
    }

    /// Name of the function the thread executes.
    pub fn function(&self, thread: usize) -> Option<&str> {
        let frame = self.threads[thread].stack.last()?;
        Some(&self.functions[frame.function].name)
    }

    pub fn is_function_entry(&self, thread: usize) -> bool {
        self.threads[thread]
            .stack
            .last()
            .map(|f| f.pc == 0)
            .unwrap_or(false)
    }

    fn frame(&self, thread: usize, level: u32) -> Result<&CallFrame, Error> {
        let stack = &self.threads[thread].stack;
        let level = level as usize;
        if level >= stack.len() {
            return Err(Error::NotFound(format!("frame #{level}")));
        }
        Ok(&stack[stack.len() - 1 - level])
    }

    fn frame_location(&self, frame: &CallFrame, innermost: bool) -> Location {
        // callers already advanced past their call instruction
        let pc = if innermost {
            frame.pc
        } else {
            frame.pc.saturating_sub(1)
        };
        let function = &self.functions[frame.function];
        Location {
            function: Some(function.name.clone()),
            file: Some(self.file.clone()),
            line: self.instr(frame.function, pc).and_then(|i| i.line),
            address: Some(self.address(frame.function, pc)),
        }
    }

    pub fn location(&self, thread: usize) -> Location {
        self.threads[thread]
            .stack
            .last()
            .map(|f| self.frame_location(f, true))
            .unwrap_or_default()
    }

    pub fn frames(&self, thread: usize) -> Vec<Frame> {
        let stack = &self.threads[thread].stack;
        stack
            .iter()
            .rev()
            .enumerate()
            .map(|(level, f)| Frame {
                level: level as u32,
                location: self.frame_location(f, level == 0),
            })
            .collect()
    }

    pub fn locals(&self, thread: usize, level: u32) -> Result<Vec<Variable>, Error> {
        let frame = self.frame(thread, level)?;
        Ok(frame
            .locals
            .iter()
            .map(|(name, v)| v.to_variable(name, name))
            .collect())
    }

    /// Evaluate an expression in a frame, without side effects.
    pub fn evaluate(&self, thread: usize, level: u32, expr: &Expr) -> Result<Value, Error> {
        let frame = self.frame(thread, level)?;
        self.eval(&frame.locals, expr)
    }

    fn module_loaded(&self, function: &CompiledFn) -> bool {
        function
            .module
            .as_ref()
            .map(|m| self.loaded.contains(m))
            .unwrap_or(true)
    }

    /// Address and location of the first instruction of a function.
    pub fn resolve_function(&self, name: &str) -> Result<(u64, Location), Error> {
        let idx = *self.by_name.get(name).ok_or_else(|| Error::SymbolUnavailable {
            what: format!("function `{name}`"),
            message: "no such function".to_string(),
        })?;
        let function = &self.functions[idx];
        if !self.module_loaded(function) {
            return Err(Error::SymbolUnavailable {
                what: format!("function `{name}`"),
                message: format!(
                    "module `{}` is not loaded",
                    function.module.as_deref().unwrap_or_default()
                ),
            });
        }
        let pc = function
            .instrs
            .iter()
            .position(|i| i.line.is_some())
            .unwrap_or(0);
        Ok(self.code_location(idx, pc))
    }

    fn code_location(&self, function: usize, pc: usize) -> (u64, Location) {
        let f = &self.functions[function];
        let address = self.address(function, pc);
        let location = Location {
            function: Some(f.name.clone()),
            file: Some(self.file.clone()),
            line: f.instrs[pc].line,
            address: Some(address),
        };
        (address, location)
    }

    /// First instruction of the nearest line with code at or after `line`.
    pub fn resolve_line(&self, file: &Path, line: u64) -> Result<(u64, Location), Error> {
        let what = || format!("line {}:{line}", file.display());
        let candidate = Location {
            file: Some(self.file.clone()),
            ..Default::default()
        };
        if !candidate.same_file(file) {
            return Err(Error::SymbolUnavailable {
                what: what(),
                message: "unknown source file".to_string(),
            });
        }

        let best = self
            .functions
            .iter()
            .enumerate()
            .flat_map(|(fi, f)| {
                f.instrs
                    .iter()
                    .enumerate()
                    .filter_map(move |(pc, i)| i.line.map(|l| (l, fi, pc)))
            })
            .filter(|(l, _, _)| *l >= line)
            .min_by_key(|(l, fi, pc)| (*l, self.functions[*fi].base + pc));

        match best {
            Some((_, fi, pc)) if self.module_loaded(&self.functions[fi]) => {
                Ok(self.code_location(fi, pc))
            }
            Some((_, fi, _)) => Err(Error::SymbolUnavailable {
                what: what(),
                message: format!(
                    "module `{}` is not loaded",
                    self.functions[fi].module.as_deref().unwrap_or_default()
                ),
            }),
            None => Err(Error::SymbolUnavailable {
                what: what(),
                message: "no code at or after this line".to_string(),
            }),
        }
    }

    /// Location of the instruction at `address`.
    pub fn resolve_address(&self, address: u64) -> Result<(u64, Location), Error> {
        let rejected = || Error::BackendRejected {
            command: "break".to_string(),
            message: format!("no instruction at {address:#x}"),
        };
        if address < CODE_BASE || (address - CODE_BASE) % INSTR_SIZE != 0 {
            return Err(rejected());
        }
        let global = ((address - CODE_BASE) / INSTR_SIZE) as usize;
        let (fi, f) = self
            .functions
            .iter()
            .enumerate()
            .find(|(_, f)| global >= f.base && global < f.base + f.instrs.len())
            .ok_or_else(rejected)?;
        if !self.module_loaded(f) {
            return Err(Error::SymbolUnavailable {
                what: format!("address {address:#x}"),
                message: "module is not loaded".to_string(),
            });
        }
        Ok(self.code_location(fi, global - f.base))
    }

    pub fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, Error> {
        let start = address as usize;
        if address >= MEMORY_SIZE as u64 {
            return Err(Error::BackendRejected {
                command: "read memory".to_string(),
                message: format!("cannot access memory at address {address:#x}"),
            });
        }
        let end = start.saturating_add(len).min(MEMORY_SIZE);
        Ok(self.memory[start..end].to_vec())
    }

    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let start = address as usize;
        if address >= MEMORY_SIZE as u64 || start + data.len() > MEMORY_SIZE {
            return Err(Error::BackendRejected {
                command: "write memory".to_string(),
                message: format!("cannot access memory at address {address:#x}"),
            });
        }
        self.memory[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Drop the innermost frame of a thread without running the rest of it.
    pub fn pop_frame(&mut self, thread: usize) -> Result<(), Error> {
        let stack = &mut self.threads[thread].stack;
        if stack.len() < 2 {
            return Err(Error::BackendRejected {
                command: "return".to_string(),
                message: "cannot return from the outermost frame".to_string(),
            });
        }
        if let Some(frame) = stack.pop() {
            if let (Some(dest), Some(caller)) = (frame.dest, stack.last_mut()) {
                caller.locals.insert(dest.name, Value::Nil);
            }
        }
        Ok(())
    }

    fn runtime_error(&self, thread: usize, message: impl Into<String>) -> Error {
        let line = self
            .line(thread)
            .map(|l| format!(" at line {l}"))
            .unwrap_or_default();
        Error::BackendRejected {
            command: format!("execute{line}"),
            message: message.into(),
        }
    }

    /// Execute the next instruction of a thread.
    ///
    /// A runtime error leaves the thread where it was.
    pub fn step(&mut self, thread: usize) -> Result<Vec<Effect>, Error> {
        let (function, pc) = {
            let Some(frame) = self.threads[thread].stack.last() else {
                return Ok(vec![]);
            };
            (frame.function, frame.pc)
        };
        let Some(instr) = self.instr(function, pc).cloned() else {
            return Err(self.runtime_error(thread, "program counter out of function"));
        };
        let mut effects = vec![];

        macro_rules! eval {
            ($e: expr) => {{
                let locals = &self.threads[thread].stack[self.threads[thread].stack.len() - 1].locals;
                self.eval(locals, $e)
                    .map_err(|e| self.runtime_error(thread, reason(e)))?
            }};
        }

        let mut next_pc = pc + 1;
        match &instr.op {
            Op::Let(name, e) => {
                let value = eval!(e);
                self.top(thread).locals.insert(name.clone(), value);
            }
            Op::Assign(name, e) => {
                let value = eval!(e);
                let frame = self.top(thread);
                match frame.locals.get_mut(name) {
                    Some(slot) => *slot = value,
                    None => {
                        return Err(self.runtime_error(
                            thread,
                            format!("assignment to undeclared variable `{name}`"),
                        ))
                    }
                }
            }
            Op::Eval(e) => {
                eval!(e);
            }
            Op::Print(e) => {
                let value = eval!(e);
                effects.push(Effect::Output(value.display()));
            }
            Op::Call {
                dest,
                function: callee,
                args,
            } => {
                let args: Vec<Value> = args.iter().map(|a| Ok(eval!(a))).collect::<Result<_, Error>>()?;
                let callee = self.callable(thread, callee, args.len())?;
                let locals = self.functions[callee]
                    .params
                    .iter()
                    .cloned()
                    .zip(args)
                    .collect();
                self.top(thread).pc = next_pc;
                self.threads[thread].stack.push(CallFrame {
                    function: callee,
                    pc: 0,
                    locals,
                    dest: dest.clone(),
                });
                return Ok(effects);
            }
            Op::Return(e) => {
                let value = match e {
                    Some(e) => eval!(e),
                    None => Value::Nil,
                };
                let dest = self.threads[thread].stack.pop().and_then(|f| f.dest);
                match self.threads[thread].stack.last_mut() {
                    Some(caller) => {
                        if let Some(dest) = dest {
                            if dest.declare || caller.locals.contains_key(&dest.name) {
                                caller.locals.insert(dest.name, value);
                            }
                        }
                    }
                    None if thread == 0 => {
                        let code = match value {
                            Value::Int(code) => code as i32,
                            _ => 0,
                        };
                        self.exit_code = Some(code);
                        effects.push(Effect::Exited(code));
                    }
                    None => {
                        let id = self.threads[thread].id;
                        self.threads.remove(thread);
                        effects.push(Effect::ThreadExited(id));
                    }
                }
                return Ok(effects);
            }
            Op::Branch { cond, otherwise } => {
                if !eval!(cond).truthy() {
                    next_pc = *otherwise;
                }
            }
            Op::Jump(target) => next_pc = *target,
            Op::Spawn(name, args) => {
                let args: Vec<Value> = args.iter().map(|a| Ok(eval!(a))).collect::<Result<_, Error>>()?;
                let callee = self.callable(thread, name, args.len())?;
                let locals = self.functions[callee]
                    .params
                    .iter()
                    .cloned()
                    .zip(args)
                    .collect();
                let id = self.create_thread(callee, locals);
                effects.push(Effect::ThreadCreated(id));
            }
            Op::Load(module) => {
                if self.loaded.insert(module.clone()) {
                    effects.push(Effect::ModuleLoaded(module.clone()));
                }
            }
            Op::Unload(module) => {
                if self.loaded.remove(module) {
                    effects.push(Effect::ModuleUnloaded(module.clone()));
                }
            }
            Op::Poke(addr, data) => {
                let Value::Int(addr) = eval!(addr) else {
                    return Err(self.runtime_error(thread, "poke address must be an integer"));
                };
                let bytes = match eval!(data) {
                    Value::Str(s) => s.bytes().chain([0]).collect_vec(),
                    Value::Int(b) => vec![b as u8],
                    Value::List(items) => items
                        .iter()
                        .map(|v| match v {
                            Value::Int(b) => Ok(*b as u8),
                            _ => Err(self.runtime_error(thread, "poke list items must be integers")),
                        })
                        .collect::<Result<_, _>>()?,
                    _ => return Err(self.runtime_error(thread, "cannot poke this value")),
                };
                self.write_memory(addr as u64, &bytes)
                    .map_err(|e| self.runtime_error(thread, reason(e)))?;
            }
            Op::Exit(e) => {
                let code = match eval!(e) {
                    Value::Int(code) => code as i32,
                    _ => return Err(self.runtime_error(thread, "exit code must be an integer")),
                };
                self.top(thread).pc = next_pc;
                self.exit_code = Some(code);
                effects.push(Effect::Exited(code));
                return Ok(effects);
            }
        }

        self.top(thread).pc = next_pc;
        Ok(effects)
    }

    fn top(&mut self, thread: usize) -> &mut CallFrame {
        let stack = &mut self.threads[thread].stack;
        let last = stack.len() - 1;
        &mut stack[last]
    }

    fn callable(&self, thread: usize, name: &str, argc: usize) -> Result<usize, Error> {
        let idx = *self
            .by_name
            .get(name)
            .ok_or_else(|| self.runtime_error(thread, format!("unknown function `{name}`")))?;
        let function = &self.functions[idx];
        if !self.module_loaded(function) {
            return Err(self.runtime_error(
                thread,
                format!(
                    "module `{}` is not loaded",
                    function.module.as_deref().unwrap_or_default()
                ),
            ));
        }
        if function.params.len() != argc {
            return Err(self.runtime_error(
                thread,
                format!(
                    "`{name}` expects {} arguments, {argc} given",
                    function.params.len()
                ),
            ));
        }
        Ok(idx)
    }

    fn eval(&self, locals: &IndexMap<String, Value>, expr: &Expr) -> Result<Value, Error> {
        let invalid = |message: String| Error::BackendRejected {
            command: "evaluate".to_string(),
            message,
        };

        Ok(match expr {
            Expr::Nil => Value::Nil,
            Expr::Int(v) => Value::Int(*v),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Str(s) => Value::Str(s.clone()),
            Expr::Var(name) => locals
                .get(name)
                .cloned()
                .ok_or_else(|| Error::SymbolUnavailable {
                    what: format!("`{name}`"),
                    message: "no symbol in current context".to_string(),
                })?,
            Expr::List(items) => Value::List(
                items
                    .iter()
                    .map(|e| self.eval(locals, e))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::Record(fields) => Value::Record(
                fields
                    .iter()
                    .map(|(k, e)| Ok((k.clone(), self.eval(locals, e)?)))
                    .collect::<Result<_, Error>>()?,
            ),
            Expr::Field(e, name) => match self.eval(locals, e)? {
                Value::Record(mut fields) => fields
                    .swap_remove(name)
                    .ok_or_else(|| invalid(format!("no field `{name}`")))?,
                other => return Err(invalid(format!("{} has no fields", other.type_name()))),
            },
            Expr::Index(e, idx) => {
                let target = self.eval(locals, e)?;
                let Value::Int(idx) = self.eval(locals, idx)? else {
                    return Err(invalid("index must be an integer".to_string()));
                };
                match target {
                    Value::List(items) => items
                        .get(idx as usize)
                        .cloned()
                        .ok_or_else(|| invalid(format!("index {idx} out of bounds")))?,
                    Value::Str(s) => s
                        .chars()
                        .nth(idx as usize)
                        .map(|c| Value::Str(c.to_string()))
                        .ok_or_else(|| invalid(format!("index {idx} out of bounds")))?,
                    Value::Pointer { address, .. } => {
                        let byte = self.read_memory(address.wrapping_add(idx as u64), 1)?;
                        Value::Int(byte.first().copied().unwrap_or_default() as i64)
                    }
                    other => return Err(invalid(format!("cannot index {}", other.type_name()))),
                }
            }
            Expr::Unary(op, e) => match (op, self.eval(locals, e)?) {
                (UnOp::Neg, Value::Int(v)) => Value::Int(v.wrapping_neg()),
                (UnOp::Not, v) => Value::Bool(!v.truthy()),
                (UnOp::Neg, other) => {
                    return Err(invalid(format!("cannot negate {}", other.type_name())))
                }
            },
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(locals, lhs)?;
                match op {
                    BinOp::And if !lhs.truthy() => return Ok(Value::Bool(false)),
                    BinOp::Or if lhs.truthy() => return Ok(Value::Bool(true)),
                    _ => {}
                }
                let rhs = self.eval(locals, rhs)?;
                binary(*op, lhs, rhs).map_err(invalid)?
            }
            Expr::Call(name, args) => {
                let args: Vec<Value> = args
                    .iter()
                    .map(|e| self.eval(locals, e))
                    .collect::<Result<_, _>>()?;
                match (name.as_str(), args.as_slice()) {
                    ("ptr", [Value::Str(kind), Value::Int(addr)]) => Value::Pointer {
                        kind: kind.clone(),
                        address: *addr as u64,
                    },
                    ("len", [Value::Str(s)]) => Value::Int(s.chars().count() as i64),
                    ("len", [Value::List(items)]) => Value::Int(items.len() as i64),
                    ("len", [Value::Record(fields)]) => Value::Int(fields.len() as i64),
                    ("peek", [Value::Int(addr)]) => {
                        let byte = self.read_memory(*addr as u64, 1)?;
                        Value::Int(byte.first().copied().unwrap_or_default() as i64)
                    }
                    (name, _) if is_builtin(name) => {
                        return Err(invalid(format!("wrong arguments for `{name}`")))
                    }
                    (name, _) if self.by_name.contains_key(name) => {
                        return Err(invalid(format!(
                            "function `{name}` can only be called as a statement"
                        )))
                    }
                    (name, _) => return Err(invalid(format!("unknown function `{name}`"))),
                }
            }
        })
    }
}

/// Backend text of an evaluation failure, without the error kind prefix.
fn reason(e: Error) -> String {
    match e {
        Error::BackendRejected { message, .. } => message,
        Error::SymbolUnavailable { what, message } => format!("{what}: {message}"),
        other => other.to_string(),
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, String> {
    use Value::*;
    Ok(match (op, lhs, rhs) {
        (BinOp::Eq, l, r) => Bool(l == r),
        (BinOp::Ne, l, r) => Bool(l != r),
        (BinOp::And, l, r) => Bool(l.truthy() && r.truthy()),
        (BinOp::Or, l, r) => Bool(l.truthy() || r.truthy()),
        (BinOp::Add, Str(l), r) => Str(l + &r.display()),
        (BinOp::Add, l, Str(r)) => Str(l.display() + &r),
        (BinOp::Add, Int(l), Int(r)) => Int(l.wrapping_add(r)),
        (BinOp::Sub, Int(l), Int(r)) => Int(l.wrapping_sub(r)),
        (BinOp::Mul, Int(l), Int(r)) => Int(l.wrapping_mul(r)),
        (BinOp::Div | BinOp::Rem, Int(_), Int(0)) => return Err("division by zero".to_string()),
        (BinOp::Div, Int(l), Int(r)) => Int(l.wrapping_div(r)),
        (BinOp::Rem, Int(l), Int(r)) => Int(l.wrapping_rem(r)),
        (BinOp::Lt, Int(l), Int(r)) => Bool(l < r),
        (BinOp::Le, Int(l), Int(r)) => Bool(l <= r),
        (BinOp::Gt, Int(l), Int(r)) => Bool(l > r),
        (BinOp::Ge, Int(l), Int(r)) => Bool(l >= r),
        (op, l, r) => {
            return Err(format!(
                "unsupported operation {op:?} on {} and {}",
                l.type_name(),
                r.type_name()
            ))
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::backend::script::parser::{parse_expr, parse_program};

    const PROGRAM: &str = r#"fn add(a, b) {
    return a + b
}

fn main() {
    let x = 1
    let y = add(x, 2)

    if y > 2 {
        print "big " + y
    }
    poke 16, "hi"
    return y
}
"#;

    fn run(machine: &mut Machine) -> Vec<Effect> {
        let mut effects = vec![];
        while !machine.is_finished() {
            effects.extend(machine.step(0).unwrap());
        }
        effects
    }

    #[test]
    fn test_run_to_completion() {
        let program = parse_program(PROGRAM).unwrap();
        let mut machine = Machine::new(&program, "prog.mds").unwrap();
        let effects = run(&mut machine);
        assert_eq!(
            effects,
            vec![Effect::Output("big 3".to_string()), Effect::Exited(3)]
        );
        assert_eq!(machine.read_memory(16, 3).unwrap(), b"hi\0".to_vec());
    }

    #[test]
    fn test_line_resolution() {
        let program = parse_program(PROGRAM).unwrap();
        let machine = Machine::new(&program, "/src/prog.mds").unwrap();

        struct TestCase {
            line: u64,
            expected: Option<u64>,
        }
        let cases = vec![
            TestCase { line: 2, expected: Some(2) },
            // fn header and closing brace have no code
            TestCase { line: 3, expected: Some(6) },
            TestCase { line: 5, expected: Some(6) },
            TestCase { line: 8, expected: Some(9) },
            TestCase { line: 13, expected: Some(13) },
            TestCase { line: 14, expected: None },
        ];
        for tc in cases {
            let resolved = machine.resolve_line(Path::new("prog.mds"), tc.line);
            assert_eq!(
                resolved.ok().and_then(|(_, loc)| loc.line),
                tc.expected,
                "line {}",
                tc.line
            );
        }

        let (addr, loc) = machine.resolve_function("add").unwrap();
        assert_eq!(loc.line, Some(2));
        assert_eq!(machine.resolve_address(addr).unwrap().1, loc);
        assert!(machine.resolve_line(Path::new("other.mds"), 2).is_err());
    }

    #[test]
    fn test_frames_and_evaluation() {
        let program = parse_program(PROGRAM).unwrap();
        let mut machine = Machine::new(&program, "prog.mds").unwrap();
        // let x, call add
        machine.step(0).unwrap();
        machine.step(0).unwrap();

        let frames = machine.frames(0);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].location.function.as_deref(), Some("add"));
        assert_eq!(frames[0].location.line, Some(2));
        assert_eq!(frames[1].location.line, Some(7));

        let sum = machine
            .evaluate(0, 0, &parse_expr("a * 10 + b").unwrap())
            .unwrap();
        assert_eq!(sum, Value::Int(12));
        let err = machine.evaluate(0, 0, &parse_expr("x").unwrap());
        assert!(matches!(err, Err(Error::SymbolUnavailable { .. })));
        assert_eq!(
            machine.evaluate(0, 1, &parse_expr("x").unwrap()).unwrap(),
            Value::Int(1)
        );

        machine.pop_frame(0).unwrap();
        assert_eq!(machine.depth(0), 1);
        assert_eq!(machine.line(0), Some(9));
        assert!(machine.pop_frame(0).is_err());
    }

    #[test]
    fn test_runtime_error_keeps_position() {
        let program = parse_program("fn main() {\n    let x = 1 / 0\n}\n").unwrap();
        let mut machine = Machine::new(&program, "prog.mds").unwrap();
        let err = machine.step(0).unwrap_err();
        assert!(err.to_string().contains("division by zero"), "{err}");
        assert_eq!(machine.line(0), Some(2));
    }

    #[test]
    fn test_threads_and_modules() {
        let source = r#"module "libwork" {
    fn work(n) {
        print n
    }
}

fn main() {
    load "libwork"
    spawn work(7)
    unload "libwork"
}
"#;
        let program = parse_program(source).unwrap();
        let mut machine = Machine::new(&program, "prog.mds").unwrap();
        assert!(machine.resolve_function("work").is_err());

        assert_eq!(
            machine.step(0).unwrap(),
            vec![Effect::ModuleLoaded("libwork".to_string())]
        );
        assert!(machine.resolve_function("work").is_ok());
        assert_eq!(
            machine.step(0).unwrap(),
            vec![Effect::ThreadCreated(ThreadId(2))]
        );
        assert_eq!(machine.threads().len(), 2);
        assert_eq!(machine.threads()[1].label, "work");

        assert_eq!(machine.step(1).unwrap(), vec![Effect::Output("7".to_string())]);
        assert_eq!(machine.step(1).unwrap(), vec![Effect::ThreadExited(ThreadId(2))]);
        assert_eq!(machine.threads().len(), 1);
        assert_eq!(
            machine.step(0).unwrap(),
            vec![Effect::ModuleUnloaded("libwork".to_string())]
        );
    }
}
