//! A deliberately tiny line-oriented evaluator used to exercise the engine.
//!
//! One instruction per line:
//!
//! ```text
//! set <key> <json>          install a global binding
//! get <key>                 read a binding (becomes the script result)
//! copy <dst> <src>          re-bind an existing binding under a new name
//! delete <key>              drop a binding
//! alloc <bytes>             reserve run-scratch guest memory
//! throw <message...>        raise a guest-level error
//! call <key> [json...]      awaited apply of a function bound under <key>
//! notify <key> [json...]    ignored apply of a function bound under <key>
//! callwith <fn> <arg-key>   awaited apply passing the bound value as-is
//! waste <bytes> [log=<key>] allocate <bytes> chunks until out of memory,
//!                           reporting progress through an ignored apply
//! spin                      loop forever at an interruptible point
//! deref <key>               dereference a reference bound under <key>
//! corrupt <message...>      report unrecoverable internal state
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use cordon::{
    CompileError, EvalFault, Evaluator, Isolate, IsolateOptions, Reference, Scope, Value,
};
use parking_lot::Mutex;

pub struct MiniEvaluator;

pub struct Program {
    ops: Vec<Op>,
}

enum Op {
    Set { key: String, value: Value },
    Get { key: String },
    Copy { dst: String, src: String },
    Delete { key: String },
    Alloc { bytes: usize },
    Throw { message: String },
    Call { target: String, args: Vec<Value>, ignore: bool },
    CallWith { target: String, arg_key: String },
    Waste { chunk: usize, log: Option<String> },
    Spin,
    Deref { key: String },
    Corrupt { message: String },
}

impl Evaluator for MiniEvaluator {
    type Unit = Program;

    fn compile(&self, source: &str) -> Result<Program, CompileError> {
        let mut ops = Vec::new();
        for (index, line) in source.lines().enumerate() {
            if let Some(op) = parse_line(index as u32 + 1, line)? {
                ops.push(op);
            }
        }
        Ok(Program { ops })
    }

    fn execute(&self, unit: &Program, scope: &mut Scope<'_>) -> Result<Value, EvalFault> {
        let mut last = Value::Null;
        for op in &unit.ops {
            scope.check_interrupt()?;
            match op {
                Op::Set { key, value } => scope.global_set(key, value.clone())?,
                Op::Get { key } => {
                    last = scope
                        .global_get(key)?
                        .ok_or_else(|| EvalFault::thrown(format!("undefined: {key}")))?;
                }
                Op::Copy { dst, src } => {
                    let value = scope
                        .global_get(src)?
                        .ok_or_else(|| EvalFault::thrown(format!("undefined: {src}")))?;
                    scope.global_set(dst, value)?;
                }
                Op::Delete { key } => {
                    scope.global_delete(key)?;
                }
                Op::Alloc { bytes } => scope.alloc(*bytes)?,
                Op::Throw { message } => return Err(EvalFault::thrown(message.clone())),
                Op::Call { target, args, ignore } => {
                    let function = lookup_reference(scope, target)?;
                    last = scope.apply(&function, None, args, *ignore)?;
                }
                Op::CallWith { target, arg_key } => {
                    let function = lookup_reference(scope, target)?;
                    let arg = scope
                        .global_get(arg_key)?
                        .ok_or_else(|| EvalFault::thrown(format!("undefined: {arg_key}")))?;
                    last = scope.apply(&function, None, &[arg], false)?;
                }
                Op::Waste { chunk, log } => {
                    let function = match log {
                        Some(key) => Some(lookup_reference(scope, key)?),
                        None => None,
                    };
                    let mut wasted = 0_usize;
                    loop {
                        scope.check_interrupt()?;
                        scope.alloc(*chunk)?;
                        wasted += chunk;
                        if let Some(function) = &function {
                            let message =
                                Value::String(format!("wasted {} bytes", wasted));
                            scope.apply(function, None, &[message], true)?;
                        }
                    }
                }
                Op::Spin => loop {
                    scope.check_interrupt()?;
                    std::thread::sleep(Duration::from_millis(1));
                },
                Op::Deref { key } => {
                    let value = scope
                        .global_get(key)?
                        .ok_or_else(|| EvalFault::thrown(format!("undefined: {key}")))?;
                    let Value::Reference(reference) = value else {
                        return Err(EvalFault::thrown(format!("not a reference: {key}")));
                    };
                    last = scope.deref(&reference)?;
                }
                Op::Corrupt { message } => {
                    return Err(EvalFault::Corrupted(anyhow::anyhow!(message.clone())));
                }
            }
        }
        Ok(last)
    }
}

fn lookup_reference(scope: &Scope<'_>, key: &str) -> Result<Reference, EvalFault> {
    match scope.global_get(key)? {
        Some(Value::Reference(reference)) => Ok(reference),
        Some(_) => Err(EvalFault::thrown(format!("not callable: {key}"))),
        None => Err(EvalFault::thrown(format!("undefined: {key}"))),
    }
}

fn parse_line(line: u32, raw: &str) -> Result<Option<Op>, CompileError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let (op, rest) = split_word(trimmed);
    let op = match op {
        "set" => {
            let (key, json) = split_word(rest);
            Op::Set {
                key: require_word(key, "set: missing key", line)?,
                value: parse_json(json, line)?,
            }
        }
        "get" => Op::Get {
            key: require_word(rest.trim(), "get: missing key", line)?,
        },
        "copy" => {
            let (dst, src) = split_word(rest);
            Op::Copy {
                dst: require_word(dst, "copy: missing destination", line)?,
                src: require_word(src.trim(), "copy: missing source", line)?,
            }
        }
        "delete" => Op::Delete {
            key: require_word(rest.trim(), "delete: missing key", line)?,
        },
        "alloc" => Op::Alloc {
            bytes: parse_bytes(rest.trim(), line)?,
        },
        "throw" => Op::Throw {
            message: rest.trim().to_string(),
        },
        "call" | "notify" => {
            let (target, args) = split_word(rest);
            Op::Call {
                target: require_word(target, "call: missing target", line)?,
                args: args
                    .split_whitespace()
                    .map(|token| parse_json(token, line))
                    .collect::<Result<_, _>>()?,
                ignore: op == "notify",
            }
        }
        "callwith" => {
            let (target, arg_key) = split_word(rest);
            Op::CallWith {
                target: require_word(target, "callwith: missing target", line)?,
                arg_key: require_word(arg_key.trim(), "callwith: missing argument key", line)?,
            }
        }
        "waste" => {
            let (chunk, tail) = split_word(rest);
            let log = match tail.trim() {
                "" => None,
                tail => Some(
                    tail.strip_prefix("log=")
                        .ok_or_else(|| CompileError::at("waste: expected log=<key>", line, 1))?
                        .to_string(),
                ),
            };
            Op::Waste {
                chunk: parse_bytes(chunk, line)?,
                log,
            }
        }
        "spin" => Op::Spin,
        "deref" => Op::Deref {
            key: require_word(rest.trim(), "deref: missing key", line)?,
        },
        "corrupt" => Op::Corrupt {
            message: rest.trim().to_string(),
        },
        other => {
            return Err(CompileError::at(format!("unknown instruction: {other}"), line, 1));
        }
    };
    Ok(Some(op))
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(at) => (&input[..at], &input[at..]),
        None => (input, ""),
    }
}

fn require_word(word: &str, message: &str, line: u32) -> Result<String, CompileError> {
    if word.is_empty() {
        return Err(CompileError::at(message, line, 1));
    }
    Ok(word.to_string())
}

fn parse_bytes(token: &str, line: u32) -> Result<usize, CompileError> {
    token
        .parse()
        .map_err(|_| CompileError::at(format!("invalid byte count: {token}"), line, 1))
}

fn parse_json(token: &str, line: u32) -> Result<Value, CompileError> {
    Value::from_json(token.trim())
        .map_err(|_| CompileError::at(format!("invalid literal: {token}"), line, 1))
}

pub fn isolate(memory_ceiling: usize) -> Isolate<MiniEvaluator> {
    init_tracing();
    Isolate::new(MiniEvaluator, IsolateOptions::new(memory_ceiling)).expect("create isolate")
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Host log capability: a function reference appending its first argument to
/// a shared buffer.
pub fn log_sink(
    isolate: &Isolate<MiniEvaluator>,
) -> (Reference, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let reference = isolate
        .wrap_function(move |arguments| {
            let rendered = match arguments.args.first() {
                Some(Value::String(s)) => s.clone(),
                Some(other) => format!("{other:?}"),
                None => String::new(),
            };
            sink.lock().push(rendered);
            Ok(Value::Null)
        })
        .expect("wrap log function");
    (reference, lines)
}

/// Poll until `predicate` holds or the timeout elapses.
pub fn wait_for(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
