//! JavaScript evaluation for cells, on top of `boa_engine`.
//!
//! Cells share one persistent [`Context`], so globals assigned by one cell
//! are visible to the next. A cell is parsed on its own before it runs: a
//! syntax error is reported with its position and nothing is evaluated.
//!
//! Host functions are plain function pointers, so the file store and the
//! timer queue are lent to a thread-local slot for the duration of each call
//! into the engine and taken back afterwards.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use boa_engine::ast::scope::Scope;
use boa_engine::ast::{Expression, Statement, StatementListItem};
use boa_engine::interner::Interner;
use boa_engine::job::SimpleJobQueue;
use boa_engine::object::builtins::JsArray;
use boa_engine::object::{FunctionObjectBuilder, ObjectInitializer};
use boa_engine::parser::{Error as ParseError, Parser};
use boa_engine::property::Attribute;
use boa_engine::{
    Context, JsError, JsNativeError, JsObject, JsResult, JsValue, NativeFunction, Source, js_string,
};
use tokio::time::Instant;

use crate::protocol::{ErrorKind, ExecutionError};
use crate::vfs::VirtualFileStore;

const PRELUDE: &str = include_str!("prelude.js");

/// Runs once the prelude is installed.
const LOCKDOWN: &str = r"
delete globalThis.eval;
Object.freeze(Object.prototype);
Object.freeze(Array.prototype);
Object.freeze(Function.prototype);
";

// Longer delays are clamped so deadlines stay representable.
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

type HostFn = fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>;

thread_local! {
    static HOST: RefCell<HostSlot> = RefCell::new(HostSlot::default());
}

#[derive(Default)]
struct HostSlot {
    files: VirtualFileStore,
    timers: Vec<Timer>,
    next_seq: u64,
}

struct Timer {
    due: Instant,
    seq: u64,
    callback: JsObject,
}

/// Functions the prelude hands back.
struct Hooks {
    present: JsObject,
    describe: JsObject,
    track: JsObject,
}

/// What running a cell, or polling its promise, produced.
pub(crate) enum Evaluation {
    /// The JSON form of the value; `None` for `undefined` and `null`.
    Value(Option<serde_json::Value>),
    /// The cell threw, or its promise was rejected.
    Thrown(String),
    /// The cell returned a promise. Poll the settlement record.
    Pending(JsObject),
}

pub(crate) struct Engine {
    hooks: Hooks,
    timers: Vec<Timer>,
    files: VirtualFileStore,
    // Declared last so every handle above is dropped first.
    context: Context,
}

impl Engine {
    pub(crate) fn new() -> JsResult<Self> {
        let mut context = Context::builder()
            .job_queue(Rc::new(SimpleJobQueue::new()))
            .build()?;
        register_files(&mut context)?;

        let mut initializer = ObjectInitializer::new(&mut context);
        initializer.function(NativeFunction::from_fn_ptr(schedule), js_string!("schedule"), 2);
        let host = initializer.build();

        let prelude = context.eval(Source::from_bytes(PRELUDE))?;
        let hooks = callable(&prelude, "prelude")?.call(
            &JsValue::undefined(),
            &[host.into()],
            &mut context,
        )?;
        context.eval(Source::from_bytes(LOCKDOWN))?;

        let hooks = Hooks {
            present: hook(&hooks, "present", &mut context)?,
            describe: hook(&hooks, "describe", &mut context)?,
            track: hook(&hooks, "track", &mut context)?,
        };
        Ok(Self {
            hooks,
            timers: Vec::new(),
            files: VirtualFileStore::new(),
            context,
        })
    }

    pub(crate) fn files(&self) -> &VirtualFileStore {
        &self.files
    }

    pub(crate) fn files_mut(&mut self) -> &mut VirtualFileStore {
        &mut self.files
    }

    /// Run `f` with the file store and timer queue reachable from host
    /// functions.
    fn enter<T>(&mut self, f: impl FnOnce(&mut Context, &Hooks) -> T) -> T {
        HOST.with_borrow_mut(|host| host.files = std::mem::take(&mut self.files));
        let output = f(&mut self.context, &self.hooks);
        HOST.with_borrow_mut(|host| {
            self.files = std::mem::take(&mut host.files);
            self.timers.append(&mut host.timers);
        });
        output
    }

    /// Evaluate a cell that [`check`] accepted.
    pub(crate) fn evaluate(&mut self, src: &str) -> Evaluation {
        self.enter(|context, hooks| {
            let value = match context.eval(Source::from_bytes(src)) {
                Ok(value) => value,
                Err(error) => return Evaluation::Thrown(describe(hooks, &error, context)),
            };
            context.run_jobs();
            match hooks.track.call(&JsValue::undefined(), &[value.clone()], context) {
                Ok(record) => match record.as_object() {
                    Some(record) => Evaluation::Pending(record.clone()),
                    None => present(hooks, &value, context),
                },
                Err(error) => Evaluation::Thrown(describe(hooks, &error, context)),
            }
        })
    }

    /// Check a settlement record; `None` while the promise is pending.
    pub(crate) fn poll(&mut self, record: &JsObject) -> Option<Evaluation> {
        self.enter(|context, hooks| {
            context.run_jobs();
            let status = match record.get(js_string!("status"), context) {
                Ok(status) => status.as_string().map(|s| s.to_std_string_escaped()),
                Err(error) => return Some(Evaluation::Thrown(describe(hooks, &error, context))),
            };
            let value = match record.get(js_string!("value"), context) {
                Ok(value) => value,
                Err(error) => return Some(Evaluation::Thrown(describe(hooks, &error, context))),
            };
            match status.as_deref() {
                Some("fulfilled") => Some(present(hooks, &value, context)),
                Some("rejected") => Some(Evaluation::Thrown(
                    describe_value(hooks, value, context)
                        .unwrap_or_else(|| "promise rejected".to_string()),
                )),
                _ => None,
            }
        })
    }

    /// When the earliest pending timer is due.
    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.timers.iter().map(|timer| timer.due).min()
    }

    /// Fire every timer due at `now`, in scheduling order.
    pub(crate) fn fire_due(&mut self, now: Instant) {
        self.timers.sort_by_key(|timer| (timer.due, timer.seq));
        let split = self.timers.partition_point(|timer| timer.due <= now);
        let due: Vec<Timer> = self.timers.drain(..split).collect();
        self.enter(|context, _| {
            for timer in due {
                if let Err(error) = timer.callback.call(&JsValue::undefined(), &[], context) {
                    tracing::debug!(%error, "Timer callback threw");
                }
            }
            context.run_jobs();
        });
    }

    /// Drop timers left behind by a finished or cancelled cell.
    pub(crate) fn clear_timers(&mut self) {
        if !self.timers.is_empty() {
            tracing::debug!(dropped = self.timers.len(), "Dropping pending timers");
            self.timers.clear();
        }
    }
}

/// Parse a cell without running it. Returns whether its last statement is an
/// assignment.
pub(crate) fn check(src: &str) -> Result<bool, ExecutionError> {
    let mut interner = Interner::default();
    let mut parser = Parser::new(Source::from_bytes(src));
    let script = parser
        .parse_script(&Scope::new_global(), &mut interner)
        .map_err(|e| syntax_error(src, &e))?;
    Ok(matches!(
        script.statements().statements().last(),
        Some(StatementListItem::Statement(Statement::Expression(Expression::Assign(_))))
    ))
}

fn syntax_error(src: &str, error: &ParseError) -> ExecutionError {
    if matches!(error, ParseError::AbruptEnd) {
        let (line, column) = end_of(src);
        return ExecutionError::new(ErrorKind::Syntax, "unexpected end of input").at(line, column);
    }
    // Parser messages end with " at line L, col C".
    let text = error.to_string();
    let located = text.rsplit_once(" at line ").and_then(|(message, at)| {
        let (line, column) = at.split_once(", col ")?;
        Some((message, line.trim().parse::<u32>().ok()?, column.trim().parse::<u32>().ok()?))
    });
    match located {
        Some((message, line, column)) => {
            ExecutionError::new(ErrorKind::Syntax, message).at(line, column)
        }
        None => ExecutionError::new(ErrorKind::Syntax, text),
    }
}

/// 1-based line and column just past the last character.
fn end_of(src: &str) -> (u32, u32) {
    let line = src.matches('\n').count() + 1;
    let last = src.rsplit('\n').next().unwrap_or_default();
    let column = last.chars().count() + 1;
    (
        u32::try_from(line).unwrap_or(u32::MAX),
        u32::try_from(column).unwrap_or(u32::MAX),
    )
}

fn present(hooks: &Hooks, value: &JsValue, context: &mut Context) -> Evaluation {
    let json = match hooks.present.call(&JsValue::undefined(), &[value.clone()], context) {
        Ok(json) => json,
        Err(error) => return Evaluation::Thrown(describe(hooks, &error, context)),
    };
    let Some(json) = json.as_string() else {
        return Evaluation::Value(None);
    };
    match serde_json::from_str(&json.to_std_string_escaped()) {
        Ok(value) => Evaluation::Value(Some(value)),
        Err(e) => Evaluation::Thrown(format!("result is not serializable: {e}")),
    }
}

fn describe(hooks: &Hooks, error: &JsError, context: &mut Context) -> String {
    let thrown = error.to_opaque(context);
    describe_value(hooks, thrown, context).unwrap_or_else(|| error.to_string())
}

fn describe_value(hooks: &Hooks, value: JsValue, context: &mut Context) -> Option<String> {
    let description = hooks.describe.call(&JsValue::undefined(), &[value], context).ok()?;
    description.as_string().map(|s| s.to_std_string_escaped())
}

fn callable(value: &JsValue, name: &str) -> JsResult<JsObject> {
    value
        .as_callable()
        .cloned()
        .ok_or_else(|| {
            JsNativeError::typ()
                .with_message(format!("{name} is not a function"))
                .into()
        })
}

fn hook(hooks: &JsValue, name: &str, context: &mut Context) -> JsResult<JsObject> {
    let value = match hooks.as_object() {
        Some(hooks) => hooks.get(js_string!(name), context)?,
        None => JsValue::undefined(),
    };
    callable(&value, name)
}

// =============================================================================
// Host functions
// =============================================================================

fn register_files(context: &mut Context) -> JsResult<()> {
    let functions: [(&str, usize, HostFn); 3] = [
        ("readFile", 1, read_file),
        ("writeFile", 2, write_file),
        ("listFiles", 0, list_files),
    ];
    for (name, length, function) in functions {
        let function = NativeFunction::from_fn_ptr(function);
        let object = FunctionObjectBuilder::new(context.realm(), function)
            .name(js_string!(name))
            .length(length)
            .constructor(false)
            .build();
        context.register_global_property(
            js_string!(name),
            object,
            Attribute::READONLY | Attribute::NON_ENUMERABLE | Attribute::PERMANENT,
        )?;
    }
    Ok(())
}

fn path_arg(args: &[JsValue], function: &str) -> JsResult<String> {
    args.first()
        .and_then(|v| v.as_string())
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| {
            JsNativeError::typ()
                .with_message(format!("{function}() expects a path string"))
                .into()
        })
}

fn read_file(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    let path = path_arg(args, "readFile")?;
    let text = HOST
        .with_borrow(|host| {
            host.files
                .read(&path)
                .map(|data| String::from_utf8_lossy(data).into_owned())
        })
        .map_err(|e| JsNativeError::error().with_message(e.to_string()))?;
    Ok(JsValue::from(js_string!(text)))
}

fn write_file(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let path = path_arg(args, "writeFile")?;
    let data = match args.get(1) {
        Some(value) => value.to_string(ctx)?.to_std_string_escaped(),
        None => String::new(),
    };
    HOST.with_borrow_mut(|host| host.files.write(&path, data))
        .map_err(|e| JsNativeError::error().with_message(e.to_string()))?;
    Ok(JsValue::undefined())
}

fn list_files(_this: &JsValue, _args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let paths: Vec<JsValue> = HOST.with_borrow(|host| {
        host.files
            .paths()
            .map(|path| JsValue::from(js_string!(path)))
            .collect()
    });
    Ok(JsArray::from_iter(paths, ctx).into())
}

/// `schedule(ms, callback)`: call `callback` once `ms` have passed.
fn schedule(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let ms = match args.first() {
        Some(value) => value.to_number(ctx)?,
        None => 0.0,
    };
    let callback = args
        .get(1)
        .and_then(|v| v.as_callable())
        .cloned()
        .ok_or_else(|| JsNativeError::typ().with_message("schedule() expects a callback"))?;

    let after = if ms.is_nan() || ms <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(ms / 1000.0).map_or(MAX_DELAY, |after| after.min(MAX_DELAY))
    };
    HOST.with_borrow_mut(|host| {
        let seq = host.next_seq;
        host.next_seq += 1;
        host.timers.push(Timer {
            due: Instant::now() + after,
            seq,
            callback,
        });
    });
    Ok(JsValue::undefined())
}
