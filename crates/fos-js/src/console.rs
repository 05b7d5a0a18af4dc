//! Console API
//!
//! Implements console.log, console.warn, console.error, etc. Output goes to
//! `tracing`, tagged with the engine that produced it.

use crate::EngineId;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Value};
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

/// Install console API into the global object
pub fn install_console(ctx: &Ctx, engine_id: EngineId) -> Result<(), rquickjs::Error> {
    let console = Object::new(ctx.clone())?;

    for (name, level) in [
        ("log", Level::Log),
        ("info", Level::Info),
        ("warn", Level::Warn),
        ("error", Level::Error),
        ("debug", Level::Debug),
    ] {
        console.set(
            name,
            Function::new(ctx.clone(), move |args: Rest<Value>| {
                log_with_level(engine_id, level, &args.0);
                Ok::<(), rquickjs::Error>(())
            })?,
        )?;
    }

    ctx.globals().set("console", console)?;

    Ok(())
}

/// Log values with a specific level
fn log_with_level(engine_id: EngineId, level: Level, values: &[Value]) {
    let output = format_args_line(values);

    match level {
        Level::Error => tracing::error!(engine_id, "[JS] {}", output),
        Level::Warn => tracing::warn!(engine_id, "[JS] {}", output),
        Level::Debug => tracing::debug!(engine_id, "[JS] {}", output),
        Level::Log | Level::Info => tracing::info!(engine_id, "[JS] {}", output),
    }
}

/// Join console arguments the way browsers do: space separated
fn format_args_line(values: &[Value]) -> String {
    let mut output = String::new();

    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            output.push(' ');
        }
        format_value(&mut output, value);
    }

    output
}

/// Format a JavaScript value for logging
fn format_value(out: &mut String, value: &Value) {
    if value.is_undefined() {
        out.push_str("undefined");
    } else if value.is_null() {
        out.push_str("null");
    } else if let Some(b) = value.as_bool() {
        write!(out, "{}", b).ok();
    } else if let Some(n) = value.as_int() {
        write!(out, "{}", n).ok();
    } else if let Some(n) = value.as_float() {
        write!(out, "{}", n).ok();
    } else if let Some(s) = value.as_string() {
        if let Ok(s) = s.to_string() {
            out.push_str(&s);
        }
    } else if value.is_array() {
        out.push_str("[Array]");
    } else if value.is_function() {
        out.push_str("[Function]");
    } else if value.is_object() {
        out.push_str("[Object]");
    } else {
        out.push_str("[unknown]");
    }
}
