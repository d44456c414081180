//! Core built-ins: printing, type inspection, errors, metatables, pcall.

use crate::{NativeCtx, NativeError, NativeResult, Value, ValueType};

/// Textual form of a value honoring the `__tostr` metatable hook.
fn stringify(ctx: &mut NativeCtx<'_>, value: Value) -> Result<String, NativeError> {
    let hook = ctx.rt.heap.meta_field(value, "__tostr");
    if hook.is_nil() {
        return Ok(ctx.rt.display_value(value));
    }
    let result = ctx.call(hook, &[value])?;
    match ctx.rt.get_string(result) {
        Some(s) => Ok(s.into_owned()),
        None => {
            let got = ctx.rt.heap.type_name(result);
            Err(ctx.err(format!("metamethod '__tostr' must return 'str', got '{got}'")))
        }
    }
}

/// `print(...)` — writes its arguments separated by tabs.
pub(crate) fn print(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let mut parts = Vec::with_capacity(ctx.arg_count());
    for i in 0..ctx.arg_count() {
        let arg = ctx.arg(i);
        parts.push(stringify(ctx, arg)?);
    }
    println!("{}", parts.join("\t"));
    Ok(())
}

/// `type(v)` — the type label, overridable per table via `__type`.
pub(crate) fn type_(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let value = ctx.arg(0);
    let hook = ctx.rt.heap.meta_field(value, "__type");
    let label = if hook.is_nil() {
        ctx.rt.heap.type_name(value).to_string()
    } else {
        match ctx.rt.get_string(hook) {
            Some(s) => s.into_owned(),
            None => {
                let got = ctx.rt.heap.type_name(hook);
                return Err(ctx.err(format!("metamethod '__type' must be 'str', got '{got}'")));
            }
        }
    };
    let ret = ctx.string(&label);
    ctx.ret(ret);
    Ok(())
}

/// `tostr(v)` — textual form, honoring `__tostr`.
pub(crate) fn tostr(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let value = ctx.arg(0);
    let text = stringify(ctx, value)?;
    let ret = ctx.string(&text);
    ctx.ret(ret);
    Ok(())
}

/// `tonum(v)` — parses a string (or passes a number through); `nil` on
/// failure.
pub(crate) fn tonum(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let value = ctx.arg(0);
    if ctx.rt.get_number(value).is_some() {
        ctx.ret(value);
        return Ok(());
    }
    let parsed = ctx
        .rt
        .get_string(value)
        .and_then(|s| s.trim().parse::<f64>().ok());
    let ret = match parsed {
        Some(n) => ctx.number(n),
        None => Value::NIL,
    };
    ctx.ret(ret);
    Ok(())
}

/// `len(v)` — byte length of strings, entry count of tables (overridable via
/// `__len`), element count of lists.
pub(crate) fn len(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let value = ctx.arg(0);
    let hook = ctx.rt.heap.meta_field(value, "__len");
    if !hook.is_nil() {
        let result = ctx.call(hook, &[value])?;
        let Some(n) = ctx.rt.get_number(result) else {
            let got = ctx.rt.heap.type_name(result);
            return Err(ctx.err(format!("metamethod '__len' must return 'num', got '{got}'")));
        };
        let ret = ctx.number(n);
        ctx.ret(ret);
        return Ok(());
    }
    match ctx.rt.type_of(value) {
        ValueType::Str | ValueType::Table | ValueType::List => {
            let n = ctx.rt.get_length(value) as f64;
            let ret = ctx.number(n);
            ctx.ret(ret);
            Ok(())
        }
        other => Err(ctx.err(format!("unable to get length of '{other}'"))),
    }
}

/// `id(v)` — the value's identity; 0 for the singletons.
pub(crate) fn id(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let value = ctx.arg(0);
    let identity = ctx.rt.id_of(value) as f64;
    let ret = ctx.number(identity);
    ctx.ret(ret);
    Ok(())
}

/// `error(msg)` — raises with exactly the given message.
pub(crate) fn error(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let value = ctx.arg(0);
    let message = match ctx.rt.get_string(value) {
        Some(s) => s.into_owned(),
        None => ctx.rt.display_value(value),
    };
    Err(ctx.err(message))
}

/// `assert(cond, msg?)` — raises when the condition is falsy; passes the
/// condition through otherwise.
pub(crate) fn assert(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let cond = ctx.arg(0);
    if ctx.rt.heap.truthy(cond) {
        ctx.ret(cond);
        return Ok(());
    }
    let message = if ctx.has_arg(1) {
        let msg = ctx.arg(1);
        match ctx.rt.get_string(msg) {
            Some(s) => s.into_owned(),
            None => ctx.rt.display_value(msg),
        }
    } else {
        "assertion failed!".to_string()
    };
    Err(ctx.err(message))
}

/// `pcall(f, ...)` — protected call: `true, results...` on success,
/// `false, message` on error, leaving the task resumable.
pub(crate) fn pcall(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let func = ctx.arg(0);
    let args: Vec<Value> = (1..ctx.arg_count()).map(|i| ctx.arg(i)).collect();
    match ctx.protected_call(func, &args) {
        Ok(result) => {
            let mut values = vec![Value::TRUE];
            let count = ctx.rt.tuple_len(result);
            for i in 0..count {
                values.push(ctx.rt.tuple_get(result, i));
            }
            ctx.ret_many(&values);
        }
        Err(message) => {
            let msg = ctx.string(&message);
            ctx.ret_many(&[Value::FALSE, msg]);
        }
    }
    Ok(())
}

/// `setmetatable(t, m)` — attaches a metatable (or clears it with `nil`) and
/// returns the table.
pub(crate) fn setmetatable(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let table = ctx.arg(0);
    let meta = ctx.arg(1);
    if ctx.rt.type_of(table) != ValueType::Table {
        let got = ctx.rt.heap.type_name(table);
        return Err(ctx.err(format!("'table' expected, got '{got}'")));
    }
    if !meta.is_nil() && ctx.rt.type_of(meta) != ValueType::Table {
        let got = ctx.rt.heap.type_name(meta);
        return Err(ctx.err(format!("'table' expected, got '{got}'")));
    }
    ctx.rt.set_metatable(table, meta);
    ctx.ret(table);
    Ok(())
}

/// `getmetatable(t)` — the metatable, shielded by `__metatable`.
pub(crate) fn getmetatable(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let table = ctx.arg(0);
    let meta = ctx.rt.get_metatable(table);
    ctx.ret(meta);
    Ok(())
}

/// `pause()` — cooperative yield back to the host.
pub(crate) fn pause(ctx: &mut NativeCtx<'_>) -> NativeResult {
    ctx.pause();
    Ok(())
}
