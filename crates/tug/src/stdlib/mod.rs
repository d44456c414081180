//! The standard library of built-in functions.
//!
//! Built-ins are ordinary native callbacks registered into a task's global
//! scope, so scripts reach them through the global-fallback lookup and hosts
//! can freely replace or extend them. Grouped one concern per module:
//! [`core`] (types, errors, metatables, pcall), [`math`], [`strings`] and
//! [`lists`].

mod core;
mod lists;
mod math;
mod strings;

use crate::{NativeCtx, NativeError, Runtime, TaskId, Value};

/// Installs the full standard library into a task's globals.
pub fn install(rt: &mut Runtime, task: TaskId) {
    let register: &[(&str, fn(&mut NativeCtx<'_>) -> crate::NativeResult)] = &[
        ("print", core::print),
        ("type", core::type_),
        ("tostr", core::tostr),
        ("tonum", core::tonum),
        ("len", core::len),
        ("id", core::id),
        ("error", core::error),
        ("assert", core::assert),
        ("pcall", core::pcall),
        ("setmetatable", core::setmetatable),
        ("getmetatable", core::getmetatable),
        ("pause", core::pause),
        ("floor", math::floor),
        ("ceil", math::ceil),
        ("abs", math::abs),
        ("sqrt", math::sqrt),
        ("min", math::min),
        ("max", math::max),
        ("upper", strings::upper),
        ("lower", strings::lower),
        ("sub", strings::sub),
        ("find", strings::find),
        ("byte", strings::byte),
        ("char", strings::char_),
        ("push", lists::push),
        ("pop", lists::pop),
        ("insert", lists::insert),
        ("remove", lists::remove),
    ];
    for &(name, f) in register {
        let func = rt.native_fn(name, f);
        rt.set_global(task, name, func);
    }
}

/// Checks an argument's number payload, failing with the shared
/// `'num' expected` message.
pub(crate) fn want_num(ctx: &mut NativeCtx<'_>, i: usize) -> Result<f64, NativeError> {
    let arg = ctx.arg(i);
    match ctx.runtime().get_number(arg) {
        Some(n) => Ok(n),
        None => {
            let got = ctx.runtime().type_of(arg).to_string();
            Err(ctx.err(format!("'num' expected, got '{got}'")))
        }
    }
}

/// Checks an argument's string payload (lossy UTF-8 copy).
pub(crate) fn want_str(ctx: &mut NativeCtx<'_>, i: usize) -> Result<String, NativeError> {
    let arg = ctx.arg(i);
    match ctx.runtime().get_string(arg) {
        Some(s) => Ok(s.into_owned()),
        None => {
            let got = ctx.runtime().type_of(arg).to_string();
            Err(ctx.err(format!("'str' expected, got '{got}'")))
        }
    }
}

/// Checks that an argument is a list, returning it unchanged.
pub(crate) fn want_list(ctx: &mut NativeCtx<'_>, i: usize) -> Result<Value, NativeError> {
    let arg = ctx.arg(i);
    if ctx.runtime().type_of(arg) == crate::ValueType::List {
        Ok(arg)
    } else {
        let got = ctx.runtime().type_of(arg).to_string();
        Err(ctx.err(format!("'list' expected, got '{got}'")))
    }
}
