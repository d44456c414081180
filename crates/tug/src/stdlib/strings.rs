//! String built-ins. All positions are 0-based byte indices; case mapping is
//! ASCII-only since strings are byte sequences.

use super::{want_num, want_str};
use crate::{NativeCtx, NativeResult, Value};

pub(crate) fn upper(ctx: &mut NativeCtx<'_>) -> NativeResult {
    map_bytes(ctx, |b| b.to_ascii_uppercase())
}

pub(crate) fn lower(ctx: &mut NativeCtx<'_>) -> NativeResult {
    map_bytes(ctx, |b| b.to_ascii_lowercase())
}

fn map_bytes(ctx: &mut NativeCtx<'_>, f: fn(&u8) -> u8) -> NativeResult {
    let arg = ctx.arg(0);
    let Some(bytes) = ctx.rt.get_string_bytes(arg) else {
        let got = ctx.rt.heap.type_name(arg);
        return Err(ctx.err(format!("'str' expected, got '{got}'")));
    };
    let mapped: Vec<u8> = bytes.iter().map(f).collect();
    let ret = ctx.rt.string_from_bytes(&mapped);
    ctx.ret(ret);
    Ok(())
}

/// `sub(s, from, to?)` — byte range `[from, to)`, clamped to the string.
pub(crate) fn sub(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let s = want_str(ctx, 0)?;
    let bytes = s.as_bytes();
    let from = (want_num(ctx, 1)?.max(0.0) as usize).min(bytes.len());
    let to = if ctx.has_arg(2) {
        (want_num(ctx, 2)?.max(0.0) as usize).min(bytes.len())
    } else {
        bytes.len()
    };
    let slice = if from < to { &bytes[from..to] } else { &[][..] };
    let ret = ctx.rt.string_from_bytes(slice);
    ctx.ret(ret);
    Ok(())
}

/// `find(s, needle)` — first byte offset of the needle, or `nil`.
pub(crate) fn find(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let haystack = want_str(ctx, 0)?;
    let needle = want_str(ctx, 1)?;
    let hay = haystack.as_bytes();
    let pat = needle.as_bytes();
    let found = if pat.is_empty() {
        Some(0)
    } else {
        hay.windows(pat.len()).position(|window| window == pat)
    };
    let ret = match found {
        Some(idx) => ctx.number(idx as f64),
        None => Value::NIL,
    };
    ctx.ret(ret);
    Ok(())
}

/// `byte(s, i?)` — the byte value at an index, or `nil` out of range.
pub(crate) fn byte(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let s = want_str(ctx, 0)?;
    let idx = if ctx.has_arg(1) { want_num(ctx, 1)? } else { 0.0 };
    let ret = if idx >= 0.0 && (idx as usize) < s.len() {
        let b = s.as_bytes()[idx as usize];
        ctx.number(f64::from(b))
    } else {
        Value::NIL
    };
    ctx.ret(ret);
    Ok(())
}

/// `char(b, ...)` — builds a string from byte values.
pub(crate) fn char_(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let mut bytes = Vec::with_capacity(ctx.arg_count());
    for i in 0..ctx.arg_count() {
        bytes.push(want_num(ctx, i)? as u8);
    }
    let ret = ctx.rt.string_from_bytes(&bytes);
    ctx.ret(ret);
    Ok(())
}
