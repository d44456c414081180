//! Numeric built-ins.

use super::want_num;
use crate::{NativeCtx, NativeResult};

pub(crate) fn floor(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let n = want_num(ctx, 0)?;
    let ret = ctx.number(n.floor());
    ctx.ret(ret);
    Ok(())
}

pub(crate) fn ceil(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let n = want_num(ctx, 0)?;
    let ret = ctx.number(n.ceil());
    ctx.ret(ret);
    Ok(())
}

pub(crate) fn abs(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let n = want_num(ctx, 0)?;
    let ret = ctx.number(n.abs());
    ctx.ret(ret);
    Ok(())
}

pub(crate) fn sqrt(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let n = want_num(ctx, 0)?;
    let ret = ctx.number(n.sqrt());
    ctx.ret(ret);
    Ok(())
}

/// `min(a, ...)` — smallest of one or more numbers.
pub(crate) fn min(ctx: &mut NativeCtx<'_>) -> NativeResult {
    fold(ctx, f64::min)
}

/// `max(a, ...)` — largest of one or more numbers.
pub(crate) fn max(ctx: &mut NativeCtx<'_>) -> NativeResult {
    fold(ctx, f64::max)
}

fn fold(ctx: &mut NativeCtx<'_>, pick: fn(f64, f64) -> f64) -> NativeResult {
    if ctx.arg_count() == 0 {
        return Err(ctx.err("missing argument".to_string()));
    }
    let mut acc = want_num(ctx, 0)?;
    for i in 1..ctx.arg_count() {
        acc = pick(acc, want_num(ctx, i)?);
    }
    let ret = ctx.number(acc);
    ctx.ret(ret);
    Ok(())
}
