//! List built-ins.

use super::{want_list, want_num};
use crate::{NativeCtx, NativeResult};

/// `push(l, v, ...)` — appends the values and returns the list.
pub(crate) fn push(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let list = want_list(ctx, 0)?;
    for i in 1..ctx.arg_count() {
        let value = ctx.arg(i);
        ctx.rt.list_push(list, value);
    }
    ctx.ret(list);
    Ok(())
}

/// `pop(l, idx?)` — removes and returns the element at `idx` (default: the
/// last); `nil` when out of range.
pub(crate) fn pop(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let list = want_list(ctx, 0)?;
    let len = ctx.rt.get_length(list);
    let idx = if ctx.has_arg(1) {
        let n = want_num(ctx, 1)?;
        if n < 0.0 {
            ctx.ret(crate::Value::NIL);
            return Ok(());
        }
        n as usize
    } else if len == 0 {
        ctx.ret(crate::Value::NIL);
        return Ok(());
    } else {
        len - 1
    };
    let removed = ctx.rt.list_pop(list, idx);
    ctx.ret(removed);
    Ok(())
}

/// `insert(l, idx, v)` — inserts before `idx`; an index past the end appends.
pub(crate) fn insert(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let list = want_list(ctx, 0)?;
    let idx = want_num(ctx, 1)?.max(0.0) as usize;
    let value = ctx.arg(2);
    ctx.rt.list_insert(list, idx, value);
    ctx.ret(list);
    Ok(())
}

/// `remove(l, idx)` — deletes the element at `idx` and returns the list;
/// unlike `pop` the removed value is discarded. Out of range is a no-op.
pub(crate) fn remove(ctx: &mut NativeCtx<'_>) -> NativeResult {
    let list = want_list(ctx, 0)?;
    let idx = want_num(ctx, 1)?;
    if idx >= 0.0 {
        ctx.rt.list_pop(list, idx as usize);
    }
    ctx.ret(list);
    Ok(())
}
