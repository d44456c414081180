//! End-to-end script execution tests: compile, install the standard library,
//! resume, and inspect the main body's return value through the host API.

use pretty_assertions::assert_eq;
use tug::{Runtime, TaskId, TaskState, Value, ValueType, stdlib};

fn run(src: &str) -> (Runtime, TaskId) {
    let mut rt = Runtime::new();
    let task = rt.compile("test.tug", src).expect("compile");
    stdlib::install(&mut rt, task);
    rt.resume(task);
    assert_eq!(rt.state(task), TaskState::Ended, "script failed: {}", rt.error_traceback(task));
    (rt, task)
}

fn run_number(src: &str) -> f64 {
    let (rt, task) = run(src);
    let result = rt.result(task);
    rt.get_number(result)
        .unwrap_or_else(|| panic!("expected number result, got {:?}", rt.type_of(result)))
}

fn run_string(src: &str) -> String {
    let (rt, task) = run(src);
    let result = rt.result(task);
    rt.get_string(result).expect("string result").into_owned()
}

// ---------------------------------------------------------------------------
// literals, arithmetic, precedence
// ---------------------------------------------------------------------------

/// Arithmetic precedence: multiplication binds tighter than addition.
#[test]
fn arith_precedence() {
    assert_eq!(run_number("x := 1 + 2 * 3 return x"), 7.0);
    assert_eq!(run_number("return (1 + 2) * 3"), 9.0);
    assert_eq!(run_number("return 10 - 2 - 3"), 5.0);
    assert_eq!(run_number("return 7 % 4"), 3.0);
}

#[test]
fn unary_operators() {
    assert_eq!(run_number("return -5 + 8"), 3.0);
    assert_eq!(run_number("x := 4 return -x"), -4.0);
    assert_eq!(run_number("return +7"), 7.0);
}

#[test]
fn number_literal_shapes() {
    assert_eq!(run_number("return .5 + 5."), 5.5);
    assert_eq!(run_number("return 12.25"), 12.25);
}

#[test]
fn string_concat_and_compare() {
    assert_eq!(run_string(r#"return "foo" + "bar""#), "foobar");
    let (rt, task) = run(r#"return "abc" < "abd""#);
    assert_eq!(rt.result(task), Value::TRUE);
    let (rt, task) = run(r#"return "b" >= "a""#);
    assert_eq!(rt.result(task), Value::TRUE);
}

#[test]
fn equality_semantics() {
    let (rt, task) = run(r#"return "ab" == "ab""#);
    assert_eq!(rt.result(task), Value::TRUE);
    let (rt, task) = run("return 1 == 1.0");
    assert_eq!(rt.result(task), Value::TRUE);
    // tables compare by identity
    let (rt, task) = run("a := {} b := {} return a == b");
    assert_eq!(rt.result(task), Value::FALSE);
    let (rt, task) = run("a := {} b := a return a == b");
    assert_eq!(rt.result(task), Value::TRUE);
    let (rt, task) = run("return 1 != 2");
    assert_eq!(rt.result(task), Value::TRUE);
}

// ---------------------------------------------------------------------------
// truthiness and short-circuit
// ---------------------------------------------------------------------------

/// `nil`, `false`, `0`, the empty string and the empty list are falsy;
/// empty tables are truthy.
#[test]
fn truthiness_table() {
    assert_eq!(run_number("if 0 then return 1 else return 2 end"), 2.0);
    assert_eq!(run_number(r#"if "" then return 1 else return 2 end"#), 2.0);
    assert_eq!(run_number("if [] then return 1 else return 2 end"), 2.0);
    assert_eq!(run_number("if {} then return 1 else return 2 end"), 1.0);
    assert_eq!(run_number("if nil then return 1 else return 2 end"), 2.0);
    assert_eq!(run_number("if false then return 1 else return 2 end"), 2.0);
    assert_eq!(run_number(r#"if "x" then return 1 else return 2 end"#), 1.0);
}

/// `and`/`or` return one of their operands, evaluating the right side only
/// when needed.
#[test]
fn short_circuit_values() {
    assert_eq!(run_number("return 2 and 3"), 3.0);
    assert_eq!(run_number("return 0 and 3"), 0.0);
    assert_eq!(run_number("return 0 or 9"), 9.0);
    assert_eq!(run_number("return 7 or 9"), 7.0);
    // the right side must not run when short-circuited
    assert_eq!(run_number("hits := 0 bump := func() hits = hits + 1 return true end x := false and bump() return hits"), 0.0);
    assert_eq!(run_number("hits := 0 bump := func() hits = hits + 1 return true end x := true or bump() return hits"), 0.0);
}

#[test]
fn not_inverts_truthiness() {
    let (rt, task) = run("return not 0");
    assert_eq!(rt.result(task), Value::TRUE);
    let (rt, task) = run("return not {}");
    assert_eq!(rt.result(task), Value::FALSE);
}

// ---------------------------------------------------------------------------
// control flow
// ---------------------------------------------------------------------------

#[test]
fn if_elseif_else() {
    let pick = |n: i32| {
        run_number(&format!(
            "x := {n} if x == 1 then return 10 elseif x == 2 then return 20 elseif x == 3 then return 30 else return 40 end"
        ))
    };
    assert_eq!(pick(1), 10.0);
    assert_eq!(pick(2), 20.0);
    assert_eq!(pick(3), 30.0);
    assert_eq!(pick(9), 40.0);
}

#[test]
fn while_loop_with_break_and_continue() {
    let src = "
        i := 0
        sum := 0
        while true do
            i = i + 1
            if i > 5 then break end
            if i % 2 == 0 then continue end
            sum = sum + i
        end
        return sum
    ";
    assert_eq!(run_number(src), 9.0);
}

#[test]
fn nested_loops_break_only_inner() {
    let src = "
        total := 0
        i := 0
        while i < 3 do
            i = i + 1
            j := 0
            while true do
                j = j + 1
                if j == 2 then break end
            end
            total = total + j
        end
        return total
    ";
    assert_eq!(run_number(src), 6.0);
}

/// Block scopes: a `:=` inside a block shadows; `=` rebinds the outer one.
#[test]
fn block_scoping_rules() {
    let src = "
        x := 1
        if true then
            x := 99
        end
        return x
    ";
    assert_eq!(run_number(src), 1.0);
    let src = "
        x := 1
        if true then
            x = 99
        end
        return x
    ";
    assert_eq!(run_number(src), 99.0);
}

/// `=` on a name unbound anywhere lands in the outermost scope and survives
/// the block it was written in.
#[test]
fn plain_assign_escapes_block() {
    let src = "
        if true then
            fresh = 5
        end
        return fresh
    ";
    assert_eq!(run_number(src), 5.0);
}

// ---------------------------------------------------------------------------
// functions, closures, multi-value returns
// ---------------------------------------------------------------------------

#[test]
fn recursion_factorial() {
    let src = "f := func(x) if x <= 1 then return 1 end return x * f(x - 1) end return f(5)";
    assert_eq!(run_number(src), 120.0);
}

#[test]
fn named_function_statement() {
    assert_eq!(run_number("func double(n) return n * 2 end return double(21)"), 42.0);
}

#[test]
fn dotted_function_names_assign_into_tables() {
    let src = "
        t := {}
        func t.area(w, h) return w * h end
        return t.area(6, 7)
    ";
    assert_eq!(run_number(src), 42.0);
}

#[test]
fn closures_capture_their_definition_scope() {
    let src = "
        make := func()
            count := 0
            return func()
                count = count + 1
                return count
            end
        end
        c := make()
        c()
        c()
        return c()
    ";
    assert_eq!(run_number(src), 3.0);
}

#[test]
fn two_closures_share_one_upvalue() {
    let src = "
        make := func()
            n := 0
            bump := func() n = n + 1 return n end
            read := func() return n end
            r := {}
            r.bump = bump
            r.read = read
            return r
        end
        p := make()
        p.bump()
        p.bump()
        return p.read()
    ";
    assert_eq!(run_number(src), 2.0);
}

/// Missing arguments bind `nil`; extra arguments are ignored.
#[test]
fn parameter_binding_edges() {
    let src = "f := func(a, b) if b == nil then return 1 else return 2 end end return f(5)";
    assert_eq!(run_number(src), 1.0);
    assert_eq!(run_number("f := func(a) return a end return f(1, 2, 3)"), 1.0);
}

#[test]
fn multi_value_return_to_targets() {
    let (rt, task) = run("f := func() return 1, 2 end a, b := f() return a, b");
    let result = rt.result(task);
    assert_eq!(rt.tuple_len(result), 2);
    assert_eq!(rt.get_number(rt.tuple_get(result, 0)), Some(1.0));
    assert_eq!(rt.get_number(rt.tuple_get(result, 1)), Some(2.0));
}

/// Values right-align against the target list: short value lists pad leading
/// targets with `nil`, long tuples drop their leading values.
#[test]
fn multi_assign_right_alignment() {
    let (rt, task) = run("a, b := 1 return a, b");
    let result = rt.result(task);
    assert!(rt.tuple_get(result, 0).is_nil());
    assert_eq!(rt.get_number(rt.tuple_get(result, 1)), Some(1.0));

    let (rt, task) = run("f := func() return 1, 2, 3 end a, b := f() return a, b");
    let result = rt.result(task);
    assert_eq!(rt.get_number(rt.tuple_get(result, 0)), Some(2.0));
    assert_eq!(rt.get_number(rt.tuple_get(result, 1)), Some(3.0));

    // a single target keeps a tuple's last value
    assert_eq!(run_number("f := func() return 1, 2, 3 end a := f() return a"), 3.0);
}

#[test]
fn multi_assign_swap() {
    let (rt, task) = run("a, b := 1, 2 a, b = b, a return a, b");
    let result = rt.result(task);
    assert_eq!(rt.get_number(rt.tuple_get(result, 0)), Some(2.0));
    assert_eq!(rt.get_number(rt.tuple_get(result, 1)), Some(1.0));
}

// ---------------------------------------------------------------------------
// tables and lists
// ---------------------------------------------------------------------------

#[test]
fn table_fields_and_chained_reads() {
    assert_eq!(run_number("t := {} t.a = 1 t.b = t.a + 2 return t.b"), 3.0);
    assert_eq!(run_number(r#"t := {} t["k"] = 7 return t.k"#), 7.0);
}

/// Bare table-literal entries are keyed by their 0-based source position,
/// leaving holes after named entries.
#[test]
fn table_literal_positional_keys() {
    let (mut rt, task) = run("t := {a = 1, 2, 3} return t");
    let t = rt.result(task);
    let k0 = rt.number(0.0);
    let k1 = rt.number(1.0);
    let k2 = rt.number(2.0);
    assert_eq!(rt.get_number(rt.get_field(t, k1)), Some(2.0));
    assert_eq!(rt.get_number(rt.get_field(t, k2)), Some(3.0));
    // position 0 held the named entry, so numeric key 0 is a hole
    assert!(rt.get_field(t, k0).is_nil());
    let a = rt.string("a");
    assert_eq!(rt.get_number(rt.get_field(t, a)), Some(1.0));
}

#[test]
fn writing_nil_removes_table_entries() {
    let src = "
        t := {}
        t.a = 1
        t.a = nil
        count := 0
        for k in t do count = count + 1 end
        return count
    ";
    assert_eq!(run_number(src), 0.0);
}

#[test]
fn absent_table_keys_read_nil() {
    let (rt, task) = run("t := {} return t.missing == nil");
    assert_eq!(rt.result(task), Value::TRUE);
}

#[test]
fn list_literals_and_indexing() {
    assert_eq!(run_number("l := [10, 20, 30] return l[1]"), 20.0);
    assert_eq!(run_number("l := [10] l[0] = 99 return l[0]"), 99.0);
    // out-of-range reads are nil
    let (rt, task) = run("l := [10] return l[5] == nil and l[0 - 1] == nil");
    assert_eq!(rt.result(task), Value::TRUE);
}

/// 0-based byte indexing; out of range (including `i == len`) reads `nil`.
#[test]
fn string_indexing() {
    assert_eq!(run_string(r#"s := "abc" return s[0]"#), "a");
    assert_eq!(run_string(r#"s := "abc" return s[2]"#), "c");
    let (rt, task) = run(r#"s := "abc" return s[3] == nil and s[0 - 1] == nil"#);
    assert_eq!(rt.result(task), Value::TRUE);
}

// ---------------------------------------------------------------------------
// iteration
// ---------------------------------------------------------------------------

#[test]
fn for_over_list() {
    assert_eq!(run_number("sum := 0 for i in [10, 20, 30] do sum = sum + i end return sum"), 60.0);
}

#[test]
fn for_over_string_yields_byte_substrings() {
    let src = r#"
        out := ""
        for c in "abc" do out = c + out end
        return out
    "#;
    assert_eq!(run_string(src), "cba");
}

#[test]
fn for_over_table_yields_keys_and_values() {
    let src = "
        t := {x = 1, y = 2, z = 4}
        count := 0
        sum := 0
        for k, v in t do
            count = count + 1
            sum = sum + v
        end
        return count, sum
    ";
    let (rt, task) = run(src);
    let result = rt.result(task);
    assert_eq!(rt.get_number(rt.tuple_get(result, 0)), Some(3.0));
    assert_eq!(rt.get_number(rt.tuple_get(result, 1)), Some(7.0));
}

#[test]
fn for_single_name_over_table_binds_keys() {
    let src = r#"
        t := {only = 1}
        found := ""
        for k in t do found = k end
        return found
    "#;
    assert_eq!(run_string(src), "only");
}

#[test]
fn break_and_continue_in_for() {
    let src = "
        sum := 0
        for i in [1, 2, 3, 4, 5] do
            if i == 2 then continue end
            if i == 5 then break end
            sum = sum + i
        end
        return sum
    ";
    assert_eq!(run_number(src), 8.0);
}

#[test]
fn empty_iterables_skip_the_body() {
    assert_eq!(run_number(r#"n := 0 for c in "" do n = n + 1 end return n"#), 0.0);
    assert_eq!(run_number("n := 0 for x in [] do n = n + 1 end return n"), 0.0);
    assert_eq!(run_number("n := 0 for k in {} do n = n + 1 end return n"), 0.0);
}

// ---------------------------------------------------------------------------
// metatables
// ---------------------------------------------------------------------------

#[test]
fn metatable_add_hook() {
    let src = "
        mt := { __add = func(a, b) return a.v + b.v end }
        a := setmetatable({v = 2}, mt)
        b := setmetatable({v = 3}, mt)
        return a + b
    ";
    assert_eq!(run_number(src), 5.0);
}

/// The right operand's metatable is consulted when the left has none.
#[test]
fn metatable_add_hook_on_right_operand() {
    let src = "
        mt := { __add = func(a, b) return b.v + 1 end }
        b := setmetatable({v = 9}, mt)
        return 1 + b
    ";
    assert_eq!(run_number(src), 10.0);
}

#[test]
fn metatable_relational_hook_returns_bool() {
    let src = "
        mt := { __lt = func(a, b) return a.v < b.v end }
        a := setmetatable({v = 1}, mt)
        b := setmetatable({v = 2}, mt)
        return a < b
    ";
    let (rt, task) = run(src);
    assert_eq!(rt.result(task), Value::TRUE);
}

#[test]
fn metatable_eq_hook() {
    let src = "
        mt := { __eq = func(a, b) return true end }
        a := setmetatable({}, mt)
        b := {}
        return a == b
    ";
    let (rt, task) = run(src);
    assert_eq!(rt.result(task), Value::TRUE);
}

#[test]
fn metatable_call_hook() {
    let src = "
        callable := setmetatable({factor = 2}, { __call = func(self, x) return x * self.factor end })
        return callable(21)
    ";
    assert_eq!(run_number(src), 42.0);
}

#[test]
fn metatable_get_and_set_hooks() {
    let src = "
        backing := {}
        proxy := setmetatable({}, {
            __get = func(t, k) return 42 end,
            __set = func(t, k, v) backing[k] = v end,
        })
        proxy.a = 7
        return proxy.anything, backing.a
    ";
    let (rt, task) = run(src);
    let result = rt.result(task);
    assert_eq!(rt.get_number(rt.tuple_get(result, 0)), Some(42.0));
    assert_eq!(rt.get_number(rt.tuple_get(result, 1)), Some(7.0));
}

#[test]
fn metatable_neg_and_truth_hooks() {
    let src = "
        v := setmetatable({n = 5}, { __neg = func(t) return 0 - t.n end })
        return -v
    ";
    assert_eq!(run_number(src), -5.0);
    let (rt, task) = run("f := setmetatable({}, { __truth = func(t) return false end }) return not f");
    assert_eq!(rt.result(task), Value::TRUE);
}

#[test]
fn metatable_iter_hook() {
    let src = "
        wrapped := setmetatable({}, { __iter = func(t) return [1, 2, 3] end })
        sum := 0
        for x in wrapped do sum = sum + x end
        return sum
    ";
    assert_eq!(run_number(src), 6.0);
}

#[test]
fn metatable_next_hook_drives_iteration() {
    let src = "
        counter := setmetatable({i = 0}, {
            __next = func(it)
                it.i = it.i + 1
                if it.i > 3 then return false end
                return true, it.i
            end,
        })
        sum := 0
        for x in counter do sum = sum + x end
        return sum
    ";
    assert_eq!(run_number(src), 6.0);
}

#[test]
fn metatable_tostr_type_and_len() {
    assert_eq!(
        run_string(r#"t := setmetatable({}, { __tostr = func(t) return "fancy" end }) return tostr(t)"#),
        "fancy"
    );
    assert_eq!(
        run_string(r#"t := setmetatable({}, { __type = "widget" }) return type(t)"#),
        "widget"
    );
    assert_eq!(
        run_number("t := setmetatable({}, { __len = func(t) return 11 end }) return len(t)"),
        11.0
    );
}

#[test]
fn metatable_shield_hides_the_metatable() {
    let src = r#"
        mt := { __metatable = "locked" }
        t := setmetatable({}, mt)
        return getmetatable(t)
    "#;
    assert_eq!(run_string(src), "locked");
}

// ---------------------------------------------------------------------------
// standard library surface
// ---------------------------------------------------------------------------

#[test]
fn stdlib_type_and_tostr() {
    assert_eq!(run_string("return type(1)"), "num");
    assert_eq!(run_string(r#"return type("x")"#), "str");
    assert_eq!(run_string("return type(nil)"), "nil");
    assert_eq!(run_string("return type({})"), "table");
    assert_eq!(run_string("return type([])"), "list");
    assert_eq!(run_string("return type(true)"), "bool");
    assert_eq!(run_string("return type(print)"), "func");
    assert_eq!(run_string("return tostr(7)"), "7");
    assert_eq!(run_string("return tostr(0.5)"), "0.5");
    assert_eq!(run_string("return tostr(true)"), "true");
    assert_eq!(run_string("return tostr(nil)"), "nil");
}

#[test]
fn stdlib_tonum_len_math() {
    assert_eq!(run_number(r#"return tonum("12.5")"#), 12.5);
    let (rt, task) = run(r#"return tonum("garbage") == nil"#);
    assert_eq!(rt.result(task), Value::TRUE);
    assert_eq!(run_number(r#"return len("abcd")"#), 4.0);
    assert_eq!(run_number("return len([1, 2, 3])"), 3.0);
    assert_eq!(run_number("return len({a = 1, b = 2})"), 2.0);
    assert_eq!(run_number("return floor(2.7) + ceil(2.2)"), 5.0);
    assert_eq!(run_number("return abs(0 - 4)"), 4.0);
    assert_eq!(run_number("return sqrt(81)"), 9.0);
    assert_eq!(run_number("return min(3, 1, 2)"), 1.0);
    assert_eq!(run_number("return max(3, 1, 2)"), 3.0);
}

#[test]
fn stdlib_string_helpers() {
    assert_eq!(run_string(r#"return upper("tug7")"#), "TUG7");
    assert_eq!(run_string(r#"return lower("TuG")"#), "tug");
    assert_eq!(run_string(r#"return sub("hello", 1, 3)"#), "el");
    assert_eq!(run_string(r#"return sub("hello", 3)"#), "lo");
    assert_eq!(run_number(r#"return find("hello", "ll")"#), 2.0);
    let (rt, task) = run(r#"return find("hello", "xyz") == nil"#);
    assert_eq!(rt.result(task), Value::TRUE);
    assert_eq!(run_number(r#"return byte("A")"#), 65.0);
    assert_eq!(run_string("return char(104, 105)"), "hi");
}

#[test]
fn stdlib_list_helpers() {
    assert_eq!(run_number("l := [1] push(l, 2, 3) return len(l)"), 3.0);
    assert_eq!(run_number("l := [1, 2, 3] return pop(l)"), 3.0);
    assert_eq!(run_number("l := [1, 2, 3] pop(l, 0) return l[0]"), 2.0);
    assert_eq!(run_number("l := [1, 3] insert(l, 1, 2) return l[1]"), 2.0);
    // remove deletes in place and hands the list back, unlike pop
    assert_eq!(run_number("l := [1, 2, 3] return len(remove(l, 1))"), 2.0);
    assert_eq!(run_number("l := [1, 2, 3] remove(l, 1) return l[1]"), 3.0);
    assert_eq!(run_number("l := [1] remove(l, 9) return len(l)"), 1.0);
}

#[test]
fn stdlib_assert_passes_value_through() {
    assert_eq!(run_number("return assert(5)"), 5.0);
}

/// pcall returns `false, message` and leaves the task resumable enough to
/// keep executing and even pcall again.
#[test]
fn pcall_catches_and_recovers() {
    let src = r#"
        ok, msg := pcall(func() error("boom") end)
        ok2, v := pcall(func() return 7 end)
        return ok, msg, ok2, v
    "#;
    let (rt, task) = run(src);
    let result = rt.result(task);
    assert_eq!(rt.tuple_get(result, 0), Value::FALSE);
    assert_eq!(rt.get_string(rt.tuple_get(result, 1)).as_deref(), Some("boom"));
    assert_eq!(rt.tuple_get(result, 2), Value::TRUE);
    assert_eq!(rt.get_number(rt.tuple_get(result, 3)), Some(7.0));
}

#[test]
fn pcall_of_non_function_reports_error() {
    let (rt, task) = run("ok, msg := pcall(42) return ok, msg");
    let result = rt.result(task);
    assert_eq!(rt.tuple_get(result, 0), Value::FALSE);
    assert_eq!(rt.get_string(rt.tuple_get(result, 1)).as_deref(), Some("unable to call 'num'"));
}

// ---------------------------------------------------------------------------
// results as seen by the host
// ---------------------------------------------------------------------------

#[test]
fn result_types_round_trip() {
    let (rt, task) = run("return");
    assert!(rt.result(task).is_nil());
    let (rt, task) = run("return true");
    assert_eq!(rt.result(task), Value::TRUE);
    let (rt, task) = run(r#"return "done""#);
    assert_eq!(rt.type_of(rt.result(task)), ValueType::Str);
    // a script with no return ends with a nil result
    let (rt, task) = run("x := 1");
    assert!(rt.result(task).is_nil());
}
