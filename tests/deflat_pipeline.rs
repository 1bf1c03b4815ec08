//! End-to-end pipeline tests: parse, walk, reduce, structure, emit.

use js_deflat::solver::{EnumerationBackend, NullBackend};
use js_deflat::Deflattener;

fn deflatten(source: &str, line: usize) -> Option<String> {
    let mut deflattener = Deflattener::new(Box::new(EnumerationBackend::new()));
    deflattener
        .deflatten(source, line)
        .expect("pipeline must succeed")
}

const IF_ELSE_DISPATCHER: &str = "\
for (var k = 1; void 0 !== k; ) {
    var j = k;
    switch (j) {
        case 1:
            init();
            k = c() ? 2 : 3;
            break;
        case 2:
            t();
            k = 4;
            break;
        case 3:
            f();
            k = 4;
            break;
        case 4:
            done();
            k = void 0;
    }
}
";

#[test]
fn test_if_else_recovery_merges_join_block() {
    let output = deflatten(IF_ELSE_DISPATCHER, 1).expect("dispatcher must match");
    assert!(output.contains("if (c())"), "missing branch: {output}");
    assert!(output.contains("else"), "missing else branch: {output}");
    assert!(!output.contains("switch"), "dispatcher survived: {output}");
    assert!(!output.contains("for ("), "dispatcher loop survived: {output}");

    // Both paths assign k = 4, so the join block must appear exactly once.
    for call in ["init()", "t()", "f()", "done()"] {
        assert_eq!(
            output.matches(call).count(),
            1,
            "{call} must appear exactly once: {output}"
        );
    }

    // init runs before the branch, done after it.
    let init_at = output.find("init()").unwrap();
    let branch_at = output.find("if (c())").unwrap();
    let done_at = output.find("done()").unwrap();
    assert!(init_at < branch_at && branch_at < done_at);
}

const WHILE_DISPATCHER: &str = "\
for (var k = 1; void 0 !== k; ) {
    var j = k;
    switch (j) {
        case 1:
            x = 1;
            k = 2;
            break;
        case 2:
            k = x < 5 ? 3 : 4;
            break;
        case 3:
            body();
            x = x + 1;
            k = 2;
            break;
        case 4:
            k = void 0;
    }
}
";

#[test]
fn test_while_loop_recovery() {
    let output = deflatten(WHILE_DISPATCHER, 1).expect("dispatcher must match");
    assert!(
        output.contains("while (x < 5)"),
        "loop shape not recovered: {output}"
    );
    assert!(output.contains("body()"), "loop body lost: {output}");
    assert!(output.contains("x = x + 1"), "increment lost: {output}");
    assert!(!output.contains("switch"), "dispatcher survived: {output}");

    let while_at = output.find("while").unwrap();
    let seed_at = output.find("x = 1").unwrap();
    assert!(seed_at < while_at, "seed must precede the loop: {output}");
}

const OPAQUE_PREDICATE_DISPATCHER: &str = "\
for (var k = 1; void 0 !== k; ) {
    var j = k;
    switch (j) {
        case 1:
            r = 7;
            k = r * r > 40 ? 2 : 3;
            break;
        case 2:
            good();
            k = void 0;
            break;
        case 3:
            evil();
            k = void 0;
    }
}
";

#[test]
fn test_opaque_predicate_branch_removed() {
    let output = deflatten(OPAQUE_PREDICATE_DISPATCHER, 1).expect("dispatcher must match");
    assert!(output.contains("good()"), "live branch lost: {output}");
    assert!(
        !output.contains("evil("),
        "infeasible branch survived: {output}"
    );
    // The pruned condition stays behind as a bare expression statement.
    assert!(
        output.contains("r * r > 40"),
        "pruned condition dropped: {output}"
    );
    assert!(output.contains("r = 7"), "setup lost: {output}");
}

#[test]
fn test_solver_off_keeps_both_branches() {
    let mut deflattener = Deflattener::new(Box::new(NullBackend));
    let output = deflattener
        .deflatten(OPAQUE_PREDICATE_DISPATCHER, 1)
        .expect("pipeline must succeed")
        .expect("dispatcher must match");
    // Without a solver the fork is retained as a plain conditional.
    assert!(output.contains("good()"), "{output}");
    assert!(output.contains("evil()"), "{output}");
    assert!(output.contains("if (r * r > 40)"), "{output}");
}

const EARLY_RETURN_DISPATCHER: &str = "\
function run() {
    for (var k = 1; void 0 !== k; ) {
        var j = k;
        switch (j) {
            case 1:
                k = check() ? 2 : 3;
                break;
            case 2:
                bail();
                return;
            case 3:
                work();
                k = void 0;
        }
    }
    done();
}
";

#[test]
fn test_early_return_becomes_guard() {
    let output = deflatten(EARLY_RETURN_DISPATCHER, 2).expect("dispatcher must match");
    assert!(output.contains("if (check())"), "{output}");
    assert!(output.contains("return"), "return lost: {output}");
    let bail_at = output.find("bail()").unwrap();
    let work_at = output.find("work()").unwrap();
    let done_at = output.find("done()").unwrap();
    assert!(
        bail_at < work_at && work_at < done_at,
        "statement order broken: {output}"
    );
}

#[test]
fn test_surrounding_statements_survive_splice() {
    let source = format!("before();\n{WHILE_DISPATCHER}after();\n");
    let output = deflatten(&source, 2).expect("dispatcher must match");
    assert!(!output.contains("for ("), "dispatcher loop survived: {output}");
    let before_at = output.find("before()").unwrap();
    let while_at = output.find("while").unwrap();
    let after_at = output.find("after()").unwrap();
    assert!(
        before_at < while_at && while_at < after_at,
        "splice broke surrounding statements: {output}"
    );
}

const CODE_AFTER_FORK_DISPATCHER: &str = "\
for (var k = 1; void 0 !== k; ) {
    var j = k;
    switch (j) {
        case 1:
            k = c() ? 2 : 3;
            after();
            break;
        case 2:
            t();
            k = void 0;
            break;
        case 3:
            f();
            k = void 0;
    }
}
";

#[test]
fn test_code_after_fork_is_rejected() {
    // after() would run on both fork paths but belongs to neither; the
    // walker must refuse rather than misplace it.
    let mut deflattener = Deflattener::new(Box::new(NullBackend));
    assert!(deflattener.deflatten(CODE_AFTER_FORK_DISPATCHER, 1).is_err());
}

const CONTINUE_DISPATCHER: &str = "\
for (var k = 1; void 0 !== k; ) {
    var j = k;
    switch (j) {
        case 1:
            k = c() ? 2 : 3;
            break;
        case 2:
            pre();
            continue;
        case 3:
            rest();
            k = void 0;
    }
}
";

#[test]
fn test_continue_ends_the_iteration() {
    let output = deflatten(CONTINUE_DISPATCHER, 1).expect("dispatcher must match");
    assert!(output.contains("if (c())"), "{output}");
    assert_eq!(
        output.matches("pre()").count(),
        1,
        "pre must appear exactly once: {output}"
    );
    assert!(output.contains("rest()"), "fallthrough branch lost: {output}");
    assert!(!output.contains("continue"), "continue survived: {output}");
    assert!(!output.contains("switch"), "dispatcher survived: {output}");
    assert!(!output.contains("for ("), "dispatcher loop survived: {output}");
    let branch_at = output.find("if (c())").unwrap();
    let rest_at = output.find("rest()").unwrap();
    assert!(branch_at < rest_at, "statement order broken: {output}");
}

const CONFIDENT_IF_DISPATCHER: &str = "\
for (var k = 1; void 0 !== k; ) {
    var j = k;
    switch (j) {
        case 1:
            if (j) {
                work();
                k = 5;
            } else {
                k = 6;
            }
            break;
        case 5:
            tail();
            k = void 0;
            break;
        case 6:
            other();
            k = void 0;
    }
}
";

#[test]
fn test_confident_if_folds_into_taken_branch() {
    let output = deflatten(CONFIDENT_IF_DISPATCHER, 1).expect("dispatcher must match");
    assert!(output.contains("work()"), "taken branch lost: {output}");
    assert!(output.contains("tail()"), "continuation lost: {output}");
    assert!(!output.contains("other("), "dead branch survived: {output}");
    assert!(!output.contains("if"), "decided test survived: {output}");
}

const VOID_FORK_DISPATCHER: &str = "\
for (var k = 1; void 0 !== k; ) {
    var j = k;
    switch (j) {
        case 1:
            init();
            void (k = c() ? 2 : 3);
            break;
        case 2:
            t();
            k = 4;
            break;
        case 3:
            f();
            k = 4;
            break;
        case 4:
            done();
            k = void 0;
    }
}
";

#[test]
fn test_void_wrapped_fork_assignment() {
    let output = deflatten(VOID_FORK_DISPATCHER, 1).expect("dispatcher must match");
    assert!(output.contains("if (c())"), "missing branch: {output}");
    assert!(output.contains("else"), "missing else branch: {output}");
    assert!(output.contains("t()"), "{output}");
    assert!(output.contains("f()"), "{output}");
    assert!(!output.contains("switch"), "dispatcher survived: {output}");
}

const IIFE_NEGATION_DISPATCHER: &str = "\
for (var k = 1; void 0 !== k; ) {
    var j = k;
    switch (j) {
        case 1:
            !function () {
                setup();
                k = 2;
            }();
            break;
        case 2:
            done();
            k = void 0;
    }
}
";

#[test]
fn test_iife_negation_unwraps() {
    let output = deflatten(IIFE_NEGATION_DISPATCHER, 1).expect("dispatcher must match");
    assert!(output.contains("setup()"), "inlined body lost: {output}");
    assert!(output.contains("done()"), "{output}");
    assert!(!output.contains("function"), "wrapper survived: {output}");
    let setup_at = output.find("setup()").unwrap();
    let done_at = output.find("done()").unwrap();
    assert!(setup_at < done_at, "statement order broken: {output}");
}

const NESTED_CONDITIONAL_DISPATCHER: &str = "\
for (var k = 1; void 0 !== k; ) {
    var j = k, g = k < 9;
    switch (j) {
        case 1:
            k = g ? u() ? 2 : 3 : 4;
            break;
        case 2:
            t();
            k = void 0;
            break;
        case 3:
            f();
            k = void 0;
    }
}
";

#[test]
fn test_nested_conditional_assignment_forks() {
    // The outer conditional's test is decided by the derived key g; only
    // the inner u() test forks.
    let output = deflatten(NESTED_CONDITIONAL_DISPATCHER, 1).expect("dispatcher must match");
    assert!(output.contains("if (u())"), "missing branch: {output}");
    assert!(output.contains("t()"), "{output}");
    assert!(output.contains("f()"), "{output}");
    assert!(!output.contains("switch"), "dispatcher survived: {output}");
}

#[test]
fn test_dispatcher_inside_function() {
    let source = format!("function run() {{\n{WHILE_DISPATCHER}}}\n");
    let output = deflatten(&source, 2).expect("dispatcher must match");
    assert!(output.contains("function run()"), "{output}");
    assert!(output.contains("while (x < 5)"), "{output}");
}

#[test]
fn test_plain_loop_reports_no_match() {
    let source = "for (var i = 0; i < 3; i++) { work(i); }\n";
    assert!(deflatten(source, 1).is_none());
}

#[test]
fn test_wrong_line_reports_no_match() {
    assert!(deflatten(WHILE_DISPATCHER, 3).is_none());
}
