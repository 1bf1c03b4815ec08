//! CLI surface tests.

use assert_cmd::Command;
use predicates::prelude::*;

const DISPATCHER: &str = "\
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
fn test_deflattens_file_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.js");
    let output = dir.path().join("out.js");
    std::fs::write(&input, DISPATCHER).unwrap();

    Command::cargo_bin("js-deflat")
        .unwrap()
        .arg(&input)
        .arg(&output)
        .args(["--solver", "enum"])
        .assert()
        .success();

    let rewritten = std::fs::read_to_string(&output).unwrap();
    assert!(rewritten.contains("while (x < 5)"), "{rewritten}");
    assert!(!rewritten.contains("switch"), "{rewritten}");
}

#[test]
fn test_dot_flag_writes_graphviz() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.js");
    let output = dir.path().join("out.js");
    let dot = dir.path().join("graph.dot");
    std::fs::write(&input, DISPATCHER).unwrap();

    Command::cargo_bin("js-deflat")
        .unwrap()
        .arg(&input)
        .arg(&output)
        .arg("--dot")
        .arg(&dot)
        .assert()
        .success();

    let rendered = std::fs::read_to_string(&dot).unwrap();
    assert!(rendered.starts_with("digraph deflat"), "{rendered}");
    assert!(rendered.contains("exit"), "{rendered}");
}

#[test]
fn test_no_dispatcher_reports_no_match() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.js");
    let output = dir.path().join("out.js");
    std::fs::write(&input, "work();\n").unwrap();

    Command::cargo_bin("js-deflat")
        .unwrap()
        .arg(&input)
        .arg(&output)
        .assert()
        .success()
        .stderr(predicate::str::contains("no flattened dispatcher"));

    assert!(!output.exists(), "output must not be written without a match");
}

#[test]
fn test_missing_input_fails() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("js-deflat")
        .unwrap()
        .arg(dir.path().join("absent.js"))
        .arg(dir.path().join("out.js"))
        .assert()
        .failure();
}
