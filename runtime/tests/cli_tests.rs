// End-to-end tests for the `tfg` binary.
//
// Each test runs the built executable against the graph definitions under
// `tests/data/` and checks its stdout, stderr and exit status.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn tfg_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tfg"))
}

fn data(name: &str) -> String {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

fn run_tfg(args: &[&str]) -> Output {
    Command::new(tfg_binary())
        .args(args)
        .output()
        .expect("failed to run tfg")
}

fn stdout_ok(args: &[&str]) -> String {
    let output = run_tfg(args);
    assert!(
        output.status.success(),
        "tfg failed with args {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("non-UTF8 output")
}

// ── Successful runs ─────────────────────────────────────────────────────────

#[test]
fn summary_counts_nodes_and_ops() {
    let out = stdout_ok(&[&data("pair.pbtxt")]);
    assert!(out.starts_with("nodes: 2\n"), "got:\n{}", out);
    assert!(out.contains("producer: 21"), "got:\n{}", out);
    assert!(out.contains("  NoOp 2\n"), "got:\n{}", out);
}

#[test]
fn merge_places_the_second_graph_under_a_prefix() {
    let out = stdout_ok(&[&data("pair.pbtxt"), "--merge", &data("pair.pbtxt"), "--emit", "text"]);
    assert!(out.contains("name: \"import/B\""), "got:\n{}", out);
    assert!(out.contains("input: \"^import/A\""), "got:\n{}", out);
    assert!(out.contains("s: \"loc:@import/A\""), "got:\n{}", out);

    let flat = stdout_ok(&[
        &data("pair.pbtxt"),
        "--merge",
        &data("pair.pbtxt"),
        "--prefix",
        "",
        "--emit",
        "text",
    ]);
    assert!(flat.contains("name: \"A_1\""), "got:\n{}", flat);
    assert!(flat.contains("input: \"^A_1\""), "got:\n{}", flat);
}

#[test]
fn input_map_rebinds_the_merged_placeholder() {
    let output = run_tfg(&[
        &data("negate.pbtxt"),
        "--merge",
        &data("negate.pbtxt"),
        "--input-map",
        "A:0=B:0",
        "--return",
        "B:0",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stdout.starts_with("nodes: 3\n"), "got:\n{}", stdout);
    assert!(stdout.contains("  import/B:0 float32"), "got:\n{}", stdout);
    assert!(stderr.contains("W0302"), "stderr: {}", stderr);
}

#[test]
fn dot_output_is_a_digraph() {
    let out = stdout_ok(&[&data("pair.pbtxt"), "--emit", "dot"]);
    assert!(out.starts_with("digraph tfg {"));
    assert!(out.contains("\"g:A\" -> \"g:B\" [style=dashed, arrowhead=odot];"));
    assert!(out.trim_end().ends_with('}'));
}

#[test]
fn ops_lists_kernels_for_the_graph() {
    let out = stdout_ok(&[&data("negate.pbtxt"), "--emit", "ops"]);
    assert!(out.contains("Neg\tUnaryOp<CPUDevice, functor::neg<float>>\n"), "got:\n{}", out);
    assert!(out.contains("Placeholder\tPlaceholderOp\n"), "got:\n{}", out);
    assert!(out.contains("_Send\tSendOp\n"), "got:\n{}", out);
}

#[test]
fn op_libraries_extend_the_registry() {
    let without = run_tfg(&[&data("custom.pbtxt")]);
    assert_eq!(without.status.code(), Some(1));

    let out = stdout_ok(&[&data("custom.pbtxt"), "-I", &data("custom.ops")]);
    assert!(out.starts_with("nodes: 2\n"), "got:\n{}", out);
    assert!(out.contains("  Sensor 1\n") && out.contains("  Sink 1\n"), "got:\n{}", out);
}

#[test]
fn json_output_is_valid_json() {
    let out = stdout_ok(&[&data("negate.pbtxt"), "--emit", "json"]);
    let value: serde_json::Value = serde_json::from_str(&out).expect("valid JSON");
    assert_eq!(value["node"].as_array().map(Vec::len), Some(2));
    assert_eq!(value["node"][1]["op"], "Neg");
}

// ── Failures ────────────────────────────────────────────────────────────────

#[test]
fn malformed_input_map_is_a_usage_error() {
    let output = run_tfg(&[&data("negate.pbtxt"), "--input-map", "A:0"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("KEY=TENSOR"), "stderr: {}", stderr);
}

#[test]
fn unknown_ops_fail_the_import() {
    let output = run_tfg(&[&data("unknown_op.pbtxt")]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Frobnicate"), "stderr: {}", stderr);
}

#[test]
fn config_limits_apply_to_imports() {
    let config = std::env::temp_dir().join(format!("tfg_cli_limits_{}.json", std::process::id()));
    std::fs::write(&config, r#"{ "import": { "max_bytes": 10 } }"#).unwrap();
    let output = run_tfg(&[&data("pair.pbtxt"), "--config", config.to_str().unwrap()]);
    let _ = std::fs::remove_file(&config);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn missing_files_are_reported() {
    let output = run_tfg(&[&data("does_not_exist.pbtxt")]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does_not_exist.pbtxt"), "stderr: {}", stderr);
}
