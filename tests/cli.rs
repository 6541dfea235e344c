use std::process::Command;

fn run_lirjit(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_lirjit"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to execute lirjit");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn assert_success(args: &[&str]) -> String {
    let (stdout, stderr, success) = run_lirjit(args);
    assert!(success, "lirjit {args:?} should succeed, stderr:\n{stderr}");
    stdout
}

fn assert_failure(args: &[&str]) -> String {
    let (_, stderr, success) = run_lirjit(args);
    assert!(!success, "lirjit {args:?} should fail");
    stderr
}

#[test]
fn test_samples_lists_every_sample() {
    let stdout = assert_success(&["samples"]);
    for name in ["add", "idiv", "irem", "ldiv", "lrem", "call_add"] {
        assert!(
            stdout.lines().any(|line| line.starts_with(name)),
            "missing {name} in:\n{stdout}"
        );
    }
}

#[test]
fn test_compile_text_dump() {
    let stdout = assert_success(&["compile", "add", "--tier", "baseline"]);
    assert!(stdout.contains("add (m0) tier=baseline"), "{stdout}");
}

#[test]
fn test_compile_json_summary() {
    let stdout = assert_success(&["compile", "idiv", "--json"]);
    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["name"], "idiv");
    assert_eq!(summary["tier"], "optimized");
    assert_eq!(summary["baseline_entry"], 0);
    assert_eq!(summary["optimized_entry"], 8);
    assert_eq!(summary["traps"].as_array().map(Vec::len), Some(1));
}

#[test]
fn test_compile_direct_call_records_stop() {
    let stdout = assert_success(&["compile", "call_add", "--json"]);
    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let stops = summary["stops"].as_array().unwrap();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0]["kind"], "direct_call");
}

#[test]
fn test_dump_lir_prints_method_header() {
    let stdout = assert_success(&["compile", "add", "--dump-lir"]);
    assert!(stdout.starts_with("method add"), "{stdout}");
}

#[test]
fn test_unknown_sample_fails() {
    let stderr = assert_failure(&["compile", "mandelbrot"]);
    assert!(stderr.contains("unknown sample `mandelbrot`"), "{stderr}");
}

#[test]
fn test_missing_config_fails() {
    let stderr = assert_failure(&["--config", "/nonexistent/lirjit.toml", "samples"]);
    assert!(stderr.contains("loading /nonexistent/lirjit.toml"), "{stderr}");
}

#[test]
fn test_config_file_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lirjit.toml");
    std::fs::write(&path, "mode = \"baseline\"\ncode_cache_size = 1048576\n").unwrap();
    let stdout = assert_success(&["--config", path.to_str().unwrap(), "compile", "add", "--json"]);
    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    // An explicit tier still wins over the configured mode.
    assert_eq!(summary["tier"], "optimized");
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn test_run_reoptimizes_and_forwards() {
    let stdout = assert_success(&["run", "add", "40", "2"]);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3, "{stdout}");
    assert!(lines[0].starts_with("baseline"));
    assert!(lines[1].starts_with("optimized"));
    assert!(lines[2].starts_with("forwarded"));
    assert!(lines.iter().all(|line| line.ends_with(": 42")), "{stdout}");
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn test_run_linked_call_and_negative_arguments() {
    let stdout = assert_success(&["run", "call_add", "-5", "3"]);
    assert!(stdout.lines().all(|line| line.ends_with(": -2")), "{stdout}");
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn test_run_rejects_division_by_zero() {
    let stderr = assert_failure(&["run", "idiv", "1", "0"]);
    assert!(stderr.contains("division by zero"), "{stderr}");
}
