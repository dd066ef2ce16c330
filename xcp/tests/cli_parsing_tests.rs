use predicates::prelude::predicate;

fn xcp() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("xcp").unwrap()
}

#[test]
fn check_xcp_help() {
    xcp()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("xcp"));
}

#[test]
fn check_missing_positionals_fail() {
    xcp().assert().failure();
    xcp().arg("only-source").assert().failure();
}

#[test]
fn check_bad_log_level_fails() {
    xcp()
        .args(["-v", "loud", "src", "dst"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown log level"));
}

#[test]
fn check_bad_time_spec_fails() {
    let tmp = tempfile::Builder::new()
        .prefix("xcp-test-")
        .tempdir()
        .unwrap();
    let dst = tempfile::Builder::new()
        .prefix("xcp-test-")
        .tempdir()
        .unwrap();
    xcp()
        .args(["-t", "yesterday"])
        .arg(tmp.path())
        .arg(dst.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("RFC 3339"));
}

#[test]
fn check_glob_in_directory_component_fails() {
    xcp()
        .args(["/data/in*/x.csv", "/tmp/out"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("wildcard"));
}

#[test]
fn check_unknown_scheme_fails() {
    let dst = tempfile::Builder::new()
        .prefix("xcp-test-")
        .tempdir()
        .unwrap();
    xcp()
        .arg("ftp://host/dir/")
        .arg(dst.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown backend"));
}
