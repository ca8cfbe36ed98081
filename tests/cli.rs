use assert_cmd::Command;

fn feedtap() -> Command {
    let mut cmd = Command::cargo_bin("feedtap").expect("binary");
    cmd.args(["--config", "/nonexistent/feedtap/config.yaml"]);
    cmd
}

#[test]
fn help_lists_subcommands() {
    let output = feedtap().arg("--help").output().expect("run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["watch", "eval", "cookies"] {
        assert!(stdout.contains(command), "missing {command}");
    }
}

#[test]
fn eval_rejects_malformed_params_before_launching() {
    feedtap()
        .args(["eval", "page/", "script.js", "--param", "broken"])
        .assert()
        .failure();
}

#[test]
fn eval_reports_missing_script_before_launching() {
    feedtap()
        .args(["eval", "page/", "/nonexistent/script.js"])
        .assert()
        .failure();
}
