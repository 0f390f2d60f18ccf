//! Unit tests for watchdog rendering and installation.

use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::test_support::{RecordingExecutor, ScriptedRunner};

#[fixture]
fn destroy_url() -> Url {
    Url::parse("https://api.example.test/droplets/42/destroy/?scrub=false&client_id=c&api_key=k")
        .expect("url")
}

#[fixture]
fn target() -> RemoteTarget {
    RemoteTarget {
        user: String::from("root"),
        host: "203.0.113.7".parse().expect("ip"),
    }
}

#[rstest]
fn builtin_render_fills_every_placeholder(destroy_url: Url) {
    let script = WatchdogScript::builtin().render(
        "assembler.py",
        Duration::from_secs(300),
        &destroy_url,
        "wd.log",
    );

    assert!(!script.contains("{{"), "unrendered placeholder: {script}");
    assert!(script.contains(r#"pgrep -f -- "$pattern""#), "{script}");
    assert!(!script.contains("pidof"), "{script}");
    assert!(script.contains("timeout=300"));
    assert!(script.contains("log=wd.log"));
    assert!(script.contains(&format!("curl -fsS '{destroy_url}'")), "{script}");
}

#[rstest]
fn render_escapes_hostile_values(destroy_url: Url) {
    let script = WatchdogScript::from_template("{{watch_pattern}} {{log_file}} {{destroy_url}}")
        .expect("template")
        .render("p; rm", Duration::from_secs(1), &destroy_url, "a b.log");

    assert!(
        script.starts_with(r"'\160\073\040\162\155' 'a b.log' '"),
        "{script}"
    );
}

#[rstest]
fn watchdog_command_line_never_matches_its_own_pattern(destroy_url: Url) {
    let script = WatchdogScript::builtin().render(
        "assembler.py",
        Duration::from_secs(300),
        &destroy_url,
        "wd.log",
    );

    assert!(!script.contains("assembler"), "{script}");
    assert!(
        script.contains(r"pattern=$(printf '\141\163\163\145\155\142\154\145\162\056\160\171')"),
        "{script}"
    );
}

#[cfg(unix)]
#[rstest]
#[case("assembler.py")]
#[case("sshd: root@notty")]
#[case("100% 'quoted' \\d+")]
fn rendered_pattern_decodes_in_the_shell(#[case] pattern: &str) {
    let rendered = WatchdogScript::from_template("printf {{watch_pattern}} # {{destroy_url}}")
        .expect("template")
        .render(
            pattern,
            Duration::from_secs(1),
            &Url::parse("https://example.test/").expect("url"),
            "wd.log",
        );

    let output = std::process::Command::new("bash")
        .arg("-c")
        .arg(&rendered)
        .output()
        .expect("bash runs");

    assert!(output.status.success(), "{output:?}");
    assert_eq!(String::from_utf8_lossy(&output.stdout), pattern);
}

#[test]
fn template_without_destroy_url_is_rejected() {
    let err = WatchdogScript::from_template("sleep 1").expect_err("missing placeholder");
    assert!(matches!(err, SelfDestructError::Template(_)));
}

#[test]
fn missing_template_file_is_reported() {
    let err = WatchdogScript::from_file(Utf8Path::new("/nonexistent/watchdog.sh"))
        .expect_err("missing file");
    assert!(err.to_string().contains("/nonexistent/watchdog.sh"), "{err}");
}

#[rstest]
fn ssh_executor_backgrounds_the_script(target: RemoteTarget) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let executor = SshRemoteExecutor::new("ssh", runner.clone());

    executor
        .run_detached(&target, "echo 'hi'")
        .expect("detached run");

    let invocations = runner.invocations();
    let call = invocations.first().expect("ssh invoked");
    assert_eq!(call.program, "ssh");
    let args: Vec<String> = call
        .args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        args,
        [
            "-n",
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "ConnectTimeout=15",
            "root@203.0.113.7",
            r#"nohup bash -c 'echo '\''hi'\''' > /dev/null 2>&1 &"#,
        ]
    );
}

#[rstest]
fn ssh_executor_surfaces_failures(target: RemoteTarget) {
    let runner = ScriptedRunner::new();
    runner.push_failure(255, "Connection refused");
    let executor = SshRemoteExecutor::new("ssh", runner);

    let err = executor
        .run_detached(&target, "true")
        .expect_err("ssh failure");

    assert!(matches!(err, SelfDestructError::Remote(_)));
    assert!(err.to_string().contains("Connection refused"), "{err}");
}

#[rstest]
fn install_renders_and_runs(target: RemoteTarget, destroy_url: Url) {
    let installer = SelfDestruct::new(
        RecordingExecutor::new(),
        WatchdogScript::builtin(),
        "assembler.py",
    )
    .with_log_file("custom.log");

    installer
        .install(&target, &destroy_url, Duration::from_secs(60))
        .expect("install");

    let runs = installer.executor().runs();
    let (host, script) = runs.first().expect("one run");
    assert_eq!(host, &target);
    assert!(script.contains("timeout=60"));
    assert!(script.contains("log=custom.log"));
}
