use dir_test::Fixture;
use std::path::Path;
use std::process::{Command, Output};

/// Environment that would leak the developer's own tracker or settings
/// into a scenario.
const SCRUBBED_ENV: [&str; 5] = ["EB_DIR", "EB_USER", "RUST_LOG", "VISUAL", "EDITOR"];

#[cfg(unix)]
fn run_scenario(script: &Path) -> Output {
    let scratch = tempfile::tempdir().expect("scratch dir");
    let mut cmd = Command::new("bash");
    cmd.arg(script)
        .current_dir(scratch.path())
        .env("EB", env!("CARGO_BIN_EXE_eb"));
    for var in SCRUBBED_ENV {
        cmd.env_remove(var);
    }
    cmd.output()
        .unwrap_or_else(|e| panic!("could not start {}: {}", script.display(), e))
}

#[cfg(unix)]
fn describe(script: &Path, output: &Output) -> String {
    format!(
        "scenario {} ({})\n--- stdout\n{}\n--- stderr\n{}",
        script.display(),
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

// Every tests/*.sh is one scenario; each must finish by printing "... OK"
#[cfg(unix)]
#[dir_test::dir_test(
    dir: "$CARGO_MANIFEST_DIR/tests",
    glob: "*.sh",
)]
fn scenarios(fixture: Fixture<&str>) {
    let script = Path::new(fixture.path());
    let output = run_scenario(script);
    assert!(output.status.success(), "{}", describe(script, &output));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let finished = stdout
        .lines()
        .last()
        .is_some_and(|line| line.ends_with(" OK"));
    assert!(finished, "scenario stopped early: {}", describe(script, &output));
}

#[cfg(not(unix))]
#[test]
fn scenarios_need_a_unix_shell() {}
