//! # Module Process Tests
//!
//! Spawns `hermes_mock_module` as real child processes:
//!
//! - spawn, attach, step and clean termination
//! - crash detection as a process exit
//! - escalation against a hung module
//! - exit codes after TERMINATE and the single grace window
//! - the `hermes` CLI end to end

use hermes::{FaultKind, ModuleState, Supervisor};
use hermes_common::config::RunConfig;
use hermes_common::watchdog::{HealthStatus, Watchdog};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const MOCK: &str = env!("CARGO_BIN_EXE_hermes_mock_module");
const HERMES: &str = env!("CARGO_BIN_EXE_hermes");

fn test_seg_name(suffix: &str) -> String {
    static CTR: AtomicU32 = AtomicU32::new(0);
    let id = CTR.fetch_add(1, Ordering::Relaxed);
    format!("/hermes_proc_{}_{id}_{suffix}", std::process::id())
}

/// A scratch directory holding `run.toml` and one mock config per module.
struct Scenario {
    dir: TempDir,
}

impl Scenario {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
        }
    }

    fn file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).expect("write scenario file");
        path
    }

    /// Write `run.toml`: a mock module per `(name, mock config)` pair.
    fn run_toml(&self, suffix: &str, extra: &str, modules: &[(&str, &str)]) -> PathBuf {
        let mut src = format!(
            r#"
[shared]
service_name = "proc-test"

[segment]
name = "{}"

{extra}
"#,
            test_seg_name(suffix)
        );
        for (name, mock) in modules {
            let config = format!("{name}.toml");
            self.file(&config, mock);
            src.push_str(&format!(
                "\n[[modules]]\nname = \"{name}\"\nexecutable = \"{MOCK}\"\nconfig = \"{config}\"\n"
            ));
        }
        self.file("run.toml", &src)
    }
}

const COUNTER: &str = r#"
[[outputs]]
name = "x"
increment = 0.5
"#;

const FOLLOWER: &str = r#"
inputs = ["a.x"]

[[outputs]]
name = "y"
type = "i64"
"#;

/// Declare a writable `gain` in volts on the last module of `run.toml`.
fn declare_gain(run: &Path) {
    let mut src = fs::read_to_string(run).expect("read run.toml");
    src.push_str(
        r#"
[[modules.signals]]
name = "gain"
type = "f64"
writable = true
unit = "V"
initial = 2.0
"#,
    );
    fs::write(run, src).expect("write run.toml");
}

fn started(path: &Path) -> Supervisor {
    let config = RunConfig::from_file(path).expect("run.toml loads");
    let mut sup = Supervisor::new(config).expect("segment created");
    sup.spawn_all().expect("spawn");
    sup.await_attached().expect("attach");
    sup.stage().expect("stage");
    sup
}

fn id_of(sup: &Supervisor, name: &str) -> hermes_common::signal::ModuleId {
    sup.handle(name).expect("known module").id()
}

// ─── Supervisor with real processes ─────────────────────────────────

#[test]
fn mock_modules_run_and_exit_cleanly() {
    let scenario = Scenario::new();
    let run = scenario.run_toml("clean", "", &[("a", COUNTER), ("b", FOLLOWER)]);
    let mut sup = started(&run);

    for name in ["a", "b"] {
        let handle = sup.handle(name).unwrap();
        assert_eq!(handle.state(), ModuleState::Ready);
        assert!(handle.pid().is_some());
    }
    for _ in 0..4 {
        sup.step().unwrap();
    }
    assert_eq!(sup.read_signal("a.x").unwrap().as_f64(), 2.0);
    assert_eq!(sup.read_signal("b.y").unwrap().as_f64(), 4.0);
    let a = id_of(&sup, "a");
    assert_eq!(sup.health_check(a), HealthStatus::Healthy);

    sup.terminate().unwrap();
    assert!(sup.faults().is_empty());
    assert!(
        sup.handles()
            .iter()
            .all(|h| h.state() == ModuleState::Terminated)
    );
    assert_eq!(
        sup.health_check(a),
        HealthStatus::Dead { exit_code: Some(0) }
    );
}

#[test]
fn crashing_module_is_reported_as_process_exit() {
    let scenario = Scenario::new();
    let crasher = format!("crash_at_frame = 1\n{COUNTER}");
    let run = scenario.run_toml(
        "crash",
        "[supervisor]\nstep_timeout_ms = 10000",
        &[("a", &crasher), ("b", "")],
    );
    let mut sup = started(&run);

    sup.step().unwrap();
    let begun = Instant::now();
    assert_eq!(sup.step().unwrap(), 2);
    assert!(begun.elapsed() < Duration::from_secs(5), "exit seen before the deadline");

    let fault = sup.handle("a").unwrap().fault().expect("a faulted").clone();
    assert_eq!(fault.kind, FaultKind::ProcessExit);
    assert_eq!(fault.frame, 1);
    assert!(fault.cause.contains("Some(3)"));
    assert_eq!(
        sup.health_check(id_of(&sup, "a")),
        HealthStatus::Dead { exit_code: Some(3) }
    );

    sup.step().unwrap();
    assert_eq!(sup.read_signal("a.x").unwrap().as_f64(), 0.5);
    sup.terminate().unwrap();
    assert_eq!(sup.handle("b").unwrap().state(), ModuleState::Terminated);
}

#[test]
fn hung_module_is_killed_on_terminate() {
    let scenario = Scenario::new();
    let run = scenario.run_toml(
        "hang",
        "[supervisor]\nstep_timeout_ms = 300\nterminate_grace_ms = 2000",
        &[("a", "hang_at_frame = 0\n"), ("b", COUNTER)],
    );
    let mut sup = started(&run);

    assert_eq!(sup.step().unwrap(), 1);
    let a = id_of(&sup, "a");
    assert_eq!(
        sup.handle("a").unwrap().fault().map(|f| f.kind),
        Some(FaultKind::Timeout)
    );
    assert_eq!(
        sup.health_check(a),
        HealthStatus::Unresponsive { last_frame: None }
    );

    let begun = Instant::now();
    sup.terminate().unwrap();
    // No grace for a faulted module: straight to SIGTERM.
    assert!(begun.elapsed() < Duration::from_secs(3));
    assert!(matches!(sup.health_check(a), HealthStatus::Dead { .. }));
    assert_eq!(sup.handle("a").unwrap().state(), ModuleState::Faulted);
    assert_eq!(sup.handle("b").unwrap().state(), ModuleState::Terminated);
}

#[test]
fn nonzero_exit_after_terminate_is_a_fault() {
    let scenario = Scenario::new();
    let failing = format!("exit_code_on_terminate = 7\n{COUNTER}");
    let run = scenario.run_toml("exit7", "", &[("a", &failing), ("b", COUNTER)]);
    let mut sup = started(&run);

    assert_eq!(sup.step().unwrap(), 1);
    sup.terminate().unwrap();

    let a = sup.handle("a").unwrap();
    assert_eq!(a.state(), ModuleState::Faulted);
    let fault = a.fault().expect("a faulted").clone();
    assert_eq!(fault.kind, FaultKind::ProcessExit);
    assert_eq!(fault.last_good_frame, Some(0));
    assert!(fault.cause.contains("Some(7)"));
    assert_eq!(sup.faults(), &[fault]);
    assert_eq!(
        sup.health_check(id_of(&sup, "a")),
        HealthStatus::Dead { exit_code: Some(7) }
    );
    assert_eq!(sup.handle("b").unwrap().state(), ModuleState::Terminated);
    assert_eq!(sup.report().modules[0].state, ModuleState::Faulted);
}

#[test]
fn terminate_grace_is_a_single_window() {
    let scenario = Scenario::new();
    // Answers late, then never exits on its own.
    let slow = "terminate_delay_ms = 1000\nlinger_after_terminate_ms = 30000\n";
    let run = scenario.run_toml(
        "grace",
        "[supervisor]\nterminate_grace_ms = 1500",
        &[("a", slow), ("b", "")],
    );
    let mut sup = started(&run);
    sup.step().unwrap();

    let begun = Instant::now();
    sup.terminate().unwrap();
    let elapsed = begun.elapsed();
    // 1.5 s of grace plus at most the SIGTERM wait, not 1 s + 1.5 s.
    assert!(elapsed >= Duration::from_millis(1400), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2300), "took {elapsed:?}");

    // Reclaimed by signal: no exit code, so it is not a clean exit.
    let fault = sup.handle("a").unwrap().fault().expect("a faulted").clone();
    assert_eq!(fault.kind, FaultKind::ProcessExit);
    assert_eq!(sup.handle("b").unwrap().state(), ModuleState::Terminated);
}

#[test]
fn missing_executable_is_a_spawn_fault() {
    let scenario = Scenario::new();
    let mock = scenario.file("b.toml", COUNTER);
    let run = scenario.file(
        "run.toml",
        &format!(
            r#"
[shared]
service_name = "proc-test"

[segment]
name = "{}"

[[modules]]
name = "ghost"
executable = "/nonexistent/hermes_ghost"

[[modules]]
name = "b"
executable = "{MOCK}"
config = "{}"
"#,
            test_seg_name("spawn"),
            mock.display()
        ),
    );
    let mut sup = started(&run);

    let ghost = sup.handle("ghost").unwrap();
    assert_eq!(ghost.state(), ModuleState::Faulted);
    assert_eq!(ghost.fault().map(|f| f.kind), Some(FaultKind::Spawn));
    assert_eq!(sup.step().unwrap(), 1);
    sup.terminate().unwrap();
}

// ─── CLI ────────────────────────────────────────────────────────────

#[test]
fn cli_validate_accepts_good_and_rejects_bad_configs() {
    let scenario = Scenario::new();
    let good = scenario.run_toml("cli_ok", "", &[("a", COUNTER)]);
    let status = Command::new(HERMES)
        .arg("validate")
        .arg(&good)
        .status()
        .expect("run hermes");
    assert!(status.success());

    let bad = scenario.file("bad.toml", "[shared]\nservice_name = \"x\"\n");
    let status = Command::new(HERMES)
        .arg("validate")
        .arg(&bad)
        .status()
        .expect("run hermes");
    assert!(!status.success());
}

#[test]
fn cli_run_writes_a_report() {
    let scenario = Scenario::new();
    let run = scenario.run_toml(
        "cli_run",
        "[execution]\nmode = \"afap\"\nrate_hz = 100.0\nend_time = 0.05",
        &[("a", COUNTER), ("b", FOLLOWER)],
    );
    declare_gain(&run);
    let report = scenario.dir.path().join("report.json");
    let output = Command::new(HERMES)
        .arg("run")
        .arg(&run)
        .arg("--report")
        .arg(&report)
        .output()
        .expect("run hermes");
    assert!(
        output.status.success(),
        "hermes run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report).expect("report written")).unwrap();
    assert_eq!(json["frames"], 5);
    assert_eq!(json["faults"].as_array().map(Vec::len), Some(0));
    assert_eq!(json["modules"][0]["state"], "TERMINATED");

    let signals = json["signals"].as_array().expect("signal table");
    let find = |module: &str, name: &str| {
        signals
            .iter()
            .find(|s| s["module"] == module && s["name"] == name)
            .unwrap_or_else(|| panic!("{module}.{name} missing from report"))
    };
    assert_eq!(find("b", "gain")["unit"], "V");
    assert_eq!(find("b", "gain")["value"], 2.0);
    assert_eq!(find("a", "x")["value"], 2.5);
    assert!(find("a", "x").get("unit").is_none());
}

#[test]
fn cli_signals_shows_declared_units() {
    let scenario = Scenario::new();
    let run = scenario.run_toml("cli_sig", "", &[("a", COUNTER), ("b", FOLLOWER)]);
    declare_gain(&run);
    let mut sup = started(&run);
    sup.step().unwrap();

    let output = Command::new(HERMES)
        .arg("signals")
        .arg(sup.segment_name())
        .arg("--config")
        .arg(&run)
        .output()
        .expect("run hermes");
    assert!(
        output.status.success(),
        "hermes signals failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = |name: &str| {
        stdout
            .lines()
            .find(|l| l.starts_with(name))
            .unwrap_or_else(|| panic!("{name} not listed in:\n{stdout}"))
            .split_whitespace()
            .collect::<Vec<_>>()
    };
    assert_eq!(line("b.gain"), ["b.gain", "f64", "rw", "V", "2"]);
    assert_eq!(line("a.x"), ["a.x", "f64", "ro", "-", "0.5"]);
    sup.terminate().unwrap();
}
