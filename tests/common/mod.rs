#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    /// Stdout parsed as one JSON document.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(self.stdout.trim()).unwrap_or_else(|e| {
            panic!("stdout is not JSON ({e}); log: {}", self.log_path.display())
        })
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

pub fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_cdiag") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "cdiag.exe" } else { "cdiag" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve cdiag binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("cdiag-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env_remove("CDIAG_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute cdiag command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Start `cdiag` without waiting for it.
pub fn spawn_cli(args: &[&str]) -> Child {
    Command::new(resolve_bin_path())
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn cdiag")
}

// ──────────────────── fixtures ────────────────────

pub const SLOW_QUERY_LOG: &str = "\
# Time: 2019-08-22T10:00:00+08:00
# Query_time: 9.0
# Digest: early
select 0;
# Time: 2019-08-22T11:00:00+08:00
# Query_time: 0.5
# Digest: d-a
select 1;
# Time: 2019-08-22T11:10:00+08:00
# Query_time: 2.5
# Digest: d-b
select 3;
";

pub const TIKV_LOG: &str = "\
[2019/08/22 10:00:00.000 +08:00] [INFO] [a.rs:0] [\"early\"]
[2019/08/22 11:00:00.000 +08:00] [WARN] [a.rs:1] [\"w1\"]
[2019/08/22 11:01:00.000 +08:00] [ERROR] [a.rs:2] [\"e1\"]
[2019/08/22 11:02:00.000 +08:00] [WARN] [a.rs:3] [\"w2 region miss\"]
[2019/08/22 13:00:00.000 +08:00] [WARN] [a.rs:4] [\"late\"]
";

pub const WINDOW_BEGIN: &str = "2019-08-22T10:30:00+08:00";
pub const WINDOW_END: &str = "2019-08-22T12:00:00+08:00";

/// `<root>/<host>/<component>-<port>/<file>` with one TiDB slow log and
/// one TiKV log.
pub fn write_log_tree(root: &Path) {
    let tidb = root.join("10.0.0.1/tidb-4000");
    let tikv = root.join("10.0.0.2/tikv-20160");
    fs::create_dir_all(&tidb).unwrap();
    fs::create_dir_all(&tikv).unwrap();
    fs::write(tidb.join("tidb_slow_query.log"), SLOW_QUERY_LOG).unwrap();
    fs::write(tikv.join("tikv.log"), TIKV_LOG).unwrap();
}

/// Config file whose activity log lives under `dir`.
pub fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let path = dir.join("config.toml");
    let body = format!(
        "[paths]\njsonl_log = \"{}\"\nsqlite_db = \"{}\"\n\n{extra}\n",
        dir.join("activity.jsonl").display(),
        dir.join("activity.sqlite3").display(),
    );
    fs::write(&path, body).unwrap();
    path
}

pub fn activity_events(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("activity.jsonl"))
        .unwrap_or_default()
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|entry| entry["event"].as_str().map(str::to_string))
        .collect()
}

pub fn topology_descriptor(ip: &str, component: &str, port: &str) -> String {
    format!(
        r#"{{"cluster_name":"c1","status":"success","hosts":[
            {{"status":"success","ip":"{ip}","user":"tidb","components":[
                {{"status":"success","name":"{component}","deploy_dir":"/deploy","port":"{port}"}}]}},
            {{"status":"failed","ip":"10.9.9.9","user":"tidb","components":[
                {{"status":"success","name":"pd","deploy_dir":"/deploy","port":"2379"}}]}}]}}"#
    )
}

/// Executable that appends its arguments to `<last arg>/calls.log`.
#[cfg(unix)]
pub fn fake_rsync(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-rsync.sh");
    fs::write(
        &path,
        "#!/bin/sh\nfor last; do :; done\necho \"$@\" >> \"$last/calls.log\"\n",
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}
