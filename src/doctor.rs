//! Prerequisite checks for `tetherd doctor`.
//!
//! Runs without a fully valid configuration: a missing JWT secret is a
//! failed check, not a crash.

use crate::config::{default_data_dir, ConfigOverrides};
use crate::identity::HostIdentity;

pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

pub fn run_doctor(ov: &ConfigOverrides) -> Vec<CheckResult> {
    let mut results = Vec::new();

    // Coding CLI availability
    let binary = ov.cli_binary.clone().unwrap_or_else(|| "tool".to_string());
    let cli_ok = std::process::Command::new(&binary)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    results.push(CheckResult {
        name: "coding CLI",
        passed: cli_ok,
        detail: if cli_ok {
            format!("`{binary}` found on PATH")
        } else {
            format!("`{binary}` not runnable; commands will fail to spawn")
        },
    });

    // Data directory writability
    let data_dir = ov.data_dir.clone().unwrap_or_else(default_data_dir);
    let probe = data_dir.join(".doctor-probe");
    let dir_ok = std::fs::create_dir_all(&data_dir)
        .and_then(|_| std::fs::write(&probe, b"ok"))
        .and_then(|_| std::fs::remove_file(&probe))
        .is_ok();
    results.push(CheckResult {
        name: "data directory",
        passed: dir_ok,
        detail: format!("{} {}", data_dir.display(), if dir_ok { "writable" } else { "not writable" }),
    });

    // Host identity file
    let identity_ok = HostIdentity::load_or_create(&data_dir).is_ok();
    results.push(CheckResult {
        name: "host identity",
        passed: identity_ok,
        detail: if identity_ok {
            "host-id file readable".to_string()
        } else {
            "host-id file unreadable or malformed".to_string()
        },
    });

    // Relay URL
    let relay_ok = ov
        .signaling_server_url
        .as_deref()
        .is_some_and(|u| u.starts_with("ws://") || u.starts_with("wss://"));
    results.push(CheckResult {
        name: "signalling relay",
        passed: relay_ok,
        detail: match ov.signaling_server_url.as_deref() {
            Some(u) if relay_ok => u.to_string(),
            Some(u) => format!("{u} is not a ws:// or wss:// URL"),
            None => "SIGNALING_SERVER_URL not set".to_string(),
        },
    });

    // JWT secret
    let secret_len = ov.jwt_secret.as_deref().map(str::len).unwrap_or(0);
    let secret_ok = secret_len >= 32;
    results.push(CheckResult {
        name: "jwt secret",
        passed: secret_ok,
        detail: if secret_ok {
            format!("{secret_len} bytes")
        } else if secret_len == 0 {
            "JWT_SECRET not set".to_string()
        } else {
            format!("{secret_len} bytes; need at least 32")
        },
    });

    results
}

pub fn print_doctor_results(results: &[CheckResult]) {
    for r in results {
        let mark = if r.passed { "ok " } else { "FAIL" };
        println!("[{mark}] {:<18} {}", r.name, r.detail);
    }
    let failed = results.iter().filter(|r| !r.passed).count();
    if failed == 0 {
        println!("\nAll checks passed.");
    } else {
        println!("\n{failed} check(s) failed.");
    }
}
