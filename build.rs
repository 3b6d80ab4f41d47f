//! Build script for Simphoni
//!
//! Embeds the git revision, build time, target and rustc version so that
//! `simphoni version` can report exactly which engine produced a Thread.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = run_git(&["rev-parse", "--short=8", "HEAD"]);
    let git_dirty = match run_git(&["status", "--porcelain"]).as_str() {
        "unknown" => "unknown",
        "" => "false",
        _ => "true",
    };

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let rustc_version = rustc_version();

    println!("cargo:rustc-env=SIMPHONI_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=SIMPHONI_GIT_DIRTY={}", git_dirty);
    println!("cargo:rustc-env=SIMPHONI_BUILD_TIMESTAMP={}", build_timestamp);
    println!("cargo:rustc-env=SIMPHONI_TARGET={}", target);
    println!("cargo:rustc-env=SIMPHONI_PROFILE={}", profile);
    println!("cargo:rustc-env=SIMPHONI_RUSTC_VERSION={}", rustc_version);
}

/// Run a git command and return its trimmed stdout, or "unknown" when git is unavailable
fn run_git(args: &[&str]) -> String {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn rustc_version() -> String {
    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
