//! Configuration system tests
//!
//! Tests configuration loading, validation, and environment overrides
//! through the CLI.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Test fixture for configuration testing
struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("simphoni.toml");
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }

    fn validate(&self) -> assert_cmd::assert::Assert {
        Command::cargo_bin("simphoni")
            .unwrap()
            .args(["config", "validate", "--config", self.path()])
            .assert()
    }

    fn show(&self) -> Command {
        let mut cmd = Command::cargo_bin("simphoni").unwrap();
        cmd.args(["config", "show", "--config", self.path()]);
        cmd
    }
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_empty_config_uses_defaults() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");
    fixture.validate().success();
    fixture
        .show()
        .assert()
        .success()
        .stdout(predicate::str::contains("id = \"local\""))
        .stdout(predicate::str::contains("max_steps = 16"))
        .stdout(predicate::str::contains("invocation_timeout_secs = 120"));
}

#[test]
fn test_full_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[user]
id = "alice"

[schema]
max_steps = 8
max_loop_iterations = 10
max_plan_steps = 200

[execution]
invocation_timeout_secs = 60
default_model = "mistral:7b"
default_creativity = 4

[conductor]
enabled = true
model = "llama3"
every_n_steps = 2

[backend]
default = "ollama"

[[backend.routes]]
prefix = "gpt-"
backend = "openai"

[backend.ollama]
base_url = "http://gpu-box:11434/v1"

[logging]
level = "debug"
json_format = true

[storage]
data_dir = "/tmp/simphoni-test"
"#,
    );

    fixture.validate().success();
    fixture
        .show()
        .assert()
        .success()
        .stdout(predicate::str::contains("id = \"alice\""))
        .stdout(predicate::str::contains("every_n_steps = 2"))
        .stdout(predicate::str::contains("http://gpu-box:11434/v1"));
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_invalid_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
level = "loud"
"#,
    );
    fixture
        .validate()
        .code(10)
        .stderr(predicate::str::contains("Invalid log level"));
}

#[test]
fn test_invalid_log_rotation() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
rotation = "weekly"
"#,
    );
    fixture
        .validate()
        .code(10)
        .stderr(predicate::str::contains("Invalid log rotation 'weekly'"));
}

#[test]
fn test_zero_max_steps() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[schema]
max_steps = 0
"#,
    );
    fixture
        .validate()
        .code(10)
        .stderr(predicate::str::contains("max_steps"));
}

#[test]
fn test_conductor_without_model() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[conductor]
enabled = true
"#,
    );
    fixture
        .validate()
        .code(10)
        .stderr(predicate::str::contains("conductor.model"));
}

#[test]
fn test_route_to_unknown_backend() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[[backend.routes]]
prefix = "claude-"
backend = "anthropic"
"#,
    );
    fixture
        .validate()
        .code(10)
        .stderr(predicate::str::contains("anthropic"));
}

#[test]
fn test_malformed_toml() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[user\nid = ");
    fixture.validate().code(10);
}

#[test]
fn test_missing_explicit_config() {
    Command::cargo_bin("simphoni")
        .unwrap()
        .args(["config", "validate", "--config", "/nonexistent/simphoni.toml"])
        .assert()
        .code(10)
        .stderr(predicate::str::contains("config init"));
}

// ─────────────────────────────────────────────────────────────────
// Environment Overrides
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_override_user_and_model() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");
    fixture
        .show()
        .env("SIMPHONI_USER_ID", "from-env")
        .env("SIMPHONI_DEFAULT_MODEL", "phi3")
        .assert()
        .success()
        .stdout(predicate::str::contains("id = \"from-env\""))
        .stdout(predicate::str::contains("default_model = \"phi3\""));
}

#[test]
fn test_env_override_invalid_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config("");
    Command::cargo_bin("simphoni")
        .unwrap()
        .args(["config", "validate", "--config", fixture.path()])
        .env("SIMPHONI_LOG_LEVEL", "chatty")
        .assert()
        .code(10);
}

#[test]
fn test_config_path_from_env() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[user]
id = "env-config"
"#,
    );
    Command::cargo_bin("simphoni")
        .unwrap()
        .args(["config", "show"])
        .env("SIMPHONI_CONFIG", fixture.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("id = \"env-config\""));
}

#[test]
fn test_tilde_expansion() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[storage]
data_dir = "~/simphoni-data"
"#,
    );
    fixture
        .show()
        .assert()
        .success()
        .stdout(predicate::str::contains("simphoni-data"))
        .stdout(predicate::str::contains("~/simphoni-data").not());
}
