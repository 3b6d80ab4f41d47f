//! Common test utilities and fixtures
//!
//! Each test gets an isolated data directory and config file so runs never
//! touch the user's own `~/.simphoni`.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Get a path to a specific fixture file as a string argument
pub fn fixture(name: &str) -> String {
    fixtures_dir().join(name).to_string_lossy().into_owned()
}

/// Temporary data directory plus a config that uses the mock backend
pub struct TestEnvironment {
    pub root: TempDir,
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self::with_settings("")
    }

    /// Extra TOML appended after the base settings
    pub fn with_settings(extra: &str) -> Self {
        let root = TempDir::new().expect("Failed to create temp directory");
        let data_dir = root.path().join("data");
        let log_dir = root.path().join("logs");
        let config_path = root.path().join("simphoni.toml");

        let config = format!(
            r#"
[user]
id = "local"

[backend]
default = "mock"

[logging]
level = "warn"
file = "{}"

[storage]
data_dir = "{}"
{}
"#,
            log_dir.join("simphoni.log").display(),
            data_dir.display(),
            extra
        );
        fs::write(&config_path, config).expect("Failed to write config");

        Self {
            root,
            config_path,
            data_dir,
            log_dir,
        }
    }

    pub fn config(&self) -> &str {
        self.config_path.to_str().unwrap()
    }

    /// A `simphoni` command bound to this environment
    pub fn cmd(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::cargo_bin("simphoni").unwrap();
        cmd.arg("--config").arg(self.config());
        cmd.env_remove("SIMPHONI_USER").env_remove("SIMPHONI_DATA_DIR");
        cmd
    }

    /// Import the story schema and return its id
    pub fn import_story(&self) -> String {
        let output = self
            .cmd()
            .args(["schemas", "import", &fixture("story_schema.json")])
            .args(["--personas", &fixture("personas.json")])
            .output()
            .unwrap();
        assert!(output.status.success(), "import failed: {:?}", output);
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    /// Ids of persisted threads
    pub fn thread_ids(&self) -> Vec<String> {
        let dir = self.data_dir.join("threads");
        let mut ids: Vec<String> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| {
                        e.path()
                            .file_stem()
                            .and_then(|s| s.to_str())
                            .map(str::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_exist() {
        for name in [
            "personas.json",
            "story_schema.json",
            "unknown_persona_schema.json",
            "nested_loop_schema.json",
            "valid_config.toml",
            "invalid_config.toml",
        ] {
            assert!(fixtures_dir().join(name).exists(), "missing fixture {}", name);
        }
    }
}
