//! Project mode detection.
//!
//! Classifies a directory as a component, a kit or a full application by the
//! marker files it contains. Precedence is fixed: component markers win over
//! kit markers, which win over application markers. Detection never guesses;
//! a directory without markers is an error.

use crate::error::{DevError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Component manifest at the project root.
pub const COMPONENT_MANIFEST: &str = "component.yaml";
/// Component template at the project root.
pub const COMPONENT_TEMPLATE: &str = "component.html";
/// Kit manifest at the project root.
pub const KIT_MANIFEST: &str = "kit.yaml";
/// Helper definitions source; marks a kit when no manifest exists.
pub const KIT_HELPERS: &str = "helpers.go";
/// Module manifest of an application.
pub const MODULE_MANIFEST: &str = "go.mod";
/// Application entry point file name.
pub const ENTRY_POINT: &str = "main.go";
/// Conventional directory holding one subdirectory per application binary.
pub const COMMAND_DIR: &str = "cmd";

/// Kind of project being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Isolated component authoring
    Component,
    /// Component kit with shared helpers
    Kit,
    /// Full application run as a supervised child process
    App,
}

impl Mode {
    /// Lowercase name, as used in configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Component => "component",
            Mode::Kit => "kit",
            Mode::App => "app",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = DevError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "component" => Ok(Mode::Component),
            "kit" => Ok(Mode::Kit),
            "app" => Ok(Mode::App),
            other => Err(crate::error::ConfigError::InvalidValue {
                field: "mode".to_string(),
                value: other.to_string(),
                hint: "Must be 'component', 'kit' or 'app'".to_string(),
            }
            .into()),
        }
    }
}

/// Stateless classifier for project directories.
///
/// Every call re-reads the directory, so results always reflect the current
/// contents. Nothing is cached and nothing is written.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeDetector;

impl ModeDetector {
    /// Classify `root`.
    ///
    /// # Errors
    ///
    /// Returns [`DevError::NotDetected`] naming `root` when no marker matches,
    /// including when `root` does not exist or is not a directory.
    pub fn detect(root: &Path) -> Result<Mode> {
        if !root.is_dir() {
            return Err(DevError::NotDetected {
                root: root.to_path_buf(),
            });
        }

        let mode = if has_component_markers(root) {
            Mode::Component
        } else if has_kit_markers(root) {
            Mode::Kit
        } else if has_app_markers(root) {
            Mode::App
        } else {
            return Err(DevError::NotDetected {
                root: root.to_path_buf(),
            });
        };

        tracing::debug!(root = %root.display(), %mode, "detected project mode");
        Ok(mode)
    }

    /// Check that `root` still satisfies the structural requirement of `mode`.
    ///
    /// Used when a mode is forced instead of detected. Stronger markers for
    /// other modes do not make validation fail.
    pub fn validate(root: &Path, mode: Mode) -> Result<()> {
        let mismatch = |reason: String| DevError::ModeMismatch {
            mode,
            root: root.to_path_buf(),
            reason,
        };

        if !root.is_dir() {
            return Err(mismatch("directory does not exist".to_string()));
        }

        let ok = match mode {
            Mode::Component => has_component_markers(root),
            Mode::Kit => has_kit_markers(root),
            Mode::App => has_app_markers(root),
        };

        if ok {
            Ok(())
        } else {
            Err(mismatch(match mode {
                Mode::Component => {
                    format!("neither {COMPONENT_MANIFEST} nor {COMPONENT_TEMPLATE} exists")
                }
                Mode::Kit => format!("neither {KIT_MANIFEST} nor {KIT_HELPERS} exists"),
                Mode::App => format!(
                    "no {MODULE_MANIFEST}, {ENTRY_POINT} or single {COMMAND_DIR}/<name>/{ENTRY_POINT} found"
                ),
            }))
        }
    }
}

fn has_component_markers(root: &Path) -> bool {
    is_file(&root.join(COMPONENT_MANIFEST)) || is_file(&root.join(COMPONENT_TEMPLATE))
}

fn has_kit_markers(root: &Path) -> bool {
    is_file(&root.join(KIT_MANIFEST)) || is_file(&root.join(KIT_HELPERS))
}

fn has_app_markers(root: &Path) -> bool {
    is_file(&root.join(MODULE_MANIFEST))
        || is_file(&root.join(ENTRY_POINT))
        || command_entry_points(root).len() == 1
}

/// Every `cmd/<name>/main.go` below `root`, sorted by path.
///
/// Unreadable entries are skipped.
pub(crate) fn command_entry_points(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root.join(COMMAND_DIR)) else {
        return Vec::new();
    };

    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path().join(ENTRY_POINT))
        .filter(|candidate| is_file(candidate))
        .collect();
    found.sort();
    found
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("component".parse::<Mode>().unwrap(), Mode::Component);
        assert_eq!("KIT".parse::<Mode>().unwrap(), Mode::Kit);
        assert_eq!(" app ".parse::<Mode>().unwrap(), Mode::App);
        assert!("site".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::App).unwrap(), "\"app\"");
        let mode: Mode = serde_json::from_str("\"component\"").unwrap();
        assert_eq!(mode, Mode::Component);
    }

    #[test]
    fn test_detect_component_template_only() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), COMPONENT_TEMPLATE);
        assert_eq!(ModeDetector::detect(temp.path()).unwrap(), Mode::Component);
    }

    #[test]
    fn test_detect_kit_by_helpers() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), KIT_HELPERS);
        touch(temp.path(), MODULE_MANIFEST);
        assert_eq!(ModeDetector::detect(temp.path()).unwrap(), Mode::Kit);
    }

    #[test]
    fn test_detect_app_single_command() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "cmd/web/main.go");
        assert_eq!(ModeDetector::detect(temp.path()).unwrap(), Mode::App);
    }

    #[test]
    fn test_detect_ambiguous_commands_is_not_app() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "cmd/web/main.go");
        touch(temp.path(), "cmd/worker/main.go");
        assert!(matches!(
            ModeDetector::detect(temp.path()),
            Err(DevError::NotDetected { .. })
        ));
    }

    #[test]
    fn test_marker_directory_is_not_a_marker() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join(COMPONENT_MANIFEST)).unwrap();
        assert!(ModeDetector::detect(temp.path()).is_err());
    }

    #[test]
    fn test_command_entry_points_sorted() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "cmd/zeta/main.go");
        touch(temp.path(), "cmd/alpha/main.go");
        touch(temp.path(), "cmd/empty/readme.md");

        let found = command_entry_points(temp.path());
        assert_eq!(found.len(), 2);
        assert!(found[0].ends_with("cmd/alpha/main.go"));
    }
}
