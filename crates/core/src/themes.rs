//! Theme membership index read from the canonical state tree.
//!
//! Each `themes/<name>.json` lists the source files the theme claims:
//!
//! ```json
//! { "name": "authentication", "files": ["src/auth/login.rs"] }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::fsutil;
use crate::store::ThemeResolver;

#[derive(Debug, Deserialize)]
struct ThemeFile {
    name: Option<String>,
    #[serde(default)]
    files: Vec<String>,
}

/// File path → owning themes, built once from a state directory.
#[derive(Debug, Clone, Default)]
pub struct ThemeIndex {
    by_file: BTreeMap<String, Vec<String>>,
    themes: Vec<String>,
}

impl ThemeIndex {
    /// Scan `<state_dir>/themes`. Unreadable or malformed theme files are
    /// skipped with a warning.
    pub fn load(state_dir: &Path) -> Self {
        let mut index = Self::default();
        let files = match fsutil::list_files(&state_dir.join("themes"), ".json") {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "cannot list theme files");
                return index;
            }
        };

        for (file_name, path) in files {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str::<ThemeFile>(&s).map_err(|e| e.to_string()));
            let theme = match parsed {
                Ok(theme) => theme,
                Err(e) => {
                    warn!(file = %file_name, error = %e, "skipping unreadable theme file");
                    continue;
                }
            };
            let name = theme
                .name
                .unwrap_or_else(|| file_name.trim_end_matches(".json").to_string());
            for file in theme.files {
                let owners = index.by_file.entry(normalize(&file)).or_default();
                if !owners.contains(&name) {
                    owners.push(name.clone());
                }
            }
            index.themes.push(name);
        }
        debug!(
            themes = index.themes.len(),
            files = index.by_file.len(),
            "loaded theme index"
        );
        index
    }

    /// Theme names in file-name order.
    pub fn themes(&self) -> &[String] {
        &self.themes
    }
}

impl ThemeResolver for ThemeIndex {
    fn themes_for_file(&self, path: &str) -> Vec<String> {
        self.by_file.get(&normalize(path)).cloned().unwrap_or_default()
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_reads_theme_files() {
        let dir = tempfile::tempdir().unwrap();
        let themes = dir.path().join("themes");
        std::fs::create_dir_all(&themes).unwrap();
        std::fs::write(
            themes.join("authentication.json"),
            r#"{"name":"authentication","files":["src/auth/login.rs","./src/session.rs"]}"#,
        )
        .unwrap();
        std::fs::write(themes.join("security.json"), r#"{"files":["src/auth/login.rs"]}"#)
            .unwrap();
        std::fs::write(themes.join("broken.json"), "{not json").unwrap();

        let index = ThemeIndex::load(dir.path());
        assert_eq!(index.themes(), &["authentication", "security"]);
        assert_eq!(
            index.themes_for_file("src/auth/login.rs"),
            vec!["authentication", "security"]
        );
        assert_eq!(index.themes_for_file("src/session.rs"), vec!["authentication"]);
        assert!(index.themes_for_file("README.md").is_empty());
    }

    #[test]
    fn test_missing_themes_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = ThemeIndex::load(dir.path());
        assert!(index.themes().is_empty());
    }
}
