//! Best-effort mapping from a changed source path to candidate themes.
//!
//! Three independent sources are unioned: the explicit membership table
//! behind a [`ThemeResolver`], a directory-name dictionary, and a glob
//! dictionary over the file name. None of them is exact.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::config::HeuristicsConfig;
use crate::store::ThemeResolver;

#[derive(Debug, Clone, Default)]
pub struct ThemeHeuristics {
    directory_themes: BTreeMap<String, String>,
    filename_patterns: BTreeMap<String, String>,
}

impl ThemeHeuristics {
    pub fn new(config: &HeuristicsConfig) -> Self {
        Self {
            directory_themes: config
                .directory_themes
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect(),
            filename_patterns: config
                .filename_patterns
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect(),
        }
    }

    /// Themes suggested by the directory names along `path`.
    pub fn directory_matches(&self, path: &str) -> BTreeSet<String> {
        let path = Path::new(path);
        let mut themes = BTreeSet::new();
        if let Some(parent) = path.parent() {
            for component in parent.components() {
                let name = component.as_os_str().to_string_lossy().to_ascii_lowercase();
                if let Some(theme) = self.directory_themes.get(&name) {
                    themes.insert(theme.clone());
                }
            }
        }
        themes
    }

    /// Themes suggested by glob patterns over the file name.
    pub fn filename_matches(&self, path: &str) -> BTreeSet<String> {
        let file_name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        self.filename_patterns
            .iter()
            .filter(|(pattern, _)| glob_match::glob_match(pattern, &file_name))
            .map(|(_, theme)| theme.clone())
            .collect()
    }

    /// Union of all three sources, sorted.
    pub fn themes_for(&self, path: &str, resolver: &dyn ThemeResolver) -> Vec<String> {
        let mut themes: BTreeSet<String> = resolver.themes_for_file(path).into_iter().collect();
        themes.extend(self.directory_matches(path));
        themes.extend(self.filename_matches(path));
        themes.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StaticThemeResolver;

    #[test]
    fn test_directory_dictionary() {
        let h = ThemeHeuristics::new(&HeuristicsConfig::default());
        let themes = h.directory_matches("src/auth/handlers/mod.rs");
        assert!(themes.contains("authentication"));
        assert!(h.directory_matches("auth").is_empty());
    }

    #[test]
    fn test_filename_patterns() {
        let h = ThemeHeuristics::new(&HeuristicsConfig::default());
        assert!(h.filename_matches("migrations/001_init.sql").contains("database"));
        assert!(h.filename_matches("web/Login.tsx").contains("authentication"));
        assert!(h.filename_matches("src/lib.rs").is_empty());
    }

    #[test]
    fn test_union_of_sources() {
        let h = ThemeHeuristics::new(&HeuristicsConfig::default());
        let resolver = StaticThemeResolver::new().with("src/db/schema.rs", "persistence");
        assert_eq!(
            h.themes_for("src/db/schema.rs", &resolver),
            vec!["database", "persistence"]
        );
        assert!(h.themes_for("Cargo.toml", &resolver).is_empty());
    }
}
