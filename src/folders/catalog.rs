//! Closed set of destination folders the classifier may move mail into.

use std::collections::BTreeMap;

/// Logical name → folder path, e.g. `newsletter` → `Mailman/Newsletter`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationCatalog {
    entries: BTreeMap<String, String>,
}

impl DestinationCatalog {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    /// Destination paths, deduplicated, in logical-name order.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::with_capacity(self.entries.len());
        for path in self.entries.values() {
            if !paths.contains(&path.as_str()) {
                paths.push(path);
            }
        }
        paths
    }

    /// Exact, case-sensitive membership. The model must copy a listed path
    /// verbatim.
    pub fn contains_path(&self, path: &str) -> bool {
        self.entries.values().any(|p| p == path)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DestinationCatalog {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_is_exact() {
        let catalog: DestinationCatalog = [("newsletter", "Mailman/Newsletter")].into_iter().collect();
        assert!(catalog.contains_path("Mailman/Newsletter"));
        assert!(!catalog.contains_path("mailman/newsletter"));
        assert!(!catalog.contains_path("Mailman\\Newsletter"));
    }

    #[test]
    fn paths_are_deduplicated() {
        let catalog: DestinationCatalog = [
            ("news", "Mailman/Newsletter"),
            ("digest", "Mailman/Newsletter"),
            ("receipts", "Finance/Receipts"),
        ]
        .into_iter()
        .collect();
        assert_eq!(catalog.paths(), vec!["Mailman/Newsletter", "Finance/Receipts"]);
    }
}
