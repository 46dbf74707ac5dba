//! Table and column filtering for row changes
//!
//! Only audited tables are persisted. Tables are matched against glob
//! patterns on the qualified `db.table` name or the bare table name; excludes
//! take precedence over includes. Sensitive columns can be masked in both row
//! images before anything is stored.
//!
//! ```yaml
//! filter:
//!   include_tables: ["shop.*"]
//!   exclude_tables: ["*.sessions"]
//!   mask_columns: ["password", "card_number"]
//! ```

use crate::error::{AuditError, Result};
use crate::event::RowChangeEvent;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Replacement value for masked columns.
pub const MASK: &str = "***REDACTED***";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFilterConfig {
    /// Tables to include (glob, e.g. `shop.*`)
    #[serde(default = "default_include")]
    pub include_tables: Vec<String>,

    /// Tables to exclude (evaluated first)
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Columns to mask in every table (case-insensitive)
    #[serde(default)]
    pub mask_columns: Vec<String>,
}

fn default_include() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for TableFilterConfig {
    fn default() -> Self {
        Self {
            include_tables: default_include(),
            exclude_tables: vec![],
            mask_columns: vec![],
        }
    }
}

/// Compiled filter.
#[derive(Debug, Clone)]
pub struct TableFilter {
    include_patterns: Vec<Regex>,
    exclude_patterns: Vec<Regex>,
    mask_set: HashSet<String>,
}

impl TableFilter {
    pub fn new(config: &TableFilterConfig) -> Result<Self> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| glob_to_regex(p))
                .collect::<Result<Vec<_>>>()
        };

        Ok(Self {
            include_patterns: compile(&config.include_tables)?,
            exclude_patterns: compile(&config.exclude_tables)?,
            mask_set: config
                .mask_columns
                .iter()
                .map(|c| c.to_lowercase())
                .collect(),
        })
    }

    /// Filter that lets everything through unchanged.
    pub fn allow_all() -> Self {
        Self {
            include_patterns: vec![],
            exclude_patterns: vec![],
            mask_set: HashSet::new(),
        }
    }

    pub fn should_include_table(&self, database: &str, table: &str) -> bool {
        let full_name = format!("{}.{}", database, table);
        let matches = |p: &Regex| p.is_match(&full_name) || p.is_match(table);

        if self.exclude_patterns.iter().any(matches) {
            return false;
        }
        // empty include list means "all tables"
        self.include_patterns.is_empty() || self.include_patterns.iter().any(matches)
    }

    /// Returns false if the event should be dropped; masks columns in place otherwise.
    pub fn apply(&self, event: &mut RowChangeEvent) -> bool {
        if !self.should_include_table(&event.database, &event.table) {
            return false;
        }
        if !self.mask_set.is_empty() {
            for image in [&mut event.data.before, &mut event.data.after]
                .into_iter()
                .flatten()
            {
                self.mask(image);
            }
        }
        true
    }

    fn mask(&self, value: &mut serde_json::Value) {
        if let serde_json::Value::Object(map) = value {
            for (key, v) in map.iter_mut() {
                if self.mask_set.contains(&key.to_lowercase()) {
                    *v = serde_json::Value::String(MASK.to_string());
                }
            }
        }
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern);
    let regex_pattern = escaped.replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{}$", regex_pattern))
        .map_err(|e| AuditError::config(format!("invalid table pattern '{}': {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RowAction;
    use chrono::Utc;
    use serde_json::json;

    fn event(db: &str, table: &str) -> RowChangeEvent {
        RowChangeEvent::new(db, table, RowAction::Update, "T1", Utc::now())
    }

    #[test]
    fn test_default_includes_everything() {
        let filter = TableFilter::new(&TableFilterConfig::default()).unwrap();
        assert!(filter.should_include_table("any", "thing"));
        assert!(TableFilter::allow_all().should_include_table("x", "y"));
    }

    #[test]
    fn test_include_and_exclude() {
        let filter = TableFilter::new(&TableFilterConfig {
            include_tables: vec!["shop.*".into(), "billing.invoices".into()],
            exclude_tables: vec!["*.sessions".into()],
            mask_columns: vec![],
        })
        .unwrap();

        assert!(filter.should_include_table("shop", "orders"));
        assert!(filter.should_include_table("billing", "invoices"));
        assert!(!filter.should_include_table("billing", "payments"));
        assert!(!filter.should_include_table("shop", "sessions"));
    }

    #[test]
    fn test_bare_table_pattern() {
        let filter = TableFilter::new(&TableFilterConfig {
            include_tables: vec!["users".into()],
            ..Default::default()
        })
        .unwrap();
        assert!(filter.should_include_table("app", "users"));
        assert!(!filter.should_include_table("app", "users_archive"));
    }

    #[test]
    fn test_apply_masks_both_images() {
        let filter = TableFilter::new(&TableFilterConfig {
            mask_columns: vec!["Password".into()],
            ..Default::default()
        })
        .unwrap();

        let mut e = event("app", "users")
            .with_before(json!({"id": 1, "password": "old"}))
            .with_after(json!({"id": 1, "password": "new"}));

        assert!(filter.apply(&mut e));
        assert_eq!(e.data.before.unwrap()["password"], MASK);
        let after = e.data.after.unwrap();
        assert_eq!(after["password"], MASK);
        assert_eq!(after["id"], 1);
    }

    #[test]
    fn test_apply_drops_excluded() {
        let filter = TableFilter::new(&TableFilterConfig {
            exclude_tables: vec!["tmp.*".into()],
            ..Default::default()
        })
        .unwrap();
        assert!(!filter.apply(&mut event("tmp", "scratch")));
    }
}
