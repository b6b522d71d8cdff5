//! Product Catalog
//!
//! The catalog is the authoritative row store for products and their
//! embedding vectors. Vectors are re-embedded when a new model is promoted;
//! a row's vector and the version that produced it always change together.

mod store;

pub use store::{CatalogStore, CandidateRow, ReembedReport};

use serde::{Deserialize, Serialize};

use crate::embedding::Embedding;

// ============================================================================
// DEPARTMENT
// ============================================================================

/// Department scope for a search
///
/// The closed set of departments is whatever the catalog rows carry; `All`
/// means no filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Department {
    /// No department filter
    #[default]
    All,
    /// Restrict to one department label
    Named(String),
}

impl Department {
    /// Parse a transport label; the legacy "ВСЕ"/"ALL" sentinels and empty
    /// strings mean no filter
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.eq_ignore_ascii_case("all")
            || trimmed.to_uppercase() == "ВСЕ"
        {
            Department::All
        } else {
            Department::Named(trimmed.to_uppercase())
        }
    }

    /// SQL filter value, if any
    pub fn filter(&self) -> Option<&str> {
        match self {
            Department::All => None,
            Department::Named(name) => Some(name),
        }
    }
}

impl std::fmt::Display for Department {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Department::All => write!(f, "ALL"),
            Department::Named(name) => write!(f, "{name}"),
        }
    }
}

// ============================================================================
// PRODUCT
// ============================================================================

/// A catalog row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Stable catalog identifier
    pub item_id: String,
    /// Department label; `None` for unclassified imports
    pub department: Option<String>,
    /// Display name
    pub product_name: String,
    /// Product page URL
    pub url: String,
    /// Renderable image URL
    pub picture: String,
    /// Embedding vector, if the item has been embedded
    pub vector: Option<Embedding>,
    /// Version of the model that produced `vector`
    pub model_version: Option<String>,
}

impl Product {
    /// Whether this row's vector was produced by the given model version
    pub fn is_current_for(&self, version: &str) -> bool {
        match (&self.vector, &self.model_version) {
            (Some(_), Some(v)) => v == version,
            // A row with no vector has nothing stale to serve.
            (None, _) => true,
            (Some(_), None) => false,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_department_parse_sentinels() {
        assert_eq!(Department::parse(""), Department::All);
        assert_eq!(Department::parse("all"), Department::All);
        assert_eq!(Department::parse("ВСЕ"), Department::All);
        assert_eq!(
            Department::parse("инструменты"),
            Department::Named("ИНСТРУМЕНТЫ".into())
        );
    }

    #[test]
    fn test_staleness_check() {
        let mut product = Product {
            item_id: "10042".into(),
            department: Some("ИНСТРУМЕНТЫ".into()),
            product_name: "Перфоратор".into(),
            url: "https://shop.example/10042".into(),
            picture: "https://cdn.example/10042.jpg".into(),
            vector: Some(Embedding::new(vec![1.0, 0.0])),
            model_version: Some("v1".into()),
        };
        assert!(product.is_current_for("v1"));
        assert!(!product.is_current_for("v2"));

        product.vector = None;
        assert!(product.is_current_for("v2"));
    }
}
