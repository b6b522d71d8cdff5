//! Linear-scan retrieval over the catalog store

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::catalog::{CatalogStore, Department};
use crate::embedding::{Embedding, dot_product};
use crate::error::Result;

use super::{SearchHit, SearchMethod, Searcher, THRESHOLD_FLOOR, THRESHOLD_LADDER};

// ============================================================================
// OPTIONS
// ============================================================================

/// Tunable cutoffs for the engine
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    /// Lowest similarity ever reported to the user
    pub user_floor: f32,
    /// Filter applied when an escalation rung already fills the result set
    pub secondary_filter: f32,
    /// Repeats in the stability check
    pub stability_passes: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            user_floor: 0.2,
            secondary_filter: 0.2,
            stability_passes: 3,
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Brute-force k-NN over catalog vectors
///
/// Receives its catalog store at construction; no hidden globals, no caches.
pub struct RetrievalEngine {
    catalog: Arc<CatalogStore>,
    options: RetrievalOptions,
}

impl RetrievalEngine {
    /// Build an engine over a catalog store
    pub fn new(catalog: Arc<CatalogStore>, options: RetrievalOptions) -> Self {
        Self { catalog, options }
    }

    /// Single scan at a fixed similarity cutoff
    ///
    /// Results are sorted by `(-similarity, item_id)`; the id tie-break keeps
    /// repeated runs byte-identical.
    fn scan(
        &self,
        query: &Embedding,
        department: &Department,
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let q = query.as_slice();
        let mut hits = Vec::new();
        self.catalog.scan_candidates(department, |row| {
            if row.vector.len() != q.len() {
                return;
            }
            let similarity = dot_product(q, &row.vector);
            if similarity >= min_similarity {
                hits.push(SearchHit {
                    item_id: row.item_id,
                    picture: row.picture,
                    url: row.url,
                    product_name: row.product_name,
                    department: row.department,
                    similarity,
                    stability: 1.0,
                });
            }
        })?;

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Walk the threshold ladder until a rung yields `top_k` candidates
    fn search_with_escalation(
        &self,
        query: &Embedding,
        department: &Department,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        for threshold in THRESHOLD_LADDER {
            let results = self.scan(query, department, top_k * 2, threshold)?;
            if results.len() >= top_k {
                debug!(threshold, found = results.len(), "ladder rung satisfied");
                // The rung overshoots on purpose; keep only candidates the
                // user floor considers presentable when enough survive it.
                let filtered: Vec<SearchHit> = results
                    .iter()
                    .filter(|hit| hit.similarity >= self.options.secondary_filter)
                    .cloned()
                    .collect();
                let mut chosen = if filtered.len() >= top_k { filtered } else { results };
                chosen.truncate(top_k);
                return Ok(chosen);
            }
        }

        // Every rung came up short; whatever clears the floor is returned,
        // possibly fewer than top_k, possibly nothing.
        debug!(floor = THRESHOLD_FLOOR, "ladder exhausted, using floor");
        self.scan(query, department, top_k, THRESHOLD_FLOOR)
    }

    /// Repeat the escalation and keep items by mean similarity
    fn search_with_stability(
        &self,
        query: &Embedding,
        department: &Department,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let passes = self.options.stability_passes.max(1);
        let mut observed: HashMap<String, (SearchHit, Vec<f32>)> = HashMap::new();
        let mut ran = 0usize;

        for _ in 0..passes {
            let results = self.search_with_escalation(query, department, top_k)?;
            ran += 1;
            for hit in results {
                observed
                    .entry(hit.item_id.clone())
                    .and_modify(|(_, sims)| sims.push(hit.similarity))
                    .or_insert_with(|| {
                        let sim = hit.similarity;
                        (hit, vec![sim])
                    });
            }
        }

        let mut stable: Vec<SearchHit> = observed
            .into_values()
            .filter_map(|(mut hit, sims)| {
                let mean = sims.iter().sum::<f32>() / sims.len() as f32;
                if mean >= self.options.user_floor {
                    hit.similarity = mean;
                    hit.stability = sims.len() as f32 / ran as f32;
                    Some(hit)
                } else {
                    None
                }
            })
            .collect();

        stable.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        stable.truncate(top_k);
        Ok(stable)
    }
}

impl Searcher for RetrievalEngine {
    fn search(
        &self,
        query: &Embedding,
        department: &Department,
        top_k: usize,
        method: SearchMethod,
    ) -> Result<Vec<SearchHit>> {
        match method {
            SearchMethod::Thresholds => self.search_with_escalation(query, department, top_k),
            SearchMethod::Stability => self.search_with_stability(query, department, top_k),
            SearchMethod::Aggressive => self.scan(query, department, top_k, f32::MIN),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
