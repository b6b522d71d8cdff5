//! SQLite catalog store
//!
//! Single-writer multi-reader: writes go through one connection behind a
//! mutex, reads through another, WAL keeps them from blocking each other.
//! Vectors live in the `vector` BLOB column as little-endian f32 and are
//! never cached here; the rows are the source of truth.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};

use crate::embedding::{Embedding, ImageEncoder, ImageFetcher, ImageSource};
use crate::error::{Error, Result};

use super::{Department, Product};

// ============================================================================
// ROW TYPES
// ============================================================================

/// A streamed search candidate with a decoded vector
#[derive(Debug, Clone)]
pub struct CandidateRow {
    pub item_id: String,
    pub url: String,
    pub picture: String,
    pub product_name: String,
    pub department: Option<String>,
    pub vector: Vec<f32>,
}

/// Outcome of a bulk re-embedding run
#[derive(Debug, Clone, Default)]
pub struct ReembedReport {
    /// Rows whose vector was rewritten
    pub updated: usize,
    /// Rows skipped because the picture could not be fetched or embedded
    pub failed: usize,
}

// ============================================================================
// STORE
// ============================================================================

/// Catalog row store
pub struct CatalogStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl CatalogStore {
    /// Open (and initialize) the catalog at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(path)?;
        Self::configure_connection(&writer)?;
        Self::init_schema(&writer)?;

        let reader = Connection::open(path)?;
        Self::configure_connection(&reader)?;

        info!(path = %path.display(), "catalog store opened");
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS products (
                item_id TEXT PRIMARY KEY,
                url TEXT,
                picture TEXT,
                product_name TEXT,
                department TEXT,
                vector BLOB,
                model_version TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_products_department
                ON products(department);",
        )?;
        Ok(())
    }

    fn lock_reader(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Fetch one product by id
    pub fn get(&self, item_id: &str) -> Result<Product> {
        let conn = self.lock_reader();
        let row = conn
            .query_row(
                "SELECT item_id, url, picture, product_name, department, vector, model_version
                 FROM products WHERE item_id = ?1",
                params![item_id],
                Self::row_to_product,
            )
            .optional()?;
        row.ok_or_else(|| Error::NotFound(format!("item {item_id}")))
    }

    /// List products, optionally scoped to a department, ordered by `item_id`
    /// for deterministic iteration
    pub fn list(&self, department: &Department) -> Result<Vec<Product>> {
        let conn = self.lock_reader();
        let mut out = Vec::new();
        match department.filter() {
            Some(dept) => {
                let mut stmt = conn.prepare(
                    "SELECT item_id, url, picture, product_name, department, vector, model_version
                     FROM products WHERE department = ?1 ORDER BY item_id",
                )?;
                let rows = stmt.query_map(params![dept], Self::row_to_product)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT item_id, url, picture, product_name, department, vector, model_version
                     FROM products ORDER BY item_id",
                )?;
                let rows = stmt.query_map([], Self::row_to_product)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Stream embedded candidates to the retrieval engine
    ///
    /// Rows without a vector are skipped silently; rows whose blob does not
    /// decode are skipped with a warning. Ordered by `item_id`.
    pub fn scan_candidates(
        &self,
        department: &Department,
        mut f: impl FnMut(CandidateRow),
    ) -> Result<()> {
        let conn = self.lock_reader();
        let filter = department.filter();
        let sql = if filter.is_some() {
            "SELECT item_id, url, picture, product_name, department, vector
             FROM products WHERE department = ?1 AND vector IS NOT NULL
             ORDER BY item_id"
        } else {
            "SELECT item_id, url, picture, product_name, department, vector
             FROM products WHERE vector IS NOT NULL
             ORDER BY item_id"
        };
        let mut stmt = conn.prepare(sql)?;
        let mut rows = match filter {
            Some(dept) => stmt.query(params![dept])?,
            None => stmt.query([])?,
        };

        while let Some(row) = rows.next()? {
            let item_id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(5)?;
            let Some(embedding) = Embedding::from_bytes(&blob) else {
                warn!(item_id = %item_id, len = blob.len(), "unreadable vector blob, row skipped");
                continue;
            };
            f(CandidateRow {
                item_id,
                url: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                picture: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                product_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                department: row.get(4)?,
                vector: embedding.as_slice().to_vec(),
            });
        }
        Ok(())
    }

    /// Distinct departments with item counts
    ///
    /// NULL departments and the literal `'nan'` left over from spreadsheet
    /// imports are excluded.
    pub fn departments(&self) -> Result<Vec<(String, usize)>> {
        let conn = self.lock_reader();
        let mut stmt = conn.prepare(
            "SELECT department, COUNT(*) FROM products
             WHERE department IS NOT NULL AND department != 'nan'
             GROUP BY department ORDER BY department",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Total row count
    pub fn count(&self) -> Result<usize> {
        let conn = self.lock_reader();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM products", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Rows whose vector was produced by a different model version
    pub fn stale_vector_count(&self, active_version: &str) -> Result<usize> {
        let conn = self.lock_reader();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM products
             WHERE vector IS NOT NULL
               AND (model_version IS NULL OR model_version != ?1)",
            params![active_version],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Insert or replace a product row
    pub fn upsert(&self, product: &Product) -> Result<()> {
        let conn = self.lock_writer();
        conn.execute(
            "INSERT INTO products
                 (item_id, url, picture, product_name, department, vector, model_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(item_id) DO UPDATE SET
                 url = excluded.url,
                 picture = excluded.picture,
                 product_name = excluded.product_name,
                 department = excluded.department,
                 vector = excluded.vector,
                 model_version = excluded.model_version",
            params![
                product.item_id,
                product.url,
                product.picture,
                product.product_name,
                product.department,
                product.vector.as_ref().map(|v| v.to_bytes()),
                product.model_version,
            ],
        )?;
        Ok(())
    }

    /// Insert a product and embed it from its picture fused with its name
    ///
    /// Catalog items get both modalities: the picture dominates, the name
    /// nudges visually ambiguous items toward the right neighborhood.
    /// Query-side embedding stays image-only.
    pub async fn insert_embedded(
        &self,
        product: &Product,
        encoder: &dyn ImageEncoder,
        fetcher: &ImageFetcher,
    ) -> Result<()> {
        let image = fetcher.load(&ImageSource::parse(&product.picture)).await?;
        let image_vec = encoder.embed_image(&image)?;
        let text_vec = encoder.embed_text(&product.product_name)?;

        let mut row = product.clone();
        row.vector = Some(Embedding::fuse(&image_vec, &text_vec));
        row.model_version = Some(encoder.version().to_string());
        self.upsert(&row)
    }

    /// Rewrite a row's vector and the version that produced it in one update
    pub fn update_vector(
        &self,
        item_id: &str,
        vector: &Embedding,
        model_version: &str,
    ) -> Result<()> {
        let conn = self.lock_writer();
        let changed = conn.execute(
            "UPDATE products SET vector = ?2, model_version = ?3 WHERE item_id = ?1",
            params![item_id, vector.to_bytes(), model_version],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("item {item_id}")));
        }
        Ok(())
    }

    // ========================================================================
    // RE-EMBEDDING
    // ========================================================================

    /// Re-embed every row with a picture using the given encoder
    ///
    /// Connection locks are released while pictures are fetched and encoded;
    /// each row's vector/version pair is written atomically as it completes.
    pub async fn re_embed_all(
        &self,
        encoder: &dyn ImageEncoder,
        fetcher: &ImageFetcher,
    ) -> Result<ReembedReport> {
        let targets: Vec<(String, String)> = {
            let conn = self.lock_reader();
            let mut stmt = conn.prepare(
                "SELECT item_id, picture FROM products
                 WHERE picture IS NOT NULL AND picture != ''
                 ORDER BY item_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let total = targets.len();
        let version = encoder.version().to_string();
        info!(total, version = %version, "catalog re-embedding started");

        let mut report = ReembedReport::default();
        for (idx, (item_id, picture)) in targets.into_iter().enumerate() {
            let source = ImageSource::parse(&picture);
            let embedded = match fetcher.load(&source).await {
                Ok(img) => encoder.embed_image(&img),
                Err(e) => Err(e),
            };
            match embedded {
                Ok(vector) => {
                    self.update_vector(&item_id, &vector, &version)?;
                    report.updated += 1;
                }
                Err(e) => {
                    warn!(item_id = %item_id, error = %e, "re-embed skipped row");
                    report.failed += 1;
                }
            }
            if (idx + 1) % 100 == 0 {
                info!(done = idx + 1, total, "re-embedding progress");
            }
        }

        info!(
            updated = report.updated,
            failed = report.failed,
            "catalog re-embedding finished"
        );
        Ok(report)
    }
}

impl CatalogStore {
    fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
        let blob: Option<Vec<u8>> = row.get(5)?;
        Ok(Product {
            item_id: row.get(0)?,
            url: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            picture: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            product_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            department: row.get(4)?,
            vector: blob.as_deref().and_then(Embedding::from_bytes),
            model_version: row.get(6)?,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
