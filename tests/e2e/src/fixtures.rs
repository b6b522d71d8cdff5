//! Deterministic catalog and photo fixtures

use std::path::PathBuf;
use std::sync::Arc;

use toolsight_core::{CatalogStore, Embedding, Product};

/// Dimensionality used by the stub encoder and the fixtures
pub const TEST_DIM: usize = 8;

/// A unit vector at `angle` radians on the first two axes
pub fn unit_at(angle: f32) -> Vec<f32> {
    let mut v = vec![0.0; TEST_DIM];
    v[0] = angle.cos();
    v[1] = angle.sin();
    v
}

/// Write a solid-color photo whose red channel drives the stub encoder
///
/// Red 0 lands at angle 0; red 255 lands at ~1.57 (orthogonal to red 0).
pub fn photo_with_red(dir: &std::path::Path, name: &str, red: u8) -> PathBuf {
    let path = dir.join(format!("{name}.png"));
    image::RgbImage::from_pixel(32, 32, image::Rgb([red, 40, 40]))
        .save(&path)
        .expect("fixture photo");
    path
}

/// Seed `n` products spread across the unit circle, alternating departments
///
/// Item ids are zero-padded so lexicographic order equals numeric order; item
/// `k` sits at angle `k * step`, so items near angle 0 are the best matches
/// for a red-0 query photo.
pub fn seed_catalog(store: &Arc<CatalogStore>, n: usize, step: f32) {
    for k in 0..n {
        let department = match k % 3 {
            0 => Some("ИНСТРУМЕНТЫ"),
            1 => Some("КРЕПЕЖ"),
            _ => Some("САНТЕХНИКА"),
        };
        store
            .upsert(&Product {
                item_id: format!("{k:05}"),
                department: department.map(Into::into),
                product_name: format!("товар {k}"),
                url: format!("https://shop.example/{k}"),
                picture: format!("https://cdn.example/{k}.jpg"),
                vector: Some(Embedding::new(unit_at(k as f32 * step))),
                model_version: Some("v1".into()),
            })
            .expect("seed product");
    }
}
