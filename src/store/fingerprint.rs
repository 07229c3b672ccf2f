//! Perceptual-hash fingerprint persistence, one row per listing image.
//!
//! `hash_bits` is the source of truth; the hex form is derived from it at
//! write time and kept only for indexed lookup and inspection.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

pub const HASH_METHOD_PHASH: &str = "phash";

#[derive(Debug, Clone)]
pub struct ImageFingerprint {
    pub id: i64,
    pub listing_id: i64,
    pub image_url: String,
    pub hash_method: String,
    pub hash_hex: String,
    pub hash_bits: u64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub file_size: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a fingerprint about to be persisted.
#[derive(Debug, Clone)]
pub struct NewFingerprint {
    pub listing_id: i64,
    pub image_url: String,
    pub hash_method: String,
    pub hash_bits: u64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub file_size: Option<i64>,
}

pub fn hash_hex(hash_bits: u64) -> String {
    format!("{hash_bits:016x}")
}

pub struct FingerprintStore;

impl FingerprintStore {
    /// Drop all fingerprints of a listing ahead of a rebuild.
    pub async fn delete_for_listing(conn: &mut SqliteConnection, listing_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM image_fingerprints WHERE listing_id = ?")
            .bind(listing_id)
            .execute(&mut *conn)
            .await
            .context("Failed to delete fingerprints for listing")?;
        Ok(result.rows_affected())
    }

    pub async fn add(
        conn: &mut SqliteConnection,
        fingerprint: &NewFingerprint,
    ) -> Result<ImageFingerprint> {
        let now = Utc::now();
        let hex = hash_hex(fingerprint.hash_bits);
        let result = sqlx::query(
            r#"
            INSERT INTO image_fingerprints (
                listing_id, image_url, hash_method, hash_hex, hash_bits,
                width, height, file_size, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(fingerprint.listing_id)
        .bind(&fingerprint.image_url)
        .bind(&fingerprint.hash_method)
        .bind(&hex)
        .bind(fingerprint.hash_bits as i64)
        .bind(fingerprint.width)
        .bind(fingerprint.height)
        .bind(fingerprint.file_size)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("Failed to insert fingerprint")?;

        Ok(ImageFingerprint {
            id: result.last_insert_rowid(),
            listing_id: fingerprint.listing_id,
            image_url: fingerprint.image_url.clone(),
            hash_method: fingerprint.hash_method.clone(),
            hash_hex: hex,
            hash_bits: fingerprint.hash_bits,
            width: fingerprint.width,
            height: fingerprint.height,
            file_size: fingerprint.file_size,
            created_at: now,
            updated_at: now,
        })
    }

    /// All fingerprints across listings, optionally excluding one listing.
    pub async fn list_all(
        conn: &mut SqliteConnection,
        exclude_listing: Option<i64>,
    ) -> Result<Vec<ImageFingerprint>> {
        let rows = match exclude_listing {
            Some(listing_id) => {
                sqlx::query("SELECT * FROM image_fingerprints WHERE listing_id != ?")
                    .bind(listing_id)
                    .fetch_all(&mut *conn)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM image_fingerprints")
                    .fetch_all(&mut *conn)
                    .await
            }
        }
        .context("Failed to list fingerprints")?;
        rows.iter().map(fingerprint_from_row).collect()
    }

    pub async fn list_by_listing(
        conn: &mut SqliteConnection,
        listing_id: i64,
    ) -> Result<Vec<ImageFingerprint>> {
        let rows = sqlx::query("SELECT * FROM image_fingerprints WHERE listing_id = ?")
            .bind(listing_id)
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list fingerprints for listing")?;
        rows.iter().map(fingerprint_from_row).collect()
    }
}

fn fingerprint_from_row(row: &SqliteRow) -> Result<ImageFingerprint> {
    let bits: i64 = row.try_get("hash_bits")?;
    Ok(ImageFingerprint {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        image_url: row.try_get("image_url")?,
        hash_method: row.try_get("hash_method")?,
        hash_hex: row.try_get("hash_hex")?,
        hash_bits: bits as u64,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        file_size: row.try_get("file_size")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_form_is_sixteen_lowercase_digits() {
        assert_eq!(hash_hex(0), "0000000000000000");
        assert_eq!(hash_hex(u64::MAX), "ffffffffffffffff");
        assert_eq!(hash_hex(0xdead_beef), "00000000deadbeef");
    }
}
