use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use std::str::FromStr;

use crate::config::EntityConfig;
use crate::error::{MediaError, MediaResult};
use crate::model::{Asset, AssetStatus, OwnerLink, Rendition, SourceKind};
use crate::profiles::Codec;

/// Persistence contract for assets, renditions, and owner links. The claim is
/// the single coordination primitive between concurrent workers.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn insert_asset(&self, asset: &Asset) -> MediaResult<Asset>;
    async fn update_asset(&self, asset: &Asset) -> MediaResult<()>;
    async fn find_asset(&self, id: i64) -> MediaResult<Option<Asset>>;
    async fn delete_asset(&self, id: i64) -> MediaResult<()>;

    /// Conditional `{queued,failed} -> processing` transition, executed as one
    /// statement. Returns the affected-row count: 1 means this caller holds
    /// the claim, 0 means another worker already advanced the row.
    async fn claim(&self, id: i64) -> MediaResult<u64>;

    async fn insert_rendition(&self, rendition: &Rendition) -> MediaResult<Rendition>;
    async fn list_renditions(&self, asset_id: i64) -> MediaResult<Vec<Rendition>>;
    async fn count_renditions(&self, asset_id: i64) -> MediaResult<u64>;

    async fn insert_owner_link(&self, link: &OwnerLink) -> MediaResult<OwnerLink>;
    async fn first_owner_link(&self, asset_id: i64) -> MediaResult<Option<OwnerLink>>;

    async fn find_ready_by_checksum(&self, sha1: &str) -> MediaResult<Option<Asset>>;
    async fn find_failed_older_than(&self, cutoff: DateTime<Utc>) -> MediaResult<Vec<Asset>>;
}

/// PostgreSQL-backed store. Table names come from the `entities` config
/// section so embedders can fit the pipeline into an existing schema.
pub struct PgAssetStore {
    pool: PgPool,
    tables: EntityConfig,
}

impl PgAssetStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_tables(pool, EntityConfig::default())
    }

    pub fn with_tables(pool: PgPool, tables: EntityConfig) -> Self {
        PgAssetStore { pool, tables }
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(pool: &PgPool) -> MediaResult<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| MediaError::PersistenceFailed {
                reason: format!("migration failed: {e}"),
            })
    }
}

#[derive(sqlx::FromRow)]
struct AssetRow {
    id: i64,
    profile: String,
    source: String,
    source_url: Option<String>,
    original_jpg_key: Option<String>,
    original_webp_key: Option<String>,
    original_width: Option<i32>,
    original_height: Option<i32>,
    checksum_sha1: Option<String>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AssetRow> for Asset {
    type Error = MediaError;

    fn try_from(row: AssetRow) -> Result<Self, Self::Error> {
        Ok(Asset {
            id: row.id,
            profile: row.profile,
            source: SourceKind::from_str(&row.source).map_err(|_| {
                MediaError::PersistenceFailed {
                    reason: format!("unknown source kind '{}'", row.source),
                }
            })?,
            source_url: row.source_url,
            original_jpg_key: row.original_jpg_key,
            original_webp_key: row.original_webp_key,
            original_width: row.original_width.map(|w| w as u32),
            original_height: row.original_height.map(|h| h as u32),
            checksum_sha1: row.checksum_sha1,
            status: AssetStatus::from_str(&row.status).map_err(|_| {
                MediaError::PersistenceFailed {
                    reason: format!("unknown asset status '{}'", row.status),
                }
            })?,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RenditionRow {
    id: i64,
    asset_id: i64,
    variant: String,
    format: String,
    object_key: String,
    width: i32,
    height: i32,
    bytes: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<RenditionRow> for Rendition {
    type Error = MediaError;

    fn try_from(row: RenditionRow) -> Result<Self, Self::Error> {
        Ok(Rendition {
            id: row.id,
            asset_id: row.asset_id,
            variant: row.variant,
            codec: Codec::from_str(&row.format).map_err(|_| MediaError::PersistenceFailed {
                reason: format!("unknown rendition format '{}'", row.format),
            })?,
            key: row.object_key,
            width: row.width.max(0) as u32,
            height: row.height.max(0) as u32,
            bytes: row.bytes.max(0) as u64,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OwnerLinkRow {
    id: i64,
    owner_type: String,
    owner_id: i64,
    asset_id: i64,
    role: String,
    sort: i32,
    created_at: DateTime<Utc>,
}

impl From<OwnerLinkRow> for OwnerLink {
    fn from(row: OwnerLinkRow) -> Self {
        OwnerLink {
            id: row.id,
            owner_type: row.owner_type,
            owner_id: row.owner_id,
            asset_id: row.asset_id,
            role: row.role,
            sort: row.sort,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl AssetStore for PgAssetStore {
    async fn insert_asset(&self, asset: &Asset) -> MediaResult<Asset> {
        let sql = format!(
            "INSERT INTO {} (profile, source, source_url, original_jpg_key, original_webp_key, \
             original_width, original_height, checksum_sha1, status, attempts, last_error, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) RETURNING id",
            self.tables.asset_table
        );
        let id: i64 = sqlx::query_scalar(&sql)
            .bind(&asset.profile)
            .bind(asset.source.to_string())
            .bind(&asset.source_url)
            .bind(&asset.original_jpg_key)
            .bind(&asset.original_webp_key)
            .bind(asset.original_width.map(|w| w as i32))
            .bind(asset.original_height.map(|h| h as i32))
            .bind(&asset.checksum_sha1)
            .bind(asset.status.to_string())
            .bind(asset.attempts as i32)
            .bind(&asset.last_error)
            .bind(asset.created_at)
            .bind(asset.updated_at)
            .fetch_one(&self.pool)
            .await?;

        let mut inserted = asset.clone();
        inserted.id = id;
        Ok(inserted)
    }

    async fn update_asset(&self, asset: &Asset) -> MediaResult<()> {
        let sql = format!(
            "UPDATE {} SET profile = $2, source = $3, source_url = $4, original_jpg_key = $5, \
             original_webp_key = $6, original_width = $7, original_height = $8, \
             checksum_sha1 = $9, status = $10, attempts = $11, last_error = $12, updated_at = $13 \
             WHERE id = $1",
            self.tables.asset_table
        );
        sqlx::query(&sql)
            .bind(asset.id)
            .bind(&asset.profile)
            .bind(asset.source.to_string())
            .bind(&asset.source_url)
            .bind(&asset.original_jpg_key)
            .bind(&asset.original_webp_key)
            .bind(asset.original_width.map(|w| w as i32))
            .bind(asset.original_height.map(|h| h as i32))
            .bind(&asset.checksum_sha1)
            .bind(asset.status.to_string())
            .bind(asset.attempts as i32)
            .bind(&asset.last_error)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_asset(&self, id: i64) -> MediaResult<Option<Asset>> {
        let sql = format!("SELECT * FROM {} WHERE id = $1", self.tables.asset_table);
        let row: Option<AssetRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Asset::try_from).transpose()
    }

    async fn delete_asset(&self, id: i64) -> MediaResult<()> {
        // Renditions and owner links cascade.
        let sql = format!("DELETE FROM {} WHERE id = $1", self.tables.asset_table);
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn claim(&self, id: i64) -> MediaResult<u64> {
        let sql = format!(
            "UPDATE {} SET status = 'processing', updated_at = now() \
             WHERE id = $1 AND status IN ('queued', 'failed')",
            self.tables.asset_table
        );
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_rendition(&self, rendition: &Rendition) -> MediaResult<Rendition> {
        let sql = format!(
            "INSERT INTO {} (asset_id, variant, format, object_key, width, height, bytes, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
            self.tables.variant_table
        );
        let id: i64 = sqlx::query_scalar(&sql)
            .bind(rendition.asset_id)
            .bind(&rendition.variant)
            .bind(rendition.codec.to_string())
            .bind(&rendition.key)
            .bind(rendition.width as i32)
            .bind(rendition.height as i32)
            .bind(rendition.bytes as i64)
            .bind(rendition.created_at)
            .fetch_one(&self.pool)
            .await?;

        let mut inserted = rendition.clone();
        inserted.id = id;
        Ok(inserted)
    }

    async fn list_renditions(&self, asset_id: i64) -> MediaResult<Vec<Rendition>> {
        let sql = format!(
            "SELECT * FROM {} WHERE asset_id = $1 ORDER BY id",
            self.tables.variant_table
        );
        let rows: Vec<RenditionRow> = sqlx::query_as(&sql)
            .bind(asset_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Rendition::try_from).collect()
    }

    async fn count_renditions(&self, asset_id: i64) -> MediaResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE asset_id = $1",
            self.tables.variant_table
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(asset_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn insert_owner_link(&self, link: &OwnerLink) -> MediaResult<OwnerLink> {
        let sql = format!(
            "INSERT INTO {} (owner_type, owner_id, asset_id, role, sort, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
            self.tables.link_table
        );
        let id: i64 = sqlx::query_scalar(&sql)
            .bind(&link.owner_type)
            .bind(link.owner_id)
            .bind(link.asset_id)
            .bind(&link.role)
            .bind(link.sort)
            .bind(link.created_at)
            .fetch_one(&self.pool)
            .await?;

        let mut inserted = link.clone();
        inserted.id = id;
        Ok(inserted)
    }

    async fn first_owner_link(&self, asset_id: i64) -> MediaResult<Option<OwnerLink>> {
        let sql = format!(
            "SELECT * FROM {} WHERE asset_id = $1 ORDER BY id LIMIT 1",
            self.tables.link_table
        );
        let row: Option<OwnerLinkRow> = sqlx::query_as(&sql)
            .bind(asset_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(OwnerLink::from))
    }

    async fn find_ready_by_checksum(&self, sha1: &str) -> MediaResult<Option<Asset>> {
        let sql = format!(
            "SELECT * FROM {} WHERE checksum_sha1 = $1 AND status = 'ready' ORDER BY id LIMIT 1",
            self.tables.asset_table
        );
        let row: Option<AssetRow> = sqlx::query_as(&sql)
            .bind(sha1)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Asset::try_from).transpose()
    }

    async fn find_failed_older_than(&self, cutoff: DateTime<Utc>) -> MediaResult<Vec<Asset>> {
        let sql = format!(
            "SELECT * FROM {} WHERE status = 'failed' AND updated_at < $1 ORDER BY id",
            self.tables.asset_table
        );
        let rows: Vec<AssetRow> = sqlx::query_as(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Asset::try_from).collect()
    }
}
