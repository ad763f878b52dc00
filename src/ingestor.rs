use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::asset_store::AssetStore;
use crate::bus::{MessageBus, ProcessJob};
use crate::downloader::Downloader;
use crate::engine::{ImageEngine, DEFAULT_ALT_QUALITY, DEFAULT_JPEG_QUALITY};
use crate::error::{MediaError, MediaResult};
use crate::model::{Asset, AssetStatus, OwnerLink, ProcessOutcome, Rendition, SourceKind};
use crate::object_store::{ObjectStore, StoredObject, DEFAULT_UPLOAD_CONCURRENCY};
use crate::profiles::{Codec, Profile, ProfileRegistry};
use crate::spool::TempSpool;
use crate::{
    asset_base_key, owner_base_key, sha1_hex, validate_image_bytes, validate_source_url_allowing,
};

/// The external entity acquiring an asset.
#[derive(Debug, Clone)]
pub struct OwnerRef {
    pub owner_type: String,
    pub owner_id: i64,
    pub role: String,
    pub sort: i32,
}

impl OwnerRef {
    pub fn new(owner_type: impl Into<String>, owner_id: i64, role: impl Into<String>) -> Self {
        OwnerRef {
            owner_type: owner_type.into(),
            owner_id,
            role: role.into(),
            sort: 0,
        }
    }

    pub fn with_sort(mut self, sort: i32) -> Self {
        self.sort = sort;
        self
    }

    fn link_for(&self, asset_id: i64) -> OwnerLink {
        OwnerLink {
            id: 0,
            owner_type: self.owner_type.clone(),
            owner_id: self.owner_id,
            asset_id,
            role: self.role.clone(),
            sort: self.sort,
            created_at: Utc::now(),
        }
    }
}

/// Orchestration core: validation, persistence, rendering, the fan-out
/// upload, dedup, deletion, and the worker-facing claim cycle. Every
/// operation takes the `AssetStore` handle so the caller picks the backend.
pub struct Ingestor {
    profiles: ProfileRegistry,
    engine: ImageEngine,
    downloader: Downloader,
    objects: Arc<dyn ObjectStore>,
    bus: Option<Arc<dyn MessageBus>>,
    spool: Option<TempSpool>,
    allow_private_sources: bool,
}

impl Ingestor {
    pub fn new(
        profiles: ProfileRegistry,
        engine: ImageEngine,
        downloader: Downloader,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Ingestor {
            profiles,
            engine,
            downloader,
            objects,
            bus: None,
            spool: None,
            allow_private_sources: false,
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_spool(mut self, spool: TempSpool) -> Self {
        self.spool = Some(spool);
        self
    }

    /// Skip the private-address screening for remote sources. Only for
    /// deployments whose image sources live on internal hosts.
    pub fn allow_private_sources(mut self, allow: bool) -> Self {
        self.allow_private_sources = allow;
        self
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    fn bus(&self) -> MediaResult<&Arc<dyn MessageBus>> {
        self.bus.as_ref().ok_or_else(|| MediaError::BusUnavailable {
            reason: "no message bus configured".to_string(),
        })
    }

    /// Synchronous ingestion of an uploaded payload: validate, persist,
    /// render, upload, link, mark READY.
    pub async fn upload_local(
        &self,
        store: &dyn AssetStore,
        bytes: &[u8],
        profile_name: &str,
        owner: &OwnerRef,
    ) -> MediaResult<Asset> {
        let profile = self.profiles.get(profile_name)?.clone();
        validate_image_bytes(bytes)?;
        self.ingest_bytes(store, bytes, &profile, SourceKind::Upload, None, owner)
            .await
    }

    /// Synchronous ingestion of a remote image: SSRF-validate, download,
    /// then proceed as for an upload.
    pub async fn upload_remote(
        &self,
        store: &dyn AssetStore,
        url: &str,
        profile_name: &str,
        owner: &OwnerRef,
    ) -> MediaResult<Asset> {
        let profile = self.profiles.get(profile_name)?.clone();
        let parsed = validate_source_url_allowing(url, self.allow_private_sources).await?;
        let download = self.downloader.download(&parsed).await?;
        validate_image_bytes(&download.bytes)?;
        self.ingest_bytes(
            store,
            &download.bytes,
            &profile,
            SourceKind::Remote,
            Some(url.to_string()),
            owner,
        )
        .await
    }

    /// Persist a QUEUED remote asset and hand it to the worker queue. The
    /// row is committed before the publish; a failed publish leaves it
    /// QUEUED for the requeue path.
    pub async fn enqueue_remote(
        &self,
        store: &dyn AssetStore,
        url: &str,
        profile_name: &str,
        owner: &OwnerRef,
    ) -> MediaResult<Asset> {
        let bus = self.bus()?;
        self.profiles.get(profile_name)?;
        validate_source_url_allowing(url, self.allow_private_sources).await?;

        let asset = store
            .insert_asset(&Asset::new(
                profile_name,
                SourceKind::Remote,
                Some(url.to_string()),
                AssetStatus::Queued,
            ))
            .await?;
        store.insert_owner_link(&owner.link_for(asset.id)).await?;

        bus.publish_process(&ProcessJob::new(asset.id)).await?;
        info!("enqueued remote asset {} from {url}", asset.id);
        Ok(asset)
    }

    /// Spool an uploaded payload and hand it to the worker queue. Requires a
    /// configured TempSpool. The spool file is removed again if anything
    /// after the spool write fails.
    pub async fn enqueue_local(
        &self,
        store: &dyn AssetStore,
        bytes: &[u8],
        file_name: &str,
        profile_name: &str,
        owner: &OwnerRef,
    ) -> MediaResult<Asset> {
        let bus = self.bus()?;
        let spool = self.spool.as_ref().ok_or_else(|| MediaError::SpoolFailed {
            reason: "no temp spool configured, async local uploads are disabled".to_string(),
        })?;
        self.profiles.get(profile_name)?;
        validate_image_bytes(bytes)?;

        let path = spool.save_upload(bytes, file_name).await?;
        let result = async {
            let asset = store
                .insert_asset(&Asset::new(
                    profile_name,
                    SourceKind::Upload,
                    None,
                    AssetStatus::Queued,
                ))
                .await?;
            store.insert_owner_link(&owner.link_for(asset.id)).await?;
            bus.publish_process(&ProcessJob::with_temp_file(
                asset.id,
                path.to_string_lossy().to_string(),
            ))
            .await?;
            Ok(asset)
        }
        .await;

        match result {
            Ok(asset) => {
                info!("enqueued local asset {} via {}", asset.id, path.display());
                Ok(asset)
            }
            Err(e) => {
                spool.delete(&path).await;
                Err(e)
            }
        }
    }

    /// One worker processing cycle. Infrastructure failures while loading or
    /// claiming propagate as errors (the delivery gets requeued); failures
    /// inside the render/upload pipeline are folded into the outcome after
    /// `mark_failed`.
    pub async fn process_asset(
        &self,
        store: &dyn AssetStore,
        asset_id: i64,
        retry_max: u32,
        temp_file_path: Option<&str>,
    ) -> MediaResult<ProcessOutcome> {
        let Some(asset) = store.find_asset(asset_id).await? else {
            // Deleted since enqueueing; ack and drop.
            debug!("asset {asset_id} no longer exists, dropping job");
            return Ok(ProcessOutcome::ok(0));
        };

        if asset.status == AssetStatus::Ready {
            return Ok(ProcessOutcome::ok(asset.attempts));
        }
        if asset.attempts >= retry_max {
            return Ok(ProcessOutcome {
                success: false,
                exceeded_retries: true,
                error: asset.last_error.clone(),
                attempts: asset.attempts,
            });
        }

        if store.claim(asset_id).await? == 0 {
            // Another worker holds or already finished this asset.
            debug!("asset {asset_id} already claimed elsewhere");
            return Ok(ProcessOutcome::ok(asset.attempts));
        }

        let mut asset = store
            .find_asset(asset_id)
            .await?
            .ok_or_else(|| MediaError::PersistenceFailed {
                reason: format!("asset {asset_id} vanished after claim"),
            })?;

        match self.process_claimed(store, &mut asset, temp_file_path).await {
            Ok(()) => {
                asset.status = AssetStatus::Ready;
                store.update_asset(&asset).await?;
                info!("asset {} processed, status ready", asset.id);
                Ok(ProcessOutcome::ok(asset.attempts))
            }
            Err(e) => {
                let message = e.to_string();
                asset.mark_failed(&message);
                store.update_asset(&asset).await?;
                warn!(
                    "asset {} failed (attempt {}): {message}",
                    asset.id, asset.attempts
                );
                Ok(ProcessOutcome::failed(message, asset.attempts, retry_max))
            }
        }
    }

    async fn process_claimed(
        &self,
        store: &dyn AssetStore,
        asset: &mut Asset,
        temp_file_path: Option<&str>,
    ) -> MediaResult<()> {
        let profile = self.profiles.get(&asset.profile)?.clone();

        match asset.source {
            SourceKind::Remote => {
                let url = asset.source_url.clone().ok_or_else(|| {
                    MediaError::validation("remote asset carries no source URL")
                })?;
                let parsed = validate_source_url_allowing(&url, self.allow_private_sources).await?;
                let download = self.downloader.download(&parsed).await?;
                validate_image_bytes(&download.bytes)?;
                // Multiple owners may exist by now, so the owner path is not
                // reconstructed for async processing.
                let base_key = asset_base_key(&profile.key_prefix, asset.id);
                self.render_and_store(store, asset, &download.bytes, &profile, &base_key)
                    .await?;
            }
            SourceKind::Upload => {
                let path = temp_file_path.ok_or_else(|| {
                    MediaError::validation("upload job carries no temp file path")
                })?;
                let bytes = tokio::fs::read(path).await.map_err(|e| MediaError::SpoolFailed {
                    reason: format!("cannot read spooled upload {path}: {e}"),
                })?;
                validate_image_bytes(&bytes)?;
                let base_key = match store.first_owner_link(asset.id).await? {
                    Some(link) => owner_base_key(
                        &profile.key_prefix,
                        &link.owner_type,
                        link.owner_id,
                        asset.id,
                    ),
                    None => asset_base_key(&profile.key_prefix, asset.id),
                };
                self.render_and_store(store, asset, &bytes, &profile, &base_key)
                    .await?;
                // The spool file goes last, once everything else held.
                if let Some(spool) = &self.spool {
                    spool.delete(Path::new(path)).await;
                } else if let Err(e) = tokio::fs::remove_file(path).await {
                    warn!("failed to delete spool file {path}: {e}");
                }
            }
        }
        Ok(())
    }

    /// Remove an asset, its renditions, its owner links, and every object
    /// under its keys. Per-object failures are logged and skipped; a missing
    /// asset is a no-op.
    pub async fn delete_asset(&self, store: &dyn AssetStore, asset_id: i64) -> MediaResult<()> {
        let Some(asset) = store.find_asset(asset_id).await? else {
            return Ok(());
        };

        let mut keys = asset.original_keys();
        for rendition in store.list_renditions(asset_id).await? {
            keys.push(rendition.key);
        }
        for key in &keys {
            if let Err(e) = self.objects.delete(key).await {
                warn!("delete asset {asset_id}: could not remove object {key}: {e}");
            }
        }

        store.delete_asset(asset_id).await?;
        info!("deleted asset {asset_id} and {} objects", keys.len());
        Ok(())
    }

    /// A READY asset with this content checksum, if one exists.
    pub async fn find_duplicate(
        &self,
        store: &dyn AssetStore,
        sha1: &str,
    ) -> MediaResult<Option<Asset>> {
        store.find_ready_by_checksum(sha1).await
    }

    /// Dedup wrapper: byte-identical content is linked, not re-rendered.
    pub async fn upload_local_with_dedup(
        &self,
        store: &dyn AssetStore,
        bytes: &[u8],
        profile_name: &str,
        owner: &OwnerRef,
    ) -> MediaResult<Asset> {
        self.profiles.get(profile_name)?;
        validate_image_bytes(bytes)?;
        if let Some(existing) = self.link_duplicate(store, bytes, owner).await? {
            return Ok(existing);
        }
        self.upload_local(store, bytes, profile_name, owner).await
    }

    pub async fn upload_remote_with_dedup(
        &self,
        store: &dyn AssetStore,
        url: &str,
        profile_name: &str,
        owner: &OwnerRef,
    ) -> MediaResult<Asset> {
        let profile = self.profiles.get(profile_name)?.clone();
        let parsed = validate_source_url_allowing(url, self.allow_private_sources).await?;
        let download = self.downloader.download(&parsed).await?;
        validate_image_bytes(&download.bytes)?;
        if let Some(existing) = self.link_duplicate(store, &download.bytes, owner).await? {
            return Ok(existing);
        }
        self.ingest_bytes(
            store,
            &download.bytes,
            &profile,
            SourceKind::Remote,
            Some(url.to_string()),
            owner,
        )
        .await
    }

    pub async fn enqueue_local_with_dedup(
        &self,
        store: &dyn AssetStore,
        bytes: &[u8],
        file_name: &str,
        profile_name: &str,
        owner: &OwnerRef,
    ) -> MediaResult<Asset> {
        self.profiles.get(profile_name)?;
        validate_image_bytes(bytes)?;
        if let Some(existing) = self.link_duplicate(store, bytes, owner).await? {
            return Ok(existing);
        }
        self.enqueue_local(store, bytes, file_name, profile_name, owner)
            .await
    }

    /// Dedup for the queued remote path requires the bytes, so the source is
    /// fetched once for hashing; on a miss the job is enqueued as usual and
    /// the worker downloads again.
    pub async fn enqueue_remote_with_dedup(
        &self,
        store: &dyn AssetStore,
        url: &str,
        profile_name: &str,
        owner: &OwnerRef,
    ) -> MediaResult<Asset> {
        self.profiles.get(profile_name)?;
        let parsed = validate_source_url_allowing(url, self.allow_private_sources).await?;
        let download = self.downloader.download(&parsed).await?;
        validate_image_bytes(&download.bytes)?;
        if let Some(existing) = self.link_duplicate(store, &download.bytes, owner).await? {
            return Ok(existing);
        }
        self.enqueue_remote(store, url, profile_name, owner).await
    }

    /// Requeue FAILED remote assets whose last attempt is older than the
    /// cutoff and whose retry budget is not spent. Returns the number of jobs
    /// republished. This is the recovery path for assets stranded by a
    /// publish failure or a worker outage.
    pub async fn requeue_failed(
        &self,
        store: &dyn AssetStore,
        cutoff: DateTime<Utc>,
        retry_max: u32,
    ) -> MediaResult<usize> {
        let bus = self.bus()?;
        let mut requeued = 0;
        for asset in store.find_failed_older_than(cutoff).await? {
            if asset.attempts >= retry_max {
                continue;
            }
            // Upload-sourced assets need their spool file, which is gone by
            // the time they strand; only remote assets can be replayed.
            if asset.source != SourceKind::Remote {
                continue;
            }
            bus.publish_process(&ProcessJob::new(asset.id)).await?;
            requeued += 1;
        }
        if requeued > 0 {
            info!("requeued {requeued} failed assets");
        }
        Ok(requeued)
    }

    /// Public URLs for everything stored for an asset, keyed by file name
    /// (`original.jpg`, `{variant}.{ext}`).
    pub async fn rendition_urls(
        &self,
        store: &dyn AssetStore,
        asset_id: i64,
    ) -> MediaResult<BTreeMap<String, String>> {
        let Some(asset) = store.find_asset(asset_id).await? else {
            return Ok(BTreeMap::new());
        };
        let mut urls = BTreeMap::new();
        if let Some(key) = &asset.original_jpg_key {
            urls.insert("original.jpg".to_string(), self.objects.public_url(key));
        }
        if let Some(key) = &asset.original_webp_key {
            urls.insert("original.webp".to_string(), self.objects.public_url(key));
        }
        for rendition in store.list_renditions(asset_id).await? {
            urls.insert(
                format!("{}.{}", rendition.variant, rendition.codec.ext()),
                self.objects.public_url(&rendition.key),
            );
        }
        Ok(urls)
    }

    async fn link_duplicate(
        &self,
        store: &dyn AssetStore,
        bytes: &[u8],
        owner: &OwnerRef,
    ) -> MediaResult<Option<Asset>> {
        let checksum = sha1_hex(bytes);
        let Some(existing) = self.find_duplicate(store, &checksum).await? else {
            return Ok(None);
        };
        store
            .insert_owner_link(&owner.link_for(existing.id))
            .await?;
        info!(
            "dedup hit: linked {}:{} to existing asset {}",
            owner.owner_type, owner.owner_id, existing.id
        );
        Ok(Some(existing))
    }

    /// Shared synchronous tail: insert the row, render, upload, mark READY,
    /// link. The freshly inserted asset row is compensated away if any later
    /// step throws, so no partial state survives a failure.
    async fn ingest_bytes(
        &self,
        store: &dyn AssetStore,
        bytes: &[u8],
        profile: &Profile,
        source: SourceKind,
        source_url: Option<String>,
        owner: &OwnerRef,
    ) -> MediaResult<Asset> {
        let asset = store
            .insert_asset(&Asset::new(
                &profile.name,
                source,
                source_url,
                AssetStatus::Processing,
            ))
            .await?;

        let finished = async {
            let mut asset = asset.clone();
            let base_key = owner_base_key(
                &profile.key_prefix,
                &owner.owner_type,
                owner.owner_id,
                asset.id,
            );
            self.render_and_store(store, &mut asset, bytes, profile, &base_key)
                .await?;
            asset.status = AssetStatus::Ready;
            store.update_asset(&asset).await?;
            store.insert_owner_link(&owner.link_for(asset.id)).await?;
            Ok(asset)
        }
        .await;

        match finished {
            Ok(asset) => {
                info!("asset {} ingested for {}:{}", asset.id, owner.owner_type, owner.owner_id);
                Ok(asset)
            }
            Err(e) => {
                if let Err(cleanup) = store.delete_asset(asset.id).await {
                    warn!("failed to roll back asset {}: {cleanup}", asset.id);
                }
                Err(e)
            }
        }
    }

    /// The render-and-upload pipeline: build the full batch (originals plus
    /// every supported variant/codec pair), upload it atomically, then record
    /// the renditions that were not already present from an earlier partial
    /// run. The checksum is stamped on every successful render so dedup also
    /// works for profiles that discard originals.
    async fn render_and_store(
        &self,
        store: &dyn AssetStore,
        asset: &mut Asset,
        bytes: &[u8],
        profile: &Profile,
        base_key: &str,
    ) -> MediaResult<()> {
        let checksum = sha1_hex(bytes);
        let mut uploads: Vec<StoredObject> = Vec::new();

        let original = if profile.keep_original {
            let rendered = self.engine.render_original(
                bytes,
                profile.max_original_long_edge,
                DEFAULT_JPEG_QUALITY,
                DEFAULT_ALT_QUALITY,
            )?;
            uploads.push(StoredObject::new(
                format!("{base_key}/original.jpg"),
                rendered.body_jpeg.clone(),
                Codec::Jpeg.content_type(),
            ));
            for codec in [Codec::Webp, Codec::Avif, Codec::Png] {
                if !profile.codecs.contains(&codec) {
                    continue;
                }
                if let Some(body) = rendered.body_for(codec) {
                    uploads.push(StoredObject::new(
                        format!("{base_key}/original.{}", codec.ext()),
                        body.to_vec(),
                        codec.content_type(),
                    ));
                }
            }
            Some(rendered)
        } else {
            None
        };

        // Renditions surviving an earlier partial run are re-uploaded but not
        // re-inserted.
        let existing: HashSet<(String, Codec)> = store
            .list_renditions(asset.id)
            .await?
            .into_iter()
            .map(|r| (r.variant, r.codec))
            .collect();

        let mut pending: Vec<Rendition> = Vec::new();
        for (variant_name, def) in &profile.variants {
            for codec in &profile.codecs {
                if !self.engine.supports(*codec) {
                    debug!("codec {codec} unavailable, skipping {variant_name}");
                    continue;
                }
                let rendered = self.engine.render_variant(bytes, def, *codec, None, true)?;
                let key = format!("{base_key}/{variant_name}.{}", codec.ext());
                let body_len = rendered.body.len() as u64;
                uploads.push(StoredObject::new(
                    key.clone(),
                    rendered.body,
                    rendered.content_type,
                ));
                if !existing.contains(&(variant_name.clone(), *codec)) {
                    pending.push(Rendition {
                        id: 0,
                        asset_id: asset.id,
                        variant: variant_name.clone(),
                        codec: *codec,
                        key,
                        width: rendered.width,
                        height: rendered.height,
                        bytes: body_len,
                        created_at: Utc::now(),
                    });
                }
            }
        }

        self.objects
            .put_multiple(uploads, DEFAULT_UPLOAD_CONCURRENCY)
            .await?;

        if let Some(rendered) = original {
            let jpg_key = Some(format!("{base_key}/original.jpg"));
            let webp_key = (profile.codecs.contains(&Codec::Webp)
                && rendered.body_webp.is_some())
            .then(|| format!("{base_key}/original.webp"));
            asset.set_original(jpg_key, webp_key, rendered.width, rendered.height);
        }
        asset.checksum_sha1 = Some(checksum);

        for rendition in &pending {
            store.insert_rendition(rendition).await?;
        }
        store.update_asset(asset).await?;
        Ok(())
    }
}
