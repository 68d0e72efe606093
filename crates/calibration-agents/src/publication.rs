//! Publication: refined records → draft → temp → published articles.
//!
//! Articles are keyed by `(slug, version)`. Re-publishing identical content
//! is a no-op; a different record claiming an occupied slug is a conflict.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use blake3::Hasher;
use chrono::{DateTime, Utc};
use enrichment::phase::advance;
use enrichment::{
    ArticleSkeleton, CalibrationRecord, EnrichmentPhase, ErrorCategory, IllegalTransition,
    RecordFilter, RecordStore, SchemaVersion, StoreError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RunOptions;
use crate::report::RunStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationStage {
    Draft,
    Temp,
    Published,
}

impl PublicationStage {
    pub const ORDER: [PublicationStage; 3] = [Self::Draft, Self::Temp, Self::Published];
}

impl std::fmt::Display for PublicationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Temp => write!(f, "temp"),
            Self::Published => write!(f, "published"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublicationError {
    #[error("record {0} has no refined article")]
    MissingArticle(Uuid),

    #[error("slug `{slug}` ({version}) already belongs to record {owner}")]
    SlugConflict {
        slug: String,
        version: SchemaVersion,
        owner: Uuid,
    },

    #[error("article sink I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("article serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("article sink lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

impl PublicationError {
    /// Failures of this record only; the batch continues.
    pub fn is_record_level(&self) -> bool {
        matches!(self, Self::MissingArticle(_) | Self::SlugConflict { .. })
    }
}

/// An article as held by the sink at some stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedArticle {
    pub record_id: Uuid,
    pub slug: String,
    pub version: SchemaVersion,
    pub stage: PublicationStage,
    pub content_hash: String,
    pub article: ArticleSkeleton,
    pub updated_at: DateTime<Utc>,
}

/// Hex blake3 digest of the article's JSON.
pub fn content_hash(article: &ArticleSkeleton) -> Result<String, PublicationError> {
    let bytes = serde_json::to_vec(article)?;
    let mut hasher = Hasher::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().to_hex().to_string())
}

/// Destination of published articles.
pub trait ArticleSink: Send + Sync {
    fn find(&self, slug: &str, version: SchemaVersion)
        -> Result<Option<PublishedArticle>, PublicationError>;

    /// Insert or replace the article at its `(slug, version)` key.
    fn put(&self, article: PublishedArticle) -> Result<(), PublicationError>;
}

type SinkKey = (String, SchemaVersion);

#[derive(Default)]
pub struct MemorySink {
    articles: Mutex<BTreeMap<SinkKey, PublishedArticle>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn articles(&self) -> Vec<PublishedArticle> {
        self.articles
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl ArticleSink for MemorySink {
    fn find(
        &self,
        slug: &str,
        version: SchemaVersion,
    ) -> Result<Option<PublishedArticle>, PublicationError> {
        let map = self.articles.lock().map_err(|_| PublicationError::Poisoned)?;
        Ok(map.get(&(slug.to_string(), version)).cloned())
    }

    fn put(&self, article: PublishedArticle) -> Result<(), PublicationError> {
        let mut map = self.articles.lock().map_err(|_| PublicationError::Poisoned)?;
        map.insert((article.slug.clone(), article.version), article);
        Ok(())
    }
}

/// Articles kept as a pretty JSON array in one file.
pub struct JsonFileSink {
    path: PathBuf,
    articles: Mutex<BTreeMap<SinkKey, PublishedArticle>>,
}

impl JsonFileSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PublicationError> {
        let path = path.as_ref().to_path_buf();
        let mut articles = BTreeMap::new();
        match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => {
                let list: Vec<PublishedArticle> = serde_json::from_str(&text)?;
                for article in list {
                    articles.insert((article.slug.clone(), article.version), article);
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(PublicationError::Io { path, source }),
        }
        Ok(Self {
            path,
            articles: Mutex::new(articles),
        })
    }

    fn persist(&self, map: &BTreeMap<SinkKey, PublishedArticle>) -> Result<(), PublicationError> {
        let list: Vec<&PublishedArticle> = map.values().collect();
        let json = serde_json::to_string_pretty(&list)?;
        let io_err = |source| PublicationError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl ArticleSink for JsonFileSink {
    fn find(
        &self,
        slug: &str,
        version: SchemaVersion,
    ) -> Result<Option<PublishedArticle>, PublicationError> {
        let map = self.articles.lock().map_err(|_| PublicationError::Poisoned)?;
        Ok(map.get(&(slug.to_string(), version)).cloned())
    }

    fn put(&self, article: PublishedArticle) -> Result<(), PublicationError> {
        let mut map = self.articles.lock().map_err(|_| PublicationError::Poisoned)?;
        map.insert((article.slug.clone(), article.version), article);
        self.persist(&map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The sink already held this exact content as published.
    Unchanged,
}

pub struct PublicationPipeline {
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn ArticleSink>,
}

impl PublicationPipeline {
    pub fn new(store: Arc<dyn RecordStore>, sink: Arc<dyn ArticleSink>) -> Self {
        Self { store, sink }
    }

    /// Push one record's refined article through every stage and mark the
    /// record `published`. Does not persist the record.
    pub fn publish_record(
        &self,
        record: &mut CalibrationRecord,
    ) -> Result<PublishOutcome, PublicationError> {
        let article = record
            .article_refined
            .clone()
            .ok_or(PublicationError::MissingArticle(record.id))?;
        let slug = article.wordpress_url.clone();
        let hash = content_hash(&article)?;

        let existing = self.sink.find(&slug, record.version)?;
        if let Some(existing) = &existing {
            if existing.record_id != record.id && existing.content_hash != hash {
                return Err(PublicationError::SlugConflict {
                    slug,
                    version: record.version,
                    owner: existing.record_id,
                });
            }
        }

        let outcome = match existing {
            Some(e) if e.stage == PublicationStage::Published && e.content_hash == hash => {
                debug!(record_id = %record.id, slug = %slug, "Already published with identical content");
                PublishOutcome::Unchanged
            }
            _ => {
                for stage in PublicationStage::ORDER {
                    self.sink.put(PublishedArticle {
                        record_id: record.id,
                        slug: slug.clone(),
                        version: record.version,
                        stage,
                        content_hash: hash.clone(),
                        article: article.clone(),
                        updated_at: Utc::now(),
                    })?;
                    debug!(record_id = %record.id, slug = %slug, stage = %stage, "Publication stage");
                }
                PublishOutcome::Published
            }
        };

        advance(record, EnrichmentPhase::Published, Some("published"))?;
        Ok(outcome)
    }

    /// Publish every matching `claude_3b_completed` record.
    pub fn run(&self, options: &RunOptions) -> Result<RunStats, PublicationError> {
        let mut stats = RunStats::new("publish", options.dry_run);
        let filter = RecordFilter::phase(EnrichmentPhase::Claude3bCompleted)
            .with_category(options.category.clone())
            .with_make(options.make.clone())
            .with_version(options.version)
            .with_limit(options.limit);
        let candidates = self.store.query(&filter)?;
        info!(count = candidates.len(), "Publication candidates");

        for mut record in candidates {
            stats.processed += 1;
            if options.dry_run {
                info!(record_id = %record.id, slug = ?record.article_refined.as_ref().map(|a| &a.wordpress_url), "Dry run: would publish");
                stats.skipped += 1;
                continue;
            }

            match self.publish_record(&mut record) {
                Ok(outcome) => {
                    match self
                        .store
                        .update_if_phase(&record, EnrichmentPhase::Claude3bCompleted)
                    {
                        Ok(_) => {
                            info!(record_id = %record.id, outcome = ?outcome, "Record published");
                            stats.succeeded += 1;
                        }
                        Err(e) if e.is_conflict() => {
                            warn!(record_id = %record.id, error = %e, "Record changed by another run, skipping");
                            stats.skipped += 1;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) if e.is_record_level() => {
                    let message = e.to_string();
                    warn!(record_id = %record.id, error = %message, "Publication failed");
                    stats.failed += 1;
                    stats.record_error(ErrorCategory::Other);
                    stats.note_failure(
                        record.id,
                        record.display_name(),
                        ErrorCategory::Other,
                        message.clone(),
                    );
                    record.record_error(message, ErrorCategory::Other);
                    match self
                        .store
                        .update_if_phase(&record, EnrichmentPhase::Claude3bCompleted)
                    {
                        Ok(_) => {}
                        Err(e) if e.is_conflict() => stats.skipped += 1,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(stats)
    }
}
