//! One scan cycle: discovery, then manifest lookup and metadata assembly
//! per candidate, summarised in a [`ScanReport`].
//!
//! Scheduling and persistence belong to the caller.

use crate::batch::run_bounded;
use crate::cancel::Cancellation;
use crate::config::{ScanConfig, Settings};
use crate::error::FailureCategory;
use crate::github::{ApiClient, RepositoryRef};
use crate::manifest::{ManifestFetcher, ManifestOutcome, ParsedManifest};
use crate::metadata::{AssembleOptions, MetadataAssembler, RepositoryMetadata};
use crate::search::{QueryStats, SearchQuery, SearchService};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStage {
    Discovery,
    Manifest,
    Metadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanFailure {
    /// Repository, or the query string for discovery failures
    pub subject: String,
    pub stage: ScanStage,
    pub category: FailureCategory,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidManifest {
    pub repository: RepositoryRef,
    pub manifest: ParsedManifest,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub scan_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub candidates: usize,
    pub records: Vec<RepositoryMetadata>,
    /// Kept for diagnostics, never part of `records`' manifests
    pub invalid_manifests: Vec<InvalidManifest>,
    pub missing_manifests: usize,
    pub failure_counts: BTreeMap<FailureCategory, usize>,
    pub failures: Vec<ScanFailure>,
    pub discovery: Vec<QueryStats>,
    pub duplicates_merged: usize,
    pub cancelled: bool,
    /// Reason when a fatal error cut the scan short
    pub aborted: Option<String>,
}

impl ScanReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            scan_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            candidates: 0,
            records: Vec::new(),
            invalid_manifests: Vec::new(),
            missing_manifests: 0,
            failure_counts: BTreeMap::new(),
            failures: Vec::new(),
            discovery: Vec::new(),
            duplicates_merged: 0,
            cancelled: false,
            aborted: None,
        }
    }

    fn record_failure(&mut self, subject: String, stage: ScanStage, error: &Error) {
        self.record_category(subject, stage, error.category(), error.log_safe());
    }

    fn record_category(
        &mut self,
        subject: String,
        stage: ScanStage,
        category: FailureCategory,
        message: String,
    ) {
        *self.failure_counts.entry(category).or_insert(0) += 1;
        self.failures.push(ScanFailure {
            subject,
            stage,
            category,
            message,
        });
    }

    fn finish(&mut self) {
        self.finished_at = Utc::now();
        self.duration_ms = (self.finished_at - self.started_at).num_milliseconds();
        self.records.sort_by_key(|r| r.repository.key());
    }

    /// True when anything kept the scan from covering every candidate
    pub fn is_degraded(&self) -> bool {
        !self.failure_counts.is_empty() || self.cancelled || self.aborted.is_some()
    }

    pub fn log_summary(&self) {
        info!(
            "Scan {} completed in {}ms: {} candidates, {} records, {} invalid manifests, {} without manifest, {} failures",
            self.scan_id,
            self.duration_ms,
            self.candidates,
            self.records.len(),
            self.invalid_manifests.len(),
            self.missing_manifests,
            self.failures.len()
        );

        for (category, count) in &self.failure_counts {
            warn!("  {}: {}", category, count);
        }
        if self.cancelled {
            warn!("Scan {} was cancelled before completion", self.scan_id);
        }
        if let Some(reason) = &self.aborted {
            warn!("Scan {} aborted: {}", self.scan_id, reason);
        }
    }
}

/// Outcome of scanning one candidate
struct CandidateScan {
    metadata: RepositoryMetadata,
    manifest: Result<ManifestOutcome>,
}

#[derive(Clone)]
pub struct ScanRunner {
    search: SearchService,
    manifests: ManifestFetcher,
    metadata: MetadataAssembler,
    config: ScanConfig,
    options: AssembleOptions,
}

impl ScanRunner {
    /// Build every component around one client, so they share one rate
    /// limiter
    pub fn new(client: ApiClient, settings: &Settings) -> Self {
        Self {
            search: SearchService::new(client.clone(), settings.search.clone()),
            manifests: ManifestFetcher::new(client.clone(), settings.content.clone()),
            metadata: MetadataAssembler::new(client, settings.metadata.clone()),
            config: settings.scan.clone(),
            options: AssembleOptions::from(&settings.metadata),
        }
    }

    pub fn search_service(&self) -> &SearchService {
        &self.search
    }

    /// Discover candidates with `queries`, then scan them
    pub async fn run(&self, queries: &[SearchQuery], cancel: &Cancellation) -> ScanReport {
        let mut report = ScanReport::new();
        info!("Starting scan {} with {} queries", report.scan_id, queries.len());

        let sweep = match self.search.search_all(queries, cancel).await {
            Ok(sweep) => sweep,
            Err(e) => {
                report.record_failure("discovery".to_string(), ScanStage::Discovery, &e);
                report.aborted = Some(e.log_safe());
                report.finish();
                report.log_summary();
                return report;
            }
        };

        for stats in &sweep.queries {
            if let (Some(message), Some(category)) = (&stats.error, stats.error_category) {
                report.record_category(
                    stats.query.clone(),
                    ScanStage::Discovery,
                    category,
                    message.clone(),
                );
            }
        }
        report.duplicates_merged = sweep.duplicates_merged;
        report.cancelled = sweep.cancelled;
        let candidates = sweep.refs();
        report.discovery = sweep.queries;

        if report.cancelled {
            report.candidates = candidates.len();
            report.finish();
            report.log_summary();
            return report;
        }

        self.scan_into(candidates, cancel, &mut report).await;
        report
    }

    /// Scan a known list of repositories, skipping discovery
    pub async fn scan_repositories(
        &self,
        repos: Vec<RepositoryRef>,
        cancel: &Cancellation,
    ) -> ScanReport {
        let mut report = ScanReport::new();
        self.scan_into(repos, cancel, &mut report).await;
        report
    }

    async fn scan_into(
        &self,
        repos: Vec<RepositoryRef>,
        cancel: &Cancellation,
        report: &mut ScanReport,
    ) {
        report.candidates = repos.len();

        let outcome = run_bounded(repos, self.config.concurrency, cancel, |repo| async move {
            self.scan_candidate(&repo, cancel).await
        })
        .await;

        for item in outcome.items {
            let scan = match item.result {
                Ok(scan) => scan,
                Err(e) => {
                    report.record_failure(item.key.to_string(), ScanStage::Metadata, &e);
                    continue;
                }
            };

            let manifest = match scan.manifest {
                Ok(ManifestOutcome::Found(manifest)) if manifest.is_valid => Some(manifest),
                Ok(ManifestOutcome::Found(manifest)) => {
                    report.record_category(
                        item.key.to_string(),
                        ScanStage::Manifest,
                        FailureCategory::ValidationFailed,
                        manifest.errors.join("; "),
                    );
                    report.invalid_manifests.push(InvalidManifest {
                        repository: item.key.clone(),
                        manifest,
                    });
                    None
                }
                Ok(ManifestOutcome::Missing { .. }) => {
                    report.missing_manifests += 1;
                    None
                }
                Err(e) => {
                    report.record_failure(item.key.to_string(), ScanStage::Manifest, &e);
                    None
                }
            };

            if self.config.require_manifest && manifest.is_none() {
                continue;
            }
            report.records.push(scan.metadata.with_manifest(manifest));
        }

        if !outcome.pending.is_empty() {
            *report
                .failure_counts
                .entry(FailureCategory::Cancelled)
                .or_insert(0) += outcome.pending.len();
        }
        report.cancelled |= outcome.cancelled;
        if report.aborted.is_none() {
            report.aborted = outcome.aborted;
        }

        report.finish();
        report.log_summary();
    }

    /// Manifest lookup and metadata assembly run concurrently. Only a
    /// metadata failure, or a fatal manifest failure, fails the candidate.
    async fn scan_candidate(
        &self,
        repo: &RepositoryRef,
        cancel: &Cancellation,
    ) -> Result<CandidateScan> {
        let (manifest, metadata) = tokio::join!(
            self.manifests
                .fetch_first(repo, &self.config.manifest_paths, cancel),
            self.metadata.assemble(repo, &self.options, cancel),
        );

        let manifest = match manifest {
            Err(e) if e.is_batch_fatal() || matches!(e, Error::Cancelled) => return Err(e),
            other => other,
        };

        Ok(CandidateScan {
            metadata: metadata?,
            manifest,
        })
    }
}
