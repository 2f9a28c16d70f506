use crate::batch::{run_bounded, BatchOutcome};
use crate::cache::TtlCache;
use crate::cancel::Cancellation;
use crate::config::ContentConfig;
use crate::github::models::FileContent;
use crate::github::parser::is_valid_name;
use crate::github::{encode_path, ApiClient, RepositoryRef, RequestOptions};
use crate::manifest::models::{
    ManifestKind, ManifestOutcome, ParsedManifest, RawManifestContent, ValidationReport,
};
use crate::manifest::validator::ManifestValidator;
use crate::utils::validation::validate_path;
use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info, warn};

const UTF8_BOM: char = '\u{feff}';

/// Fetches manifest files through the API client, decodes and validates
/// them, and caches both found and missing outcomes.
#[derive(Clone)]
pub struct ManifestFetcher {
    client: ApiClient,
    config: ContentConfig,
    validator: ManifestValidator,
    cache: TtlCache<String, ManifestOutcome>,
}

impl ManifestFetcher {
    pub fn new(client: ApiClient, config: ContentConfig) -> Self {
        let validator = ManifestValidator::from_config(&config);
        let cache = TtlCache::new(Duration::from_secs(config.cache_ttl_secs));
        Self {
            client,
            config,
            validator,
            cache,
        }
    }

    pub fn validator(&self) -> &ManifestValidator {
        &self.validator
    }

    pub fn cache(&self) -> &TtlCache<String, ManifestOutcome> {
        &self.cache
    }

    fn cache_key(owner: &str, repo: &str, path: &str) -> String {
        format!(
            "{}/{}:{}",
            owner.to_lowercase(),
            repo.to_lowercase(),
            path
        )
    }

    /// Fetch, decode and validate one manifest. A missing file is
    /// `Ok(ManifestOutcome::Missing)`, not an error.
    pub async fn fetch_manifest(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        cancel: &Cancellation,
    ) -> Result<ManifestOutcome> {
        if !is_valid_name(owner) || !is_valid_name(repo) {
            return Err(Error::Validation(format!(
                "Invalid repository identity: {owner}/{repo}"
            )));
        }
        validate_path(path)?;

        let key = Self::cache_key(owner, repo, path);
        if let Some(cached) = self.cache.get(&key).await {
            debug!("Manifest cache hit: {}", key);
            return Ok(cached);
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let outcome = match self
            .fetch_uncached(owner, repo, path, &cancel.with_timeout(timeout))
            .await
        {
            Err(Error::Cancelled) if !cancel.is_cancelled() => {
                return Err(Error::Timeout(format!(
                    "manifest {owner}/{repo}/{path} not fetched within {timeout:?}"
                )));
            }
            other => other?,
        };

        self.cache.insert(key, outcome.clone()).await;
        Ok(outcome)
    }

    async fn fetch_uncached(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        cancel: &Cancellation,
    ) -> Result<ManifestOutcome> {
        let api_path = format!(
            "/repos/{}/{}/contents/{}",
            owner,
            repo,
            encode_path(path)
        );
        let opts = RequestOptions::new(cancel).max_retries(self.config.retry_attempts);

        let file: FileContent = match self.client.get_with(&api_path, &opts).await {
            Ok(file) => file,
            Err(Error::NotFound(_)) => {
                debug!("No manifest at {}/{}/{}", owner, repo, path);
                return Ok(ManifestOutcome::Missing {
                    path: path.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        if file.file_type != "file" {
            return Err(Error::Validation(format!(
                "{path} in {owner}/{repo} is a {}, not a file",
                file.file_type
            )));
        }

        let raw = self.decode(file)?;
        let manifest = self.parse(raw)?;

        if manifest.is_valid {
            debug!(
                "Fetched valid manifest {}/{}/{} ({} bytes)",
                owner, repo, path, manifest.size_bytes
            );
        } else {
            info!(
                "Manifest {}/{}/{} failed validation: {}",
                owner,
                repo,
                path,
                manifest.errors.join("; ")
            );
        }

        Ok(ManifestOutcome::Found(manifest))
    }

    /// Check the reported size and encoding, then decode the payload.
    /// Oversized content is rejected before any decoding happens.
    pub fn decode(&self, file: FileContent) -> Result<RawManifestContent> {
        let max = self.config.max_file_size;
        if file.size > max {
            warn!(
                "Manifest {} is {} bytes, over the {} byte limit",
                file.path, file.size, max
            );
            return Err(Error::ContentTooLarge {
                size: file.size,
                max,
            });
        }

        let encoding = file
            .encoding
            .as_deref()
            .unwrap_or("base64")
            .to_ascii_lowercase();
        if !self
            .config
            .allowed_encodings
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&encoding))
        {
            return Err(Error::Decode(format!(
                "Encoding '{encoding}' of {} is not allowed",
                file.path
            )));
        }

        let content = file.content.unwrap_or_default();
        let raw = match encoding.as_str() {
            "base64" => {
                let clean: String = content.chars().filter(|c| !c.is_whitespace()).collect();
                STANDARD
                    .decode(clean.as_bytes())
                    .map_err(|e| Error::Decode(format!("Invalid base64 in {}: {e}", file.path)))?
            }
            "utf-8" | "utf8" => content.into_bytes(),
            other => {
                return Err(Error::Decode(format!(
                    "Unsupported encoding '{other}' for {}",
                    file.path
                )))
            }
        };

        // The reported size is advisory; the decoded payload is authoritative
        let size_bytes = raw.len() as u64;
        if size_bytes > max {
            return Err(Error::ContentTooLarge {
                size: size_bytes,
                max,
            });
        }

        Ok(RawManifestContent {
            path: file.path,
            encoding,
            raw,
            size_bytes,
        })
    }

    /// Decode UTF-8, hash, and validate. JSON and YAML are both accepted,
    /// chosen by file extension.
    pub fn parse(&self, raw: RawManifestContent) -> Result<ParsedManifest> {
        let sha256 = format!("{:x}", Sha256::digest(&raw.raw));
        let text = String::from_utf8(raw.raw)
            .map_err(|e| Error::Decode(format!("{} is not valid UTF-8: {e}", raw.path)))?;
        let text = text.strip_prefix(UTF8_BOM).unwrap_or(&text);

        let expected = ManifestKind::from_path(&raw.path);
        let report = if is_yaml(&raw.path) {
            match serde_yaml::from_str::<serde_json::Value>(text) {
                Ok(value) => self.validator.validate_value(value, expected),
                Err(e) => ValidationReport {
                    is_valid: false,
                    kind: expected,
                    data: None,
                    errors: vec![format!("invalid YAML: {e}")],
                    warnings: Vec::new(),
                },
            }
        } else {
            self.validator.validate(text, expected)
        };

        Ok(ParsedManifest::from_report(
            raw.path,
            report,
            sha256,
            raw.size_bytes,
        ))
    }

    /// Try candidate paths in order and return the first manifest found
    pub async fn fetch_first(
        &self,
        repo: &RepositoryRef,
        paths: &[String],
        cancel: &Cancellation,
    ) -> Result<ManifestOutcome> {
        for path in paths {
            let outcome = self
                .fetch_manifest(&repo.owner, &repo.name, path, cancel)
                .await?;
            if outcome.exists() {
                return Ok(outcome);
            }
        }
        Ok(ManifestOutcome::Missing {
            path: paths.last().cloned().unwrap_or_default(),
        })
    }

    /// Fetch the same manifest path from many repositories with bounded
    /// concurrency. Results are keyed by repository.
    pub async fn fetch_multiple_manifests(
        &self,
        repos: Vec<RepositoryRef>,
        path: &str,
        cancel: &Cancellation,
    ) -> BatchOutcome<RepositoryRef, ManifestOutcome> {
        run_bounded(repos, self.config.concurrency, cancel, |repo| async move {
            self.fetch_manifest(&repo.owner, &repo.name, path, cancel)
                .await
        })
        .await
    }
}

fn is_yaml(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".yaml") || lower.ends_with(".yml")
}
