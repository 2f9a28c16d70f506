//! Schema and security screening for third-party manifests. Pure: no I/O.
//!
//! Checks run in a fixed order:
//!
//! 1. size and nesting-depth bounds, checked before parsing
//! 2. JSON syntax
//! 3. `type` discriminant and required fields of that schema
//! 4. shape checks (name pattern, semver, category): warnings only
//! 5. URL policy for every URL-bearing field: always errors
//! 6. content screening of every string: warnings, errors in strict mode
//!
//! Failing 1 to 3 yields no `data`.

use crate::config::ContentConfig;
use crate::manifest::models::{ManifestKind, ValidationReport};
use crate::utils::sanitize::{screen_text, truncate};
use crate::utils::validation::validate_url;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::{debug, warn};

pub const MAX_DEPTH: usize = 10;
const MAX_NAME_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 1000;

const KNOWN_CATEGORIES: &[&str] = &[
    "ai",
    "data",
    "design",
    "dev",
    "development",
    "devops",
    "documentation",
    "education",
    "integration",
    "other",
    "productivity",
    "security",
    "testing",
    "utilities",
];

fn name_pattern() -> &'static Regex {
    static NAME: OnceLock<Regex> = OnceLock::new();
    NAME.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap())
}

/// Deepest container nesting in JSON text, found without parsing it
pub fn json_depth(raw: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for b in raw.bytes() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                max = max.max(depth);
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    max
}

/// Deepest container nesting of an already-parsed value
pub fn value_depth(value: &Value) -> usize {
    let mut max = 0;
    let mut stack = vec![(value, 0usize)];
    while let Some((value, depth)) = stack.pop() {
        let children: Box<dyn Iterator<Item = &Value>> = match value {
            Value::Object(map) => Box::new(map.values()),
            Value::Array(items) => Box::new(items.iter()),
            _ => continue,
        };
        max = max.max(depth + 1);
        stack.extend(children.map(|child| (child, depth + 1)));
    }
    max
}

#[derive(Default)]
struct Findings {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Findings {
    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn rejected(self, kind: Option<ManifestKind>) -> ValidationReport {
        ValidationReport {
            is_valid: false,
            kind,
            data: None,
            errors: self.errors,
            warnings: self.warnings,
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

#[derive(Debug, Clone)]
pub struct ManifestValidator {
    max_size: u64,
    max_depth: usize,
    strict: bool,
}

impl Default for ManifestValidator {
    fn default() -> Self {
        Self::from_config(&ContentConfig::default())
    }
}

impl ManifestValidator {
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            max_depth: MAX_DEPTH,
            strict: false,
        }
    }

    pub fn from_config(config: &ContentConfig) -> Self {
        Self::new(config.max_file_size).strict(config.strict_validation)
    }

    /// In strict mode content-screening findings are errors
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Validate manifest JSON text. `expected` supplies the schema when the
    /// document carries no `type` field.
    pub fn validate(&self, raw: &str, expected: Option<ManifestKind>) -> ValidationReport {
        let mut findings = Findings::default();

        if raw.len() as u64 > self.max_size {
            findings.error(format!(
                "manifest is {} bytes, exceeding the {} byte limit",
                raw.len(),
                self.max_size
            ));
            return findings.rejected(expected);
        }

        let depth = json_depth(raw);
        if depth > self.max_depth {
            findings.error(format!(
                "manifest nesting depth {depth} exceeds the limit of {}",
                self.max_depth
            ));
            return findings.rejected(expected);
        }

        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.validate_value(value, expected),
            Err(e) => {
                findings.error(format!("invalid JSON: {e}"));
                findings.rejected(expected)
            }
        }
    }

    /// Validate already-parsed manifest data (e.g. converted from YAML)
    pub fn validate_value(&self, value: Value, expected: Option<ManifestKind>) -> ValidationReport {
        let mut findings = Findings::default();

        let depth = value_depth(&value);
        if depth > self.max_depth {
            findings.error(format!(
                "manifest nesting depth {depth} exceeds the limit of {}",
                self.max_depth
            ));
            return findings.rejected(expected);
        }

        let Some(obj) = value.as_object() else {
            findings.error("manifest root must be a JSON object");
            return findings.rejected(expected);
        };

        let Some(kind) = resolve_kind(obj, expected, &mut findings) else {
            return findings.rejected(None);
        };

        match kind {
            ManifestKind::Marketplace => check_marketplace_required(obj, &mut findings),
            ManifestKind::Plugin => check_plugin_required(obj, &mut findings),
        }
        if !findings.errors.is_empty() {
            return findings.rejected(Some(kind));
        }

        check_shape(obj, &mut findings);
        if kind == ManifestKind::Marketplace {
            check_plugin_entries(obj, &mut findings);
        }

        for (field, url) in url_fields(obj) {
            if let Err(e) = validate_url(url) {
                findings.error(format!("{field}: {e}"));
            }
        }

        self.screen_strings(&value, "", &mut findings);

        let is_valid = findings.errors.is_empty();
        if !is_valid {
            warn!(
                "Manifest rejected with {} errors: {}",
                findings.errors.len(),
                findings.errors.join("; ")
            );
        } else if !findings.warnings.is_empty() {
            debug!("Manifest accepted with {} warnings", findings.warnings.len());
        }

        ValidationReport {
            is_valid,
            kind: Some(kind),
            data: Some(value),
            errors: findings.errors,
            warnings: findings.warnings,
        }
    }

    fn screen_strings(&self, value: &Value, pointer: &str, findings: &mut Findings) {
        match value {
            Value::String(s) => {
                for finding in screen_text(s) {
                    let message = format!(
                        "{} {}: {:?}",
                        if pointer.is_empty() { "(root)" } else { pointer },
                        finding,
                        truncate(s, 60)
                    );
                    if self.strict {
                        findings.error(message);
                    } else {
                        findings.warn(message);
                    }
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.screen_strings(item, &format!("{pointer}[{i}]"), findings);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    self.screen_strings(item, &join(pointer, key), findings);
                }
            }
            _ => {}
        }
    }
}

fn resolve_kind(
    obj: &Map<String, Value>,
    expected: Option<ManifestKind>,
    findings: &mut Findings,
) -> Option<ManifestKind> {
    match obj.get("type") {
        Some(Value::String(declared)) => match ManifestKind::from_discriminant(declared) {
            Some(kind) => {
                if let Some(expected) = expected.filter(|e| *e != kind) {
                    findings.warn(format!(
                        "declared type '{kind}' differs from the expected '{expected}'"
                    ));
                }
                Some(kind)
            }
            None => {
                findings.error(format!(
                    "unknown manifest type '{}': expected 'marketplace' or 'plugin'",
                    truncate(declared, 40)
                ));
                None
            }
        },
        Some(_) => {
            findings.error("field 'type' must be a string");
            None
        }
        None => {
            if expected.is_none() {
                findings.error("missing required field 'type'");
            }
            expected
        }
    }
}

fn require_string(obj: &Map<String, Value>, field: &str, findings: &mut Findings) {
    match obj.get(field) {
        None | Some(Value::Null) => findings.error(format!("missing required field '{field}'")),
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        Some(_) => findings.error(format!("field '{field}' must be a non-empty string")),
    }
}

fn check_author(obj: &Map<String, Value>, required: bool, findings: &mut Findings) {
    match obj.get("author") {
        None | Some(Value::Null) if required => {
            findings.error("missing required field 'author'")
        }
        None | Some(Value::Null) => {}
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        Some(Value::Object(author))
            if author
                .get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| !n.trim().is_empty()) => {}
        Some(_) => findings.error("field 'author' must be a name or an object with a 'name'"),
    }
}

fn check_repository(obj: &Map<String, Value>, required: bool, findings: &mut Findings) {
    match obj.get("repository") {
        None | Some(Value::Null) if required => {
            findings.error("missing required field 'repository'")
        }
        None | Some(Value::Null) => {}
        Some(Value::String(_)) => {}
        Some(Value::Object(repo)) => match repo.get("url") {
            Some(Value::String(_)) => {}
            None => findings.error("missing required field 'repository.url'"),
            Some(_) => findings.error("field 'repository.url' must be a string"),
        },
        Some(_) => findings.error("field 'repository' must be a URL or an object"),
    }
}

fn check_marketplace_required(obj: &Map<String, Value>, findings: &mut Findings) {
    require_string(obj, "name", findings);
    require_string(obj, "version", findings);
    check_author(obj, true, findings);
    check_repository(obj, true, findings);
    match obj.get("plugins") {
        None | Some(Value::Array(_)) => {}
        Some(_) => findings.error("field 'plugins' must be an array"),
    }
}

fn check_plugin_required(obj: &Map<String, Value>, findings: &mut Findings) {
    require_string(obj, "name", findings);
    require_string(obj, "version", findings);
    check_author(obj, false, findings);
    check_repository(obj, false, findings);
}

fn check_shape(obj: &Map<String, Value>, findings: &mut Findings) {
    if let Some(name) = obj.get("name").and_then(Value::as_str) {
        if name.len() > MAX_NAME_LEN {
            findings.warn(format!("name is longer than {MAX_NAME_LEN} characters"));
        } else if !name_pattern().is_match(name) {
            findings.warn(format!(
                "name '{}' should contain only letters, digits, '.', '_' and '-'",
                truncate(name, 40)
            ));
        }
    }

    if let Some(version) = obj.get("version").and_then(Value::as_str) {
        if semver::Version::parse(version).is_err() {
            findings.warn(format!(
                "version '{}' is not a semantic version",
                truncate(version, 40)
            ));
        }
    }

    match obj.get("category") {
        None | Some(Value::Null) => {}
        Some(Value::String(category)) => {
            if !KNOWN_CATEGORIES.contains(&category.to_lowercase().as_str()) {
                findings.warn(format!("unknown category '{}'", truncate(category, 40)));
            }
        }
        Some(_) => findings.warn("field 'category' should be a string"),
    }

    match obj.get("description") {
        None | Some(Value::Null) => {}
        Some(Value::String(description)) => {
            if description.chars().count() > MAX_DESCRIPTION_LEN {
                findings.warn(format!(
                    "description is longer than {MAX_DESCRIPTION_LEN} characters"
                ));
            }
        }
        Some(_) => findings.warn("field 'description' should be a string"),
    }

    if let Some(keywords) = obj.get("keywords") {
        let all_strings = keywords
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !all_strings {
            findings.warn("field 'keywords' should be an array of strings");
        }
    }

    check_repository_consistency(obj, findings);
}

/// `repository.owner`/`repository.repo` should agree with a GitHub URL
fn check_repository_consistency(obj: &Map<String, Value>, findings: &mut Findings) {
    let Some(repo) = obj.get("repository").and_then(Value::as_object) else {
        return;
    };
    let (Some(url), Some(owner), Some(name)) = (
        repo.get("url").and_then(Value::as_str),
        repo.get("owner").and_then(Value::as_str),
        repo.get("repo").and_then(Value::as_str),
    ) else {
        return;
    };
    let Ok(parsed) = url::Url::parse(url) else {
        return;
    };
    if parsed.host_str() != Some("github.com") {
        return;
    }
    let mut segments = parsed.path_segments().into_iter().flatten();
    let url_owner = segments.next().unwrap_or_default();
    let url_name = segments
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");
    if !url_owner.eq_ignore_ascii_case(owner) || !url_name.eq_ignore_ascii_case(name) {
        findings.warn(format!(
            "repository.owner/repo '{owner}/{name}' does not match repository.url"
        ));
    }
}

fn check_plugin_entries(obj: &Map<String, Value>, findings: &mut Findings) {
    let Some(plugins) = obj.get("plugins").and_then(Value::as_array) else {
        return;
    };
    for (i, entry) in plugins.iter().enumerate() {
        let Some(entry) = entry.as_object() else {
            findings.warn(format!("plugins[{i}] should be an object"));
            continue;
        };
        if !entry
            .get("name")
            .and_then(Value::as_str)
            .is_some_and(|n| !n.trim().is_empty())
        {
            findings.warn(format!("plugins[{i}] has no name"));
        }
        if entry.get("source").is_none() {
            findings.warn(format!("plugins[{i}] has no source"));
        }
        if let Some(version) = entry.get("version").and_then(Value::as_str) {
            if semver::Version::parse(version).is_err() {
                findings.warn(format!(
                    "plugins[{i}].version '{}' is not a semantic version",
                    truncate(version, 40)
                ));
            }
        }
    }
}

fn push_url<'a>(fields: &mut Vec<(String, &'a str)>, label: String, value: Option<&'a Value>) {
    if let Some(url) = value.and_then(Value::as_str) {
        fields.push((label, url));
    }
}

/// Every field of the manifest that holds a URL
fn url_fields(obj: &Map<String, Value>) -> Vec<(String, &str)> {
    let mut fields = Vec::new();

    match obj.get("repository") {
        Some(Value::String(url)) => fields.push(("repository".to_string(), url.as_str())),
        Some(Value::Object(repo)) => push_url(&mut fields, "repository.url".into(), repo.get("url")),
        _ => {}
    }
    push_url(&mut fields, "homepage".into(), obj.get("homepage"));
    if let Some(author) = obj.get("author").and_then(Value::as_object) {
        push_url(&mut fields, "author.url".into(), author.get("url"));
    }

    if let Some(plugins) = obj.get("plugins").and_then(Value::as_array) {
        for (i, entry) in plugins.iter().enumerate() {
            let Some(entry) = entry.as_object() else {
                continue;
            };
            match entry.get("source") {
                // Relative paths and `owner/repo` shorthands are not URLs
                Some(Value::String(source)) if source.contains("://") => {
                    fields.push((format!("plugins[{i}].source"), source.as_str()));
                }
                Some(Value::Object(source)) => {
                    push_url(&mut fields, format!("plugins[{i}].source.url"), source.get("url"));
                }
                _ => {}
            }
            push_url(&mut fields, format!("plugins[{i}].homepage"), entry.get("homepage"));
            match entry.get("repository") {
                Some(Value::String(url)) => {
                    fields.push((format!("plugins[{i}].repository"), url.as_str()))
                }
                Some(Value::Object(repo)) => push_url(
                    &mut fields,
                    format!("plugins[{i}].repository.url"),
                    repo.get("url"),
                ),
                _ => {}
            }
        }
    }

    fields
}
