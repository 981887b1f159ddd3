//! The pattern manager
//!
//! Reconciles the declarative set of served patterns against the
//! policy files generated on disk. Change detection is
//! content-addressed: each entry stores the SHA3-256 hash of the
//! pattern's canonical JSON, and a pass regenerates files only when
//! the hash moves.
//!
//! Failure policy: file deletion errors are logged and do not abort a
//! pass (the on-disk set is repaired on the next one); creation
//! errors abort the pass with the offending entry left in its
//! pre-update state.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use edgepact_crypto::content_digest;
use edgepact_types::{pattern_short_id, unix_now, Pattern, Policy, PolicyHeader, PolicyWorkload, ServedPattern};

use crate::{AgbotError, AgbotResult};

/// One served pattern's cached metadata and generated artifacts.
#[derive(Debug, Clone)]
pub struct PatternEntry {
    pub pattern: Pattern,
    /// SHA3-256 of the pattern's canonical JSON
    pub hash: [u8; 32],
    /// Unix seconds of the last update
    pub updated_at: u64,
    /// Policy files generated for this entry, in creation order
    pub policy_filenames: Vec<PathBuf>,
}

impl PatternEntry {
    fn new(pattern: Pattern) -> AgbotResult<Self> {
        let hash = content_digest(&pattern)?;
        Ok(Self {
            pattern,
            hash,
            updated_at: unix_now(),
            policy_filenames: Vec::new(),
        })
    }

    fn replace(&mut self, pattern: Pattern, hash: [u8; 32]) {
        self.pattern = pattern;
        self.hash = hash;
        self.updated_at = unix_now();
        self.policy_filenames.clear();
    }
}

/// `(org, patternId) -> PatternEntry?`; `None` marks patterns that
/// appeared in the served set but whose exchange metadata has not
/// been fetched yet.
type OrgPatterns = HashMap<String, HashMap<String, Option<PatternEntry>>>;

#[derive(Default)]
pub struct PatternManager {
    org_patterns: OrgPatterns,
}

impl PatternManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn has_org(&self, org: &str) -> bool {
        self.org_patterns.contains_key(org)
    }

    fn has_pattern(&self, org: &str, pattern: &str) -> bool {
        self.org_patterns
            .get(org)
            .map(|patterns| patterns.contains_key(pattern))
            .unwrap_or(false)
    }

    /// The entry for `(org, pattern)`, when materialized.
    pub fn entry(&self, org: &str, pattern: &str) -> Option<&PatternEntry> {
        self.org_patterns
            .get(org)?
            .get(pattern)?
            .as_ref()
    }

    /// Every policy file currently owned by live entries.
    pub fn all_policy_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self
            .org_patterns
            .values()
            .flat_map(|patterns| patterns.values())
            .flatten()
            .flat_map(|entry| entry.policy_filenames.iter().cloned())
            .collect();
        files.sort();
        files
    }

    /// Rebuild the served map from the declarative list. Entries for
    /// surviving `(org, pattern)` pairs transfer unchanged; newcomers
    /// start as `None`; dropped pairs and orgs lose their policy
    /// files.
    pub fn set_served_patterns(&mut self, served: &[ServedPattern]) -> AgbotResult<()> {
        if self.org_patterns.is_empty() && served.is_empty() {
            return Ok(());
        }

        let mut new_map: OrgPatterns = HashMap::new();
        for sp in served {
            let entry = if self.has_pattern(&sp.org, &sp.pattern) {
                self.org_patterns
                    .get_mut(&sp.org)
                    .and_then(|patterns| patterns.remove(&sp.pattern))
                    .flatten()
            } else {
                None
            };
            new_map
                .entry(sp.org.clone())
                .or_default()
                .insert(sp.pattern.clone(), entry);
        }

        // Anything left in the old state is no longer served.
        let old = std::mem::take(&mut self.org_patterns);
        for (org, patterns) in old {
            let org_survives = new_map.contains_key(&org);
            for (pattern, entry) in patterns {
                let survives =
                    org_survives && new_map.get(&org).is_some_and(|p| p.contains_key(&pattern));
                if survives {
                    continue;
                }
                tracing::info!(org = %org, pattern = %pattern, "no longer served, deleting policy files");
                if let Some(entry) = entry {
                    delete_policy_files(&entry);
                }
            }
        }

        self.org_patterns = new_map;
        Ok(())
    }

    /// Reconcile one org's defined patterns against the served set,
    /// generating or regenerating policy files as needed.
    pub fn update_pattern_policies(
        &mut self,
        org: &str,
        defined: &HashMap<String, Pattern>,
        policy_path: &Path,
    ) -> AgbotResult<()> {
        if !self.has_org(org) {
            return Err(AgbotError::Validation(format!(
                "org {} not found in pattern manager",
                org
            )));
        }

        // The org exists on the exchange but holds no patterns any
        // more: drop it entirely.
        if defined.is_empty() {
            tracing::info!(org, "org holds no patterns, deleting it and its policy files");
            if let Some(patterns) = self.org_patterns.remove(org) {
                for entry in patterns.into_values().flatten() {
                    delete_policy_files(&entry);
                }
            }
            return Ok(());
        }

        // Served patterns that disappeared from the exchange lose
        // their files.
        let defined_ids: Vec<&str> = defined.keys().map(|id| pattern_short_id(id)).collect();
        let stale: Vec<String> = self.org_patterns[org]
            .keys()
            .filter(|pattern| !defined_ids.contains(&pattern.as_str()))
            .cloned()
            .collect();
        for pattern in stale {
            tracing::info!(org, pattern = %pattern, "pattern no longer defined, deleting policy files");
            if let Some(Some(entry)) = self.org_patterns.get_mut(org).and_then(|p| p.remove(&pattern)) {
                delete_policy_files(&entry);
            }
        }

        for (pattern_id, pattern) in defined {
            let short_id = pattern_short_id(pattern_id).to_string();
            // Patterns this bot is not configured to serve are
            // ignored.
            if !self.has_pattern(org, &short_id) {
                continue;
            }

            let Some(slot) = self
                .org_patterns
                .get_mut(org)
                .and_then(|patterns| patterns.get_mut(&short_id))
            else {
                continue;
            };

            match slot {
                None => {
                    let mut entry = PatternEntry::new(pattern.clone())?;
                    tracing::debug!(org, pattern = %short_id, "materializing new pattern entry");
                    create_policy_files(&mut entry, pattern_id, policy_path, org)?;
                    *slot = Some(entry);
                }
                Some(entry) => {
                    let new_hash = content_digest(pattern)?;
                    if entry.hash == new_hash {
                        continue;
                    }
                    tracing::debug!(org, pattern = %short_id, "pattern changed, regenerating policy files");
                    delete_policy_files(entry);
                    let mut replacement = entry.clone();
                    replacement.replace(pattern.clone(), new_hash);
                    create_policy_files(&mut replacement, pattern_id, policy_path, org)?;
                    *entry = replacement;
                }
            }
        }

        Ok(())
    }
}

/// Convert a pattern into one policy per workload.
pub fn pattern_to_policies(pattern_id: &str, pattern: &Pattern) -> Vec<Policy> {
    pattern
        .workloads
        .iter()
        .map(|workload| {
            let workload_key = workload
                .workload_url
                .rsplit('/')
                .next()
                .unwrap_or(&workload.workload_url);
            Policy {
                header: PolicyHeader {
                    name: format!(
                        "{}_{}_{}",
                        pattern_short_id(pattern_id),
                        workload_key,
                        workload.version
                    ),
                    version: workload.version.clone(),
                },
                pattern_id: Some(pattern_id.to_string()),
                agreement_protocols: pattern.agreement_protocols.clone(),
                workloads: vec![PolicyWorkload {
                    workload_url: workload.workload_url.clone(),
                    org: workload.org.clone(),
                    version: workload.version.clone(),
                    arch: workload.arch.clone(),
                    deployment: workload.deployment.clone(),
                }],
                data_verification: pattern.data_verification.clone(),
                metering: pattern.metering.clone(),
            }
        })
        .collect()
}

/// Deterministic policy file location for `(org, pattern, policy)`.
pub fn policy_file_name(policy_path: &Path, org: &str, policy_name: &str) -> PathBuf {
    let sanitized: String = policy_name
        .chars()
        .map(|c| if c == '/' || c == ':' { '-' } else { c })
        .collect();
    policy_path.join(org).join(format!("{}.policy.json", sanitized))
}

fn create_policy_files(
    entry: &mut PatternEntry,
    pattern_id: &str,
    policy_path: &Path,
    org: &str,
) -> AgbotResult<()> {
    let policies = pattern_to_policies(pattern_id, &entry.pattern);
    let org_dir = policy_path.join(org);
    fs::create_dir_all(&org_dir)
        .map_err(|e| AgbotError::Fatal(format!("cannot create policy dir {:?}: {}", org_dir, e)))?;

    for policy in policies {
        let file = policy_file_name(policy_path, org, &policy.header.name);
        let contents = serde_json::to_vec_pretty(&policy)
            .map_err(|e| AgbotError::Validation(format!("unserializable policy: {}", e)))?;
        fs::write(&file, contents).map_err(|e| {
            AgbotError::Fatal(format!("cannot write policy file {:?}: {}", file, e))
        })?;
        tracing::debug!(file = %file.display(), "wrote policy file");
        entry.policy_filenames.push(file);
    }
    Ok(())
}

/// Best-effort deletion; errors are logged, the next pass repairs.
fn delete_policy_files(entry: &PatternEntry) {
    for file in &entry.policy_filenames {
        if let Err(e) = fs::remove_file(file) {
            tracing::error!(file = %file.display(), error = %e, "failed to delete policy file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgepact_types::{AgreementProtocol, PatternWorkload, ProtocolVersion};
    use std::collections::HashMap;

    fn pattern(label: &str, version: &str) -> Pattern {
        Pattern {
            label: label.to_string(),
            workloads: vec![PatternWorkload {
                workload_url: format!("https://workloads/{}", label),
                org: "acme".to_string(),
                version: version.to_string(),
                arch: "amd64".to_string(),
                deployment: None,
            }],
            agreement_protocols: vec![AgreementProtocol {
                name: "edgepact-ledger".to_string(),
                protocol_version: ProtocolVersion::V2,
            }],
            ..Pattern::default()
        }
    }

    fn on_disk(dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    files.extend(on_disk(&entry.path()));
                } else {
                    files.push(entry.path());
                }
            }
        }
        files.sort();
        files
    }

    #[test]
    fn new_pattern_generates_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = PatternManager::new();
        pm.set_served_patterns(&[ServedPattern::new("acme", "web")])
            .unwrap();

        let mut defined = HashMap::new();
        defined.insert("acme/web".to_string(), pattern("web", "1.0"));
        pm.update_pattern_policies("acme", &defined, dir.path()).unwrap();

        let entry = pm.entry("acme", "web").unwrap();
        assert_eq!(entry.policy_filenames.len(), 1);
        assert_eq!(on_disk(dir.path()), pm.all_policy_files());
        assert_eq!(entry.hash, content_digest(&pattern("web", "1.0")).unwrap());
    }

    #[test]
    fn unchanged_pattern_rewrites_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = PatternManager::new();
        pm.set_served_patterns(&[ServedPattern::new("acme", "web")])
            .unwrap();

        let mut defined = HashMap::new();
        defined.insert("acme/web".to_string(), pattern("web", "1.0"));
        pm.update_pattern_policies("acme", &defined, dir.path()).unwrap();

        let file = pm.entry("acme", "web").unwrap().policy_filenames[0].clone();
        let mtime = fs::metadata(&file).unwrap().modified().unwrap();
        let updated_at = pm.entry("acme", "web").unwrap().updated_at;

        pm.update_pattern_policies("acme", &defined, dir.path()).unwrap();
        assert_eq!(fs::metadata(&file).unwrap().modified().unwrap(), mtime);
        assert_eq!(pm.entry("acme", "web").unwrap().updated_at, updated_at);
    }

    #[test]
    fn changed_pattern_replaces_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = PatternManager::new();
        pm.set_served_patterns(&[ServedPattern::new("acme", "web")])
            .unwrap();

        let mut defined = HashMap::new();
        defined.insert("acme/web".to_string(), pattern("web", "1.0"));
        pm.update_pattern_policies("acme", &defined, dir.path()).unwrap();
        let old_hash = pm.entry("acme", "web").unwrap().hash;

        defined.insert("acme/web".to_string(), pattern("web", "2.0"));
        pm.update_pattern_policies("acme", &defined, dir.path()).unwrap();

        let entry = pm.entry("acme", "web").unwrap();
        assert_ne!(entry.hash, old_hash);
        assert_eq!(on_disk(dir.path()), pm.all_policy_files());

        // Third pass with identical metadata: nothing moves.
        let before = on_disk(dir.path());
        pm.update_pattern_policies("acme", &defined, dir.path()).unwrap();
        assert_eq!(on_disk(dir.path()), before);
    }

    #[test]
    fn dropped_pattern_loses_its_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = PatternManager::new();
        pm.set_served_patterns(&[
            ServedPattern::new("acme", "web"),
            ServedPattern::new("acme", "db"),
        ])
        .unwrap();

        let mut defined = HashMap::new();
        defined.insert("acme/web".to_string(), pattern("web", "1.0"));
        defined.insert("acme/db".to_string(), pattern("db", "1.0"));
        pm.update_pattern_policies("acme", &defined, dir.path()).unwrap();
        assert_eq!(on_disk(dir.path()).len(), 2);

        pm.set_served_patterns(&[ServedPattern::new("acme", "web")])
            .unwrap();
        assert_eq!(on_disk(dir.path()).len(), 1);
        assert_eq!(on_disk(dir.path()), pm.all_policy_files());
    }

    #[test]
    fn dropped_org_loses_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = PatternManager::new();
        pm.set_served_patterns(&[ServedPattern::new("acme", "web")])
            .unwrap();

        let mut defined = HashMap::new();
        defined.insert("acme/web".to_string(), pattern("web", "1.0"));
        pm.update_pattern_policies("acme", &defined, dir.path()).unwrap();

        pm.set_served_patterns(&[]).unwrap();
        assert!(on_disk(dir.path()).is_empty());
        assert!(pm.all_policy_files().is_empty());
    }

    #[test]
    fn org_with_no_defined_patterns_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = PatternManager::new();
        pm.set_served_patterns(&[ServedPattern::new("acme", "web")])
            .unwrap();

        let mut defined = HashMap::new();
        defined.insert("acme/web".to_string(), pattern("web", "1.0"));
        pm.update_pattern_policies("acme", &defined, dir.path()).unwrap();
        assert_eq!(on_disk(dir.path()).len(), 1);

        pm.update_pattern_policies("acme", &HashMap::new(), dir.path()).unwrap();
        assert!(on_disk(dir.path()).is_empty());
        assert!(pm.entry("acme", "web").is_none());
    }

    #[test]
    fn unknown_org_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = PatternManager::new();
        let result = pm.update_pattern_policies("ghost", &HashMap::new(), dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn unserved_defined_patterns_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = PatternManager::new();
        pm.set_served_patterns(&[ServedPattern::new("acme", "web")])
            .unwrap();

        let mut defined = HashMap::new();
        defined.insert("acme/web".to_string(), pattern("web", "1.0"));
        defined.insert("acme/other".to_string(), pattern("other", "1.0"));
        pm.update_pattern_policies("acme", &defined, dir.path()).unwrap();

        assert!(pm.entry("acme", "other").is_none());
        assert_eq!(on_disk(dir.path()).len(), 1);
    }

    #[test]
    fn policy_names_are_deterministic() {
        let a = policy_file_name(Path::new("/p"), "acme", "web_1.0");
        let b = policy_file_name(Path::new("/p"), "acme", "web_1.0");
        assert_eq!(a, b);

        let sanitized = policy_file_name(Path::new("/p"), "acme", "web/svc:1");
        assert!(!sanitized.file_name().unwrap().to_str().unwrap().contains('/'));
    }
}
