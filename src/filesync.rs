//! File-sync service (spec.md §4.8, component C8).
//!
//! Before a task is dispatched, resolves which wordlist/rule/binary/hashlist
//! files the target agent is missing and coordinates their transfer over the
//! agent's session channel. Files are content-identified by sha256, matching
//! the teacher's content-addressed artifact bookkeeping in
//! `layer8/gpu_manager.rs`.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::CoreResult;
use crate::rulesplit::RuleChunk;
use crate::types::{JobExecution, SyncFile, SyncFileKind};

/// Root of the data directory tree (spec.md §6):
/// `binaries/<id>/<filename>`, `wordlists/<path>`, `rules/<path>`,
/// `rule_chunks/<job_id>/<range>.rule`, `hashlists/<path>`.
#[derive(Debug, Clone)]
pub struct DataDir {
    pub root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn binaries(&self) -> PathBuf {
        self.root.join("binaries")
    }
    pub fn wordlists(&self) -> PathBuf {
        self.root.join("wordlists")
    }
    pub fn rules(&self) -> PathBuf {
        self.root.join("rules")
    }
    pub fn rule_chunks(&self) -> PathBuf {
        self.root.join("rule_chunks")
    }
    pub fn hashlists(&self) -> PathBuf {
        self.root.join("hashlists")
    }
}

/// sha256 of a file's contents, used to content-address sync manifest entries.
pub fn sha256_file(path: &Path) -> CoreResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Builds the manifest of files an agent needs for a task targeting `job`,
/// including the rule-chunk (not just the base rule file) for rule-split
/// tasks, per spec.md §4.8: "the per-task rule-chunk is synced in addition
/// to the original rule file".
pub fn required_files(data_dir: &DataDir, job: &JobExecution, rule_chunk: Option<&RuleChunk>) -> CoreResult<Vec<SyncFile>> {
    let mut files = Vec::new();

    let hashlist_path = data_dir.hashlists().join(job.hashlist_id.to_string());
    if hashlist_path.exists() {
        files.push(manifest_entry(SyncFileKind::Hashlist, &job.hashlist_id.to_string(), &hashlist_path)?);
    }

    for wordlist_id in &job.wordlist_ids {
        let path = data_dir.wordlists().join(wordlist_id.to_string());
        if path.exists() {
            files.push(manifest_entry(SyncFileKind::Wordlist, &wordlist_id.to_string(), &path)?);
        }
    }

    for rule_id in &job.rule_ids {
        let path = data_dir.rules().join(rule_id.to_string());
        if path.exists() {
            files.push(manifest_entry(SyncFileKind::Rules, &rule_id.to_string(), &path)?);
        }
    }

    let binary_path = data_dir.binaries().join(job.binary_version_id.to_string());
    if binary_path.exists() {
        files.push(manifest_entry(SyncFileKind::Binary, &job.binary_version_id.to_string(), &binary_path)?);
    }

    if let Some(chunk) = rule_chunk {
        files.push(manifest_entry(
            SyncFileKind::RuleChunk,
            &format!("{}-{}", chunk.start_index, chunk.end_index),
            &chunk.path,
        )?);
    }

    Ok(files)
}

fn manifest_entry(kind: SyncFileKind, logical_name: &str, path: &Path) -> CoreResult<SyncFile> {
    let sha256 = sha256_file(path)?;
    let size_bytes = std::fs::metadata(path)?.len();
    Ok(SyncFile {
        kind,
        logical_name: logical_name.to_string(),
        sha256,
        size_bytes,
        local_path: path.to_string_lossy().into_owned(),
    })
}

/// Diffs the server's manifest against what the agent reports already
/// having (by sha256), returning only the files that must be streamed.
pub fn diff_missing(required: &[SyncFile], agent_has: &[String]) -> Vec<SyncFile> {
    required.iter().filter(|f| !agent_has.contains(&f.sha256)).cloned().collect()
}

/// Walks the rule-chunk temp directory for a given job, used by the
/// housekeeping sweep to account for disk usage and by cleanup once a job
/// terminates (rule chunks are retained until then, per spec.md §4.5).
pub fn rule_chunk_files(data_dir: &DataDir, job_id: uuid::Uuid) -> Vec<PathBuf> {
    let job_dir = data_dir.rule_chunks().join(job_id.to_string());
    WalkDir::new(job_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

/// Resolves an agent's `file_request` (spec.md §4.2) to a local path by
/// content hash. Walks the whole data-dir tree; the core's file catalog is
/// small enough that this is acceptable outside the scheduler's hot path,
/// and a persistent content index is the admin/storage layer's job (out of
/// scope per spec.md §1).
pub fn find_by_sha256(data_dir: &DataDir, sha256: &str) -> CoreResult<Option<PathBuf>> {
    for root in [data_dir.binaries(), data_dir.wordlists(), data_dir.rules(), data_dir.rule_chunks(), data_dir.hashlists()] {
        for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            if sha256_file(entry.path())? == sha256 {
                return Ok(Some(entry.into_path()));
            }
        }
    }
    Ok(None)
}

/// hex encoding without pulling in a separate crate: sha2's output is fixed
/// size so a tiny local encoder keeps the dependency list aligned with what
/// the teacher already uses elsewhere.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(bytes.as_ref().len() * 2);
        for byte in bytes.as_ref() {
            write!(out, "{byte:02x}").unwrap();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn required_files_skips_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = DataDir::new(dir.path());
        std::fs::create_dir_all(data_dir.hashlists()).unwrap();
        let job = sample_job();
        let hashlist_path = data_dir.hashlists().join(job.hashlist_id.to_string());
        let mut file = std::fs::File::create(&hashlist_path).unwrap();
        writeln!(file, "hash1").unwrap();

        let files = required_files(&data_dir, &job, None).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].kind, SyncFileKind::Hashlist);
    }

    #[test]
    fn diff_missing_filters_by_sha() {
        let file = SyncFile {
            kind: SyncFileKind::Hashlist,
            logical_name: "h".into(),
            sha256: "abc".into(),
            size_bytes: 10,
            local_path: "x".into(),
        };
        assert!(diff_missing(&[file.clone()], &["abc".to_string()]).is_empty());
        assert_eq!(diff_missing(&[file], &[]).len(), 1);
    }

    fn sample_job() -> JobExecution {
        let now = chrono::Utc::now();
        JobExecution {
            id: uuid::Uuid::new_v4(),
            name: "job".into(),
            status: crate::types::JobStatus::Pending,
            priority: 0,
            max_agents: 0,
            allow_high_priority_override: false,
            hashlist_id: uuid::Uuid::new_v4(),
            attack_mode: 3,
            hash_type: 1000,
            binary_version_id: uuid::Uuid::new_v4(),
            wordlist_ids: vec![],
            rule_ids: vec![],
            base_keyspace: 10_000,
            multiplication_factor: 1,
            effective_keyspace: 10_000,
            total_keyspace: 10_000,
            dispatched_keyspace: 0,
            processed_keyspace: 0,
            is_accurate_keyspace: false,
            uses_rule_splitting: false,
            rule_split_count: 0,
            total_rules: None,
            chunk_size_seconds: 20,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
