//! Rule-split manager (spec.md §4.5, component C5).
//!
//! For a wordlist+rules attack whose estimated runtime exceeds a chunk
//! budget, the core splits the **rule file** into disjoint index ranges
//! instead of the raw keyspace, since hashcat drives rule iteration
//! internally and would not parallelise a keyspace split well. Each chunk is
//! materialised on disk as its own rule file covering `[start, end)`.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};
use crate::planner::tail_absorbing_size;
use crate::types::JobId;

/// A materialised rule-chunk ready to be synced to an agent.
#[derive(Debug, Clone)]
pub struct RuleChunk {
    pub path: PathBuf,
    pub start_index: u64,
    pub end_index: u64,
    pub rule_count: u64,
}

/// Counts the newline-delimited rule lines in `rule_path`. Blank lines and
/// comment lines (starting with `#`) are not counted as rules, matching
/// hashcat's own rule-file parsing.
pub fn count_rules(rule_path: &Path) -> CoreResult<u64> {
    let file = std::fs::File::open(rule_path)?;
    let reader = BufReader::new(file);
    let mut count = 0u64;
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            count += 1;
        }
    }
    Ok(count)
}

/// Writes rule lines `[start, start+count)` of `rule_path` to a new file
/// under `temp_dir/<job_id>/`, returning its manifest entry. Rule chunks are
/// retained until the owning job terminates (spec.md §4.5); nothing in this
/// function deletes old chunks.
pub fn create_single_rule_chunk(
    temp_dir: &Path,
    job_id: JobId,
    rule_path: &Path,
    start: u64,
    count: u64,
) -> CoreResult<RuleChunk> {
    if count == 0 {
        return Err(CoreError::InvariantViolation(format!(
            "refusing to materialise an empty rule chunk for job {job_id}"
        )));
    }
    let rules = read_rule_range(rule_path, start, count)?;
    let job_dir = temp_dir.join(job_id.to_string());
    std::fs::create_dir_all(&job_dir)?;
    let end = start + count;
    let chunk_path = job_dir.join(format!("{start}-{end}.rule"));
    let mut out = std::fs::File::create(&chunk_path)?;
    for rule in &rules {
        writeln!(out, "{rule}")?;
    }
    Ok(RuleChunk {
        path: chunk_path,
        start_index: start,
        end_index: end,
        rule_count: rules.len() as u64,
    })
}

fn read_rule_range(rule_path: &Path, start: u64, count: u64) -> CoreResult<Vec<String>> {
    let file = std::fs::File::open(rule_path)?;
    let reader = BufReader::new(file);
    let mut rules = Vec::with_capacity(count as usize);
    let mut index = 0u64;
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if index >= start && index < start + count {
            rules.push(trimmed.to_string());
        }
        index += 1;
        if index >= start + count {
            break;
        }
    }
    Ok(rules)
}

/// Per-agent rule-chunk sizing for the next chunk of a rule-split job
/// (spec.md §4.5): `rules_per_second = speed / base_keyspace`,
/// `rules_per_chunk = floor(rules_per_second * chunk_duration)`, minimum 1,
/// with the tail-absorb rule applied against the total rule count.
pub fn next_rule_range(
    total_rules: u64,
    next_start: u64,
    base_keyspace: u64,
    benchmark_speed: f64,
    chunk_duration_seconds: u32,
    fluctuation_percent: u32,
) -> Option<(u64, u64)> {
    if next_start >= total_rules {
        return None;
    }
    let remaining = total_rules - next_start;
    let rules_per_second = if base_keyspace == 0 { 0.0 } else { benchmark_speed / base_keyspace as f64 };
    let ideal = ((rules_per_second * chunk_duration_seconds as f64) as u64).max(1);
    let size = tail_absorbing_size(remaining, ideal, fluctuation_percent);
    Some((next_start, next_start + size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn sample_rule_file(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn counts_rules_skipping_blanks_and_comments() {
        let file = sample_rule_file(&[":", "# comment", "", "l", "u"]);
        assert_eq!(count_rules(file.path()).unwrap(), 3);
    }

    #[test]
    fn materialises_a_contiguous_slice() {
        let file = sample_rule_file(&[":", "l", "u", "c", "r"]);
        let dir = tempfile::tempdir().unwrap();
        let chunk = create_single_rule_chunk(dir.path(), JobId::nil(), file.path(), 1, 2).unwrap();
        assert_eq!(chunk.start_index, 1);
        assert_eq!(chunk.end_index, 3);
        let contents = std::fs::read_to_string(&chunk.path).unwrap();
        assert_eq!(contents.lines().collect::<Vec<_>>(), vec!["l", "u"]);
    }

    #[test]
    fn next_rule_range_respects_monotonicity() {
        let (start, end) = next_rule_range(10_000_000, 0, 1_000_000, 100_000_000.0, 1200, 20).unwrap();
        assert_eq!(start, 0);
        assert_eq!(end, 120_000);
        let (start2, _) = next_rule_range(10_000_000, end, 1_000_000, 100_000_000.0, 1200, 20).unwrap();
        assert_eq!(start2, end);
    }

    #[test]
    fn tail_of_one_rule_is_absorbed() {
        let (start, end) = next_rule_range(9_999_901, 9_999_900, 1_000_000, 100_000_000.0, 1200, 20).unwrap();
        assert_eq!(start, 9_999_900);
        assert_eq!(end, 9_999_901);
    }

    #[test]
    fn all_rules_dispatched_returns_none() {
        assert!(next_rule_range(100, 100, 1_000_000, 100_000_000.0, 1200, 20).is_none());
    }
}
