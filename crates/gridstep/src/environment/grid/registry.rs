use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::common::error::protocol_error;
use crate::Error;

/// Name of the registry file inside the job directory.
pub const REGISTRY_FILE_NAME: &str = "cluster_ids";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCategory {
    /// The submission representing the run-step.
    Main,
    /// A single submission standing for a whole dependency graph.
    Dag,
    Other,
}

impl fmt::Display for JobCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            JobCategory::Main => "main",
            JobCategory::Dag => "dag",
            JobCategory::Other => "other",
        };
        f.write_str(s)
    }
}

impl FromStr for JobCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(JobCategory::Main),
            "dag" => Ok(JobCategory::Dag),
            "other" => Ok(JobCategory::Other),
            _ => Err(format!("unknown job category: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub cluster_id: String,
    pub job_name: String,
    pub category: JobCategory,
    /// `%Y-%m-%d %H:%M:%S`, local time.
    pub submitted_at: String,
}

impl JobRecord {
    pub fn new(cluster_id: String, job_name: String, category: JobCategory) -> Self {
        JobRecord {
            cluster_id,
            job_name,
            category,
            submitted_at: chrono::Local::now().format(TIME_FORMAT).to_string(),
        }
    }
}

/// Append-only, human-readable log of submitted cluster jobs.
///
/// One line per record, whitespace-separated:
/// `cluster_id job_name category date time`. The file is a log, not a
/// table: appends never reorder or rewrite prior lines, so it stays safe
/// to `cat` and `grep` while jobs are in flight.
pub struct JobRegistry {
    path: PathBuf,
}

impl JobRegistry {
    pub fn new(job_dir: &Path) -> Self {
        JobRegistry {
            path: job_dir.join(REGISTRY_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and flushes it to disk before returning.
    pub fn append(&self, record: &JobRecord) -> crate::Result<()> {
        // Cluster ids repeat only if stale state survived the submission gates.
        if self
            .read_all()?
            .iter()
            .any(|r| r.cluster_id == record.cluster_id)
        {
            log::warn!(
                "cluster id {} is already tracked in {}",
                record.cluster_id,
                self.path.display()
            );
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(
            file,
            "{} {} {} {}",
            record.cluster_id, record.job_name, record.category, record.submitted_at
        )?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// Reads all records in append order. An absent file is an empty log.
    pub fn read_all(&self) -> crate::Result<Vec<JobRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(self.parse_line(line, lineno + 1)?);
        }
        Ok(records)
    }

    pub fn submitted_categories(&self) -> crate::Result<Vec<JobCategory>> {
        Ok(self.read_all()?.iter().map(|r| r.category).collect())
    }

    fn parse_line(&self, line: &str, lineno: usize) -> crate::Result<JobRecord> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 {
            return protocol_error(format!(
                "malformed registry line {lineno} in {}: {line:?}",
                self.path.display()
            ));
        }
        let category = JobCategory::from_str(fields[2]).map_err(|e| {
            Error::SchedulerProtocol(format!(
                "registry line {lineno} in {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(JobRecord {
            cluster_id: fields[0].to_string(),
            job_name: fields[1].to_string(),
            category,
            submitted_at: format!("{} {}", fields[3], fields[4]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, category: JobCategory) -> JobRecord {
        JobRecord {
            cluster_id: id.to_string(),
            job_name: format!("exp-{id}"),
            category,
            submitted_at: "2026-08-27 12:00:00".to_string(),
        }
    }

    #[test]
    fn append_then_read_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path());
        let records = vec![
            record("101", JobCategory::Other),
            record("102", JobCategory::Main),
            record("103", JobCategory::Other),
        ];
        for r in &records {
            registry.append(r).unwrap();
        }
        assert_eq!(registry.read_all().unwrap(), records);
    }

    #[test]
    fn absent_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path());
        assert!(registry.read_all().unwrap().is_empty());
        assert!(registry.submitted_categories().unwrap().is_empty());
    }

    #[test]
    fn file_format_is_whitespace_separated() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path());
        registry.append(&record("7", JobCategory::Dag)).unwrap();
        let content = std::fs::read_to_string(registry.path()).unwrap();
        assert_eq!(content, "7 exp-7 dag 2026-08-27 12:00:00\n");
    }

    #[test]
    fn malformed_line_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path());
        std::fs::write(registry.path(), "12345 exp-12345 main\n").unwrap();
        assert!(matches!(
            registry.read_all(),
            Err(crate::Error::SchedulerProtocol(_))
        ));
    }

    #[test]
    fn unknown_category_is_a_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(dir.path());
        std::fs::write(registry.path(), "1 n bogus 2026-08-27 12:00:00\n").unwrap();
        assert!(registry.read_all().is_err());
    }
}
