//! Status subcommand: read-only view of archived targets

use super::archive::{Cli, OutputFormat};
use super::CliError;
use crate::consistency::{inspect_lock, scan_counts, LockRecord};
use crate::output::STATE_FILE_NAME;
use crate::resume::ResumeState;
use crate::ContentKind;
use chrono::Utc;
use clap::Args;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Status command arguments
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Target directory name, e.g. group_42; all targets when omitted
    pub target_key: Option<String>,
}

/// Stored state of one target
#[derive(Debug, Serialize)]
pub struct TargetStatus {
    /// Directory name under the storage root
    pub target_key: String,
    /// Recorded items per kind
    pub recorded: BTreeMap<ContentKind, u64>,
    /// Resume state, when present and readable
    pub resume: Option<ResumeState>,
    /// Why the resume state could not be read
    pub resume_error: Option<String>,
    /// Current lock record
    pub lock: Option<LockRecord>,
}

impl TargetStatus {
    /// Read the status of the target stored at `root`
    pub fn read(root: &Path) -> Result<Self, CliError> {
        let target_key = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (resume, resume_error) = match ResumeState::peek(&root.join(STATE_FILE_NAME)) {
            Ok(state) => (state, None),
            Err(e) => (None, Some(e.to_string())),
        };
        Ok(Self {
            target_key,
            recorded: scan_counts(root)?,
            resume,
            resume_error,
            lock: inspect_lock(root)?,
        })
    }
}

impl StatusArgs {
    /// Execute the status command
    pub async fn execute(&self, cli: &Cli) -> Result<i32, CliError> {
        let roots = self.target_roots(&cli.storage_dir)?;
        let statuses = roots
            .iter()
            .map(|root| TargetStatus::read(root))
            .collect::<Result<Vec<_>, _>>()?;

        match cli.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&statuses)?),
            OutputFormat::Human => {
                if statuses.is_empty() {
                    println!("No archived targets under {}", cli.storage_dir.display());
                }
                for status in &statuses {
                    print_status(status);
                }
            }
        }
        Ok(0)
    }

    fn target_roots(&self, storage_dir: &Path) -> Result<Vec<PathBuf>, CliError> {
        if let Some(key) = &self.target_key {
            let root = storage_dir.join(key);
            if !root.is_dir() {
                return Err(CliError::InvalidArgument(format!(
                    "no archive for {key} under {}",
                    storage_dir.display()
                )));
            }
            return Ok(vec![root]);
        }
        if !storage_dir.is_dir() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(storage_dir).map_err(|e| {
            CliError::InvalidArgument(format!(
                "Failed to read storage directory {}: {e}",
                storage_dir.display()
            ))
        })?;
        let mut roots = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| CliError::InvalidArgument(format!("Failed to read directory entry: {e}")))?
                .path();
            if path.is_dir() {
                roots.push(path);
            }
        }
        roots.sort();
        Ok(roots)
    }
}

fn print_status(status: &TargetStatus) {
    println!("\n{}", status.target_key);
    match &status.lock {
        Some(lock) if lock.is_held() => println!(
            "  locked by {} (heartbeat {}s ago)",
            lock.owner.owner_id,
            lock.heartbeat_age(Utc::now()).as_secs()
        ),
        _ => println!("  not locked"),
    }
    if let Some(err) = &status.resume_error {
        println!("  resume state unreadable: {err} (rerun with --resume reset)");
    }

    for kind in ContentKind::ALL {
        let recorded = status.recorded.get(&kind).copied().unwrap_or(0);
        let checkpoint = status.resume.as_ref().and_then(|s| s.stream(kind));
        if recorded == 0 && checkpoint.is_none() {
            continue;
        }
        let position = match checkpoint {
            Some(cp) if cp.completed => "complete".to_string(),
            Some(cp) => cp
                .cursor
                .as_ref()
                .map_or_else(|| "start".to_string(), ToString::to_string),
            None => "-".to_string(),
        };
        println!("  {:<10} recorded {:>8}  at {}", kind.as_str(), recorded, position);
    }
}
