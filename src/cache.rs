use crate::artifacts::{self, Artifacts};
use crate::export::list_export_files;
use anyhow::Context;
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDecision {
    Run(RunReason),
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReason {
    NoExports,
    NoOutput,
    ExportsChanged,
}

impl std::fmt::Display for RunReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunReason::NoExports => write!(f, "No export files found"),
            RunReason::NoOutput => write!(f, "No {} found", artifacts::VIZ_DATA),
            RunReason::ExportsChanged => write!(f, "Exports changed"),
        }
    }
}

impl CacheDecision {
    pub fn should_run(&self) -> bool {
        matches!(self, CacheDecision::Run(_))
    }
}

/// MD5 hex digest over `name:size:mtime` of every export, or `None` when
/// there are no exports.
pub fn exports_fingerprint(exports_dir: &Path) -> anyhow::Result<Option<String>> {
    let files = list_export_files(exports_dir)?;
    if files.is_empty() {
        return Ok(None);
    }

    let mut input = String::new();
    for path in &files {
        let meta = fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        input.push_str(&format!("{}:{}:{}", name, meta.len(), mtime));
    }

    Ok(Some(format!("{:x}", md5::compute(input.as_bytes()))))
}

pub fn check(exports_dir: &Path, out: &Artifacts) -> anyhow::Result<CacheDecision> {
    let Some(current) = exports_fingerprint(exports_dir)? else {
        return Ok(CacheDecision::Run(RunReason::NoExports));
    };

    if !out.path(artifacts::VIZ_DATA).exists() {
        return Ok(CacheDecision::Run(RunReason::NoOutput));
    }

    match fs::read_to_string(out.path(artifacts::EXPORTS_HASH)) {
        Ok(stored) if stored.trim() == current => Ok(CacheDecision::Skip),
        _ => Ok(CacheDecision::Run(RunReason::ExportsChanged)),
    }
}

/// Records the current fingerprint after a successful run.
pub fn save_hash(exports_dir: &Path, out: &Artifacts) -> anyhow::Result<()> {
    let fingerprint = exports_fingerprint(exports_dir)?.unwrap_or_default();
    out.ensure_dir()?;
    let path = out.path(artifacts::EXPORTS_HASH);
    fs::write(&path, fingerprint).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Cache hash saved");
    Ok(())
}
