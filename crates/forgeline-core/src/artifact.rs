//! On-disk run reports with tamper evidence.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::report::PipelineRunResult;

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Persist `<dir>/<run_id>/run.json` and `<dir>/<run_id>/run.digest`.
pub fn write_run_report(result: &PipelineRunResult, dir: &Path) -> Result<PathBuf> {
    let run_dir = dir.join(result.run_id.to_string());
    std::fs::create_dir_all(&run_dir)?;

    let report_path = run_dir.join("run.json");
    let digest_path = run_dir.join("run.digest");
    let json = serde_json::to_vec_pretty(result)?;
    let digest = sha256_hex(&json);

    std::fs::write(&report_path, &json)?;
    std::fs::write(&digest_path, digest.as_bytes())?;

    Ok(report_path)
}

/// Read `<dir>/<run_id>/run.json` and verify it against its digest.
/// `run_id` must be a UUID, so it can never name a path outside `dir`.
pub fn read_run_report(run_id: &str, dir: &Path) -> Result<PipelineRunResult> {
    let run_id =
        Uuid::parse_str(run_id).map_err(|_| PipelineError::InvalidRunId(run_id.to_string()))?;
    let run_dir = dir.join(run_id.to_string());
    let json = std::fs::read(run_dir.join("run.json"))?;
    let expected = std::fs::read_to_string(run_dir.join("run.digest"))?;
    let actual = sha256_hex(&json);
    if expected.trim() != actual {
        return Err(PipelineError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }
    Ok(serde_json::from_slice(&json)?)
}
