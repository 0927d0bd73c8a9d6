//! Provenance sidecar written once per output directory

use crate::Result;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

pub const VERSION_FILE: &str = "pipeline_version.txt";

/// Version tag: `git <describe>` when a tag description is available, else `fallback`
///
/// `build_describe` is the description captured at compile time; it is used
/// when `git describe` fails at run time (no repository, no git binary).
pub fn version_label(build_describe: Option<&str>, fallback: &str) -> String {
    if let Some(describe) = git_describe() {
        return format!("git {describe}");
    }
    match build_describe {
        Some(d) if !d.is_empty() && d != "unknown" => format!("git {d}"),
        _ => fallback.to_string(),
    }
}

fn git_describe() -> Option<String> {
    let output = Command::new("git").args(["describe", "--tags"]).output().ok()?;
    if !output.status.success() {
        debug!("git describe failed, falling back to package version");
        return None;
    }
    let describe = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!describe.is_empty()).then_some(describe)
}

/// Create `out_dir` and write `pipeline_version.txt` into it
pub fn export_version(out_dir: &Path, label: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir)?;
    let path = out_dir.join(VERSION_FILE);
    std::fs::write(&path, label)?;
    info!(version = %label, path = %path.display(), "Wrote pipeline version");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_export_version_creates_directory() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("2D/bianca");
        let path = export_version(&out, "0.1.0").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "0.1.0");
    }

    #[test]
    fn test_label_is_never_empty() {
        let label = version_label(None, "0.1.0");
        assert!(label == "0.1.0" || label.starts_with("git "));
    }
}
