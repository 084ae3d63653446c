use anyhow::{bail, Context};
use cm_common::CertificateRequest;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read one JSON or TOML certificate request, chosen by file extension
pub fn load_manifest(path: &Path) -> anyhow::Result<CertificateRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;

    let request: CertificateRequest = match extension(path).as_deref() {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON manifest {}", path.display()))?,
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("Invalid TOML manifest {}", path.display()))?,
        _ => bail!("Unsupported manifest type: {}", path.display()),
    };

    debug!(path = %path.display(), request = %request.key(), "Loaded manifest");
    Ok(request)
}

/// Every manifest in `dir`, in file name order
pub fn load_manifests(dir: &Path) -> anyhow::Result<Vec<(PathBuf, CertificateRequest)>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| matches!(extension(path).as_deref(), Some("json" | "toml")))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| load_manifest(&path).map(|request| (path, request)))
        .collect()
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}
