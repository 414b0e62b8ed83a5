use std::path::{Path, PathBuf};

pub const ARTIFACTS_ENV: &str = "HANDOVER_ARTIFACTS_DIR";

/// Resolve the directory that holds per-task artifact folders.
///
/// An explicit path wins, then `HANDOVER_ARTIFACTS_DIR`, then
/// `.handover/artifacts/` under `base`. Relative paths are taken relative to
/// `base`.
pub fn resolve_artifact_root(explicit: Option<&Path>, base: &Path) -> PathBuf {
    let from_env = std::env::var_os(ARTIFACTS_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    pick_artifact_root(explicit.map(Path::to_path_buf).or(from_env), base)
}

fn pick_artifact_root(chosen: Option<PathBuf>, base: &Path) -> PathBuf {
    match chosen {
        Some(path) if path.is_absolute() => path,
        Some(path) => base.join(path),
        None => base.join(".handover").join("artifacts"),
    }
}
