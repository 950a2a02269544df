use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::capture::FrameId;

/// File name of the artifact for frame `id`: `<prefix><zero-padded id>.<ext>`.
pub fn frame_file_name(prefix: &str, id: FrameId, digits: usize, extension: &str) -> String {
    format!("{prefix}{:0digits$}.{extension}", id.0)
}

/// Finds an encoder executable, either as given or on `PATH`.
pub fn auto_detect_encoder(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    debug!(program, "searching PATH for encoder");
    let paths = env::var_os("PATH")?;
    let found = env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| is_executable(path));

    if let Some(path) = &found {
        info!("Found encoder: {}", path.display());
    }
    found
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}
