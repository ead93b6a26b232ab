//! Filesystem helpers for persisted operator outputs

use std::io::Write;
use std::path::Path;

use crate::Error;

/// Write `data` to `path` by way of a sibling temp file and a rename.
///
/// Parent directories are created. When `mode` is given the file gets those
/// permission bits before it becomes visible at `path`.
pub fn write_atomic(path: &Path, data: &[u8], mode: Option<u32>) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = std::fs::File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(|e| Error::io(&tmp, e))?;
    }
    file.write_all(data).map_err(|e| Error::io(&tmp, e))?;
    file.sync_all().map_err(|e| Error::io(&tmp, e))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|e| Error::io(path, e))
}
