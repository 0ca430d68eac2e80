use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Move the contents of the upper directory `src` into `dst`, entries of
/// `src` taking precedence.
///
/// Directories present on both sides are merged recursively unless the
/// source directory is opaque, in which case it replaces the target. Any
/// other entry (files, symlinks, whiteout devices) replaces the target.
pub(crate) fn merge_upper(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        match fs::symlink_metadata(&to) {
            Ok(existing) => {
                if file_type.is_dir() && existing.is_dir() && !is_opaque(&from) {
                    merge_upper(&from, &to)?;
                    continue;
                }
                if existing.is_dir() {
                    fs::remove_dir_all(&to)?;
                } else {
                    fs::remove_file(&to)?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::rename(&from, &to)?;
    }
    Ok(())
}

fn is_opaque(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let name = c"trusted.overlay.opaque";
    let mut value = [0u8; 1];
    // SAFETY: both strings are NUL terminated and the buffer length matches.
    let n = unsafe {
        libc::lgetxattr(
            c_path.as_ptr(),
            name.as_ptr(),
            value.as_mut_ptr() as *mut libc::c_void,
            value.len(),
        )
    };
    n == 1 && value[0] == b'y'
}
