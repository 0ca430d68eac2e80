//! A layer's changeset travels as a single tar archive of its upper directory.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use log::debug;
use tar::{Archive, Builder};

use crate::error::{LayerError, io_err};

/// Archive the contents of `src` into `dest`. Returns the archive size in bytes.
pub fn pack_dir(src: &Path, dest: &Path) -> Result<u64, LayerError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let file = File::create(dest).map_err(io_err(dest))?;
    let mut builder = Builder::new(BufWriter::new(file));
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src).map_err(io_err(src))?;
    let mut writer = builder.into_inner().map_err(io_err(dest))?;
    writer.flush().map_err(io_err(dest))?;

    let size = fs::metadata(dest).map_err(io_err(dest))?.len();
    debug!(
        "[layer] packed {} into {} ({size} bytes)",
        src.display(),
        dest.display()
    );
    Ok(size)
}

/// Unpack the archive at `src` into `dest`, creating `dest` if needed.
pub fn unpack_into(src: &Path, dest: &Path) -> Result<(), LayerError> {
    fs::create_dir_all(dest).map_err(io_err(dest))?;
    let file = File::open(src).map_err(io_err(src))?;
    let mut archive = Archive::new(BufReader::new(file));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.unpack(dest).map_err(io_err(dest))?;
    debug!("[layer] unpacked {} into {}", src.display(), dest.display());
    Ok(())
}
