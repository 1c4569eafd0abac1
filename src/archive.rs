use std::fs::{self, File};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::error::AbiError;

/// Bundle `source` into a gzip-compressed tar at `archive_path`. Entries are
/// rooted at the source directory's own name and walked in sorted order so
/// repeated runs produce identical member listings.
pub fn archive_dir(source: &Utf8Path, archive_path: &Utf8Path) -> Result<Utf8PathBuf, AbiError> {
    let base = source
        .file_name()
        .ok_or_else(|| AbiError::Archive(format!("bad source directory: {source}")))?;

    let tmp_path = Utf8PathBuf::from(format!("{archive_path}.tmp"));
    let result = write_archive(source, base, &tmp_path);
    if result.is_err() {
        let _ = fs::remove_file(tmp_path.as_std_path());
        result?;
    }
    fs::rename(tmp_path.as_std_path(), archive_path.as_std_path())
        .map_err(|err| AbiError::Archive(err.to_string()))?;
    debug!(source = %source, archive = %archive_path, "archive written");
    Ok(archive_path.to_owned())
}

fn write_archive(source: &Utf8Path, base: &str, tmp_path: &Utf8Path) -> Result<(), AbiError> {
    let file =
        File::create(tmp_path.as_std_path()).map_err(|err| AbiError::Archive(err.to_string()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    builder
        .append_dir(base, source.as_std_path())
        .map_err(|err| AbiError::Archive(err.to_string()))?;
    append_tree(&mut builder, source, Utf8PathBuf::from(base))?;

    let encoder = builder
        .into_inner()
        .map_err(|err| AbiError::Archive(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| AbiError::Archive(err.to_string()))?;
    Ok(())
}

fn append_tree(
    builder: &mut tar::Builder<GzEncoder<File>>,
    dir: &Utf8Path,
    prefix: Utf8PathBuf,
) -> Result<(), AbiError> {
    let mut entries = Vec::new();
    let listing =
        fs::read_dir(dir.as_std_path()).map_err(|err| AbiError::Archive(err.to_string()))?;
    for entry in listing {
        let entry = entry.map_err(|err| AbiError::Archive(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|path| AbiError::Archive(format!("non-utf8 path: {}", path.display())))?;
        entries.push(path);
    }
    entries.sort();

    for path in entries {
        let Some(name) = path.file_name() else {
            continue;
        };
        let entry_name = prefix.join(name);
        if path.is_dir() {
            builder
                .append_dir(entry_name.as_std_path(), path.as_std_path())
                .map_err(|err| AbiError::Archive(err.to_string()))?;
            append_tree(builder, &path, entry_name)?;
        } else {
            builder
                .append_path_with_name(path.as_std_path(), entry_name.as_std_path())
                .map_err(|err| AbiError::Archive(err.to_string()))?;
        }
    }
    Ok(())
}
