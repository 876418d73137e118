//! Restart-artifact packaging.
//!
//! Restart state produced by a run is packed into a single gzipped tar
//! archive named deterministically by month index; the following month
//! unpacks it into its staging input area.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::Path;

/// Pack the `*.res*` state files from `restart_dir` into `dest`. Returns
/// the number of files archived.
pub(crate) fn pack_restart(restart_dir: &Path, dest: &Path) -> Result<usize> {
    let file = File::create(dest)
        .with_context(|| format!("creating restart archive {}", dest.display()))?;
    let enc = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(enc);
    let mut count = 0usize;
    for entry in std::fs::read_dir(restart_dir)
        .with_context(|| format!("reading restart staging dir {}", restart_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_file() && name.to_string_lossy().contains(".res") {
            builder
                .append_path_with_name(entry.path(), &name)
                .with_context(|| format!("archiving {}", entry.path().display()))?;
            count += 1;
        }
    }
    builder
        .into_inner()
        .and_then(|enc| enc.finish())
        .with_context(|| format!("finalizing restart archive {}", dest.display()))?;
    Ok(count)
}

/// Unpack a restart archive into `into` (the run's staging input area).
pub(crate) fn unpack_restart(archive: &Path, into: &Path) -> Result<()> {
    let file = File::open(archive)
        .with_context(|| format!("opening restart archive {}", archive.display()))?;
    let mut ar = tar::Archive::new(GzDecoder::new(file));
    ar.unpack(into)
        .with_context(|| format!("unpacking restart archive {}", archive.display()))?;
    Ok(())
}

/// Light-policy prune: remove the given prior-month restart copies. Already
/// absent files are tolerated so a re-run after a partial prune still works.
pub(crate) fn prune_restart_copies(paths: &[&Path]) -> Result<()> {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("pruning restart copy {}", path.display()));
            }
        }
    }
    Ok(())
}
