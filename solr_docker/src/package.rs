use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use flate2::{Compression, GzBuilder};
use log::{debug, info, warn};

use crate::{
    layout::{self, MissingInput},
    temp_path, Result,
};

const SCRIPT_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// The build context handed to the image builder: a gzip compressed tar archive with
///
/// ```txt
/// Dockerfile
/// scripts/**        (executable)
/// releases/*.tgz
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextArchive {
    path: PathBuf,
}

impl ContextArchive {
    /// Refers to an archive produced by an earlier run.
    pub fn existing(path: PathBuf) -> Result<Self, MissingInput> {
        layout::require_file(&path)
            .map_err(|error| error.with_hint("run the `package` step first"))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }
}

pub struct PackageInputs<'a> {
    pub scripts_dir: &'a Path,
    pub releases_dir: &'a Path,
    pub dockerfile: &'a Path,
}

impl PackageInputs<'_> {
    pub fn validate(&self) -> Result<(), MissingInput> {
        layout::require_dir(self.scripts_dir)?;
        layout::require_dir(self.releases_dir)?;
        layout::require_file(self.dockerfile)?;
        Ok(())
    }

    /// The release archives to package, sorted by path.
    pub fn release_archives(&self) -> Result<Vec<PathBuf>> {
        release_archives(self.releases_dir)
    }
}

/// Returns the `*.tgz` files directly inside `releases_dir`.
pub fn release_archives(releases_dir: &Path) -> Result<Vec<PathBuf>> {
    let dir = releases_dir
        .to_str()
        .ok_or_else(|| format!("releases directory {releases_dir:?} is not valid unicode"))?;
    let pattern = format!("{}/*.tgz", glob::Pattern::escape(dir));
    let mut paths = glob::glob(&pattern)?
        .filter_map(|entry| match entry {
            Ok(path) => path.is_file().then_some(Ok(path)),
            Err(error) => Some(Err(error)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    paths.sort();
    Ok(paths)
}

fn header(mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(mode);
    // Normalized so that identical inputs produce identical archives.
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn append_file<W: io::Write>(
    tar: &mut tar::Builder<W>,
    archive_path: &Path,
    source: &Path,
    mode: u32,
) -> io::Result<()> {
    let file = File::open(source)?;
    let mut header = header(mode, file.metadata()?.len());
    tar.append_data(&mut header, archive_path, file)
}

/// Writes the build context for `inputs` to `output` and returns it.
pub fn package(inputs: &PackageInputs, output: &Path) -> Result<ContextArchive> {
    inputs.validate()?;

    let releases = inputs.release_archives()?;
    if releases.is_empty() {
        warn!(
            "no `*.tgz` release archives found in {:?}, the image will not contain a release",
            inputs.releases_dir
        );
    }

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = temp_path::partial_path(output);

    let write = || -> io::Result<usize> {
        let encoder = GzBuilder::new()
            .mtime(0)
            .write(File::create(&partial)?, Compression::default());
        let mut tar = tar::Builder::new(encoder);
        let mut entries = 0;

        for relative in layout::files_under(inputs.scripts_dir)? {
            append_file(
                &mut tar,
                &Path::new("scripts").join(&relative),
                &inputs.scripts_dir.join(&relative),
                SCRIPT_MODE,
            )?;
            entries += 1;
        }

        for release in &releases {
            let Some(file_name) = release.file_name() else {
                continue;
            };
            append_file(
                &mut tar,
                &Path::new("releases").join(file_name),
                release,
                FILE_MODE,
            )?;
            entries += 1;
        }

        append_file(&mut tar, Path::new("Dockerfile"), inputs.dockerfile, FILE_MODE)?;
        entries += 1;

        tar.into_inner()?.finish()?.sync_all()?;
        Ok(entries)
    };

    let entries = match write() {
        Ok(entries) => entries,
        Err(error) => {
            let _ = fs::remove_file(&partial);
            return Err(error.into());
        }
    };
    fs::rename(&partial, output)?;

    debug!("packaged {entries} entries into {output:?}");
    info!(
        "Packaged build context {output:?} with {} release archive(s)",
        releases.len()
    );

    Ok(ContextArchive {
        path: output.to_owned(),
    })
}
