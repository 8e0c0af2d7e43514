use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

/// Returns a sibling of `target` named `<file name>.<random>.partial`. Writing there first and
/// renaming afterwards means `target` is either absent or complete.
pub fn partial_path(target: &Path) -> PathBuf {
    use rand::distributions::{Alphanumeric, DistString};

    const EXT: &str = ".partial";
    const LEN: usize = 8;

    let file_name = target.file_name().unwrap_or_default();
    let mut name = OsString::with_capacity(file_name.len() + 1 + LEN + EXT.len());
    name.push(file_name);
    name.push(".");
    name.push(Alphanumeric.sample_string(&mut rand::thread_rng(), LEN));
    name.push(EXT);
    target.with_file_name(name)
}

/// Writes `contents` to `target` through a [`partial_path`].
pub fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    let partial = partial_path(target);
    fs::write(&partial, contents)?;
    fs::rename(&partial, target)
}
