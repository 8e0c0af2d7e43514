use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use log::warn;

/// Where the pipeline reads its inputs from and writes its outputs to.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Holds `Dockerfile`, `scripts/` and `tests/cases/`.
    pub project_dir: PathBuf,
    /// Upstream release archives, of which the `*.tgz` files are packaged.
    pub releases_dir: PathBuf,
    pub build_dir: PathBuf,
}

impl Layout {
    pub fn new(project_dir: PathBuf, releases_dir: PathBuf, build_dir: PathBuf) -> Self {
        Self {
            project_dir,
            releases_dir,
            build_dir,
        }
    }

    pub fn dockerfile(&self) -> PathBuf {
        self.project_dir.join("Dockerfile")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.project_dir.join("scripts")
    }

    pub fn test_cases_dir(&self) -> PathBuf {
        self.project_dir.join("tests").join("cases")
    }

    pub fn archive_path(&self) -> PathBuf {
        self.build_dir.join("solr-docker.tgz")
    }

    pub fn image_id_file(&self) -> PathBuf {
        self.build_dir.join("image-id")
    }

    pub fn test_output_dir(&self) -> PathBuf {
        self.build_dir.join("tmp").join("tests")
    }

    pub fn state_file(&self) -> PathBuf {
        self.build_dir.join("task-state.json")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    File,
    Directory,
}

/// A required input path is absent. Always fatal.
#[derive(Debug)]
pub struct MissingInput {
    pub kind: InputKind,
    pub path: PathBuf,
    pub hint: Option<&'static str>,
}

impl MissingInput {
    pub fn with_hint(mut self, hint: &'static str) -> Self {
        self.hint = Some(hint);
        self
    }
}

impl fmt::Display for MissingInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            InputKind::File => "file",
            InputKind::Directory => "directory",
        };
        write!(f, "required {kind} {:?} does not exist", self.path)?;
        if let Some(hint) = self.hint {
            write!(f, ", {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MissingInput {}

fn require(path: &Path, kind: InputKind) -> Result<(), MissingInput> {
    let present = match kind {
        InputKind::File => path.is_file(),
        InputKind::Directory => path.is_dir(),
    };
    if present {
        Ok(())
    } else {
        Err(MissingInput {
            kind,
            path: path.to_owned(),
            hint: None,
        })
    }
}

pub fn require_file(path: &Path) -> Result<(), MissingInput> {
    require(path, InputKind::File)
}

pub fn require_dir(path: &Path) -> Result<(), MissingInput> {
    require(path, InputKind::Directory)
}

/// Returns all regular files below `root`, relative to `root`, in a stable order. Symbolic links
/// below `root` are not followed and left out.
pub fn files_under(root: &Path) -> io::Result<Vec<PathBuf>> {
    fn visit(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
        let mut entries = std::fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                warn!("skipping symbolic link {path:?}");
            } else if file_type.is_dir() {
                visit(root, &path, out)?;
            } else if file_type.is_file() {
                out.push(
                    path.strip_prefix(root)
                        .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?
                        .to_owned(),
                );
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    visit(root, root, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn missing_inputs_are_reported_with_their_kind() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(
            dir.path().to_owned(),
            dir.path().join("releases"),
            dir.path().join("build"),
        );

        let error = require_file(&layout.dockerfile()).unwrap_err();
        assert_eq!(error.kind, InputKind::File);
        assert!(error.to_string().contains("required file"));

        let error = require_dir(&layout.scripts_dir())
            .unwrap_err()
            .with_hint("create it or pass --project-dir");
        assert_eq!(error.kind, InputKind::Directory);
        assert!(error.to_string().ends_with(", create it or pass --project-dir"));

        fs::write(layout.dockerfile(), "FROM scratch").unwrap();
        require_file(&layout.dockerfile()).unwrap();
        assert!(require_dir(&layout.dockerfile()).is_err());
    }

    #[test]
    fn files_under_is_sorted_and_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/nested")).unwrap();
        fs::write(dir.path().join("c.sh"), "").unwrap();
        fs::write(dir.path().join("a.sh"), "").unwrap();
        fs::write(dir.path().join("b/nested/d.sh"), "").unwrap();

        assert_eq!(
            files_under(dir.path()).unwrap(),
            [
                PathBuf::from("a.sh"),
                PathBuf::from("b/nested/d.sh"),
                PathBuf::from("c.sh"),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn files_under_does_not_follow_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.sh"), "").unwrap();
        std::os::unix::fs::symlink(".", dir.path().join("self")).unwrap();
        std::os::unix::fs::symlink("a.sh", dir.path().join("b.sh")).unwrap();

        assert_eq!(files_under(dir.path()).unwrap(), [PathBuf::from("a.sh")]);
    }
}
