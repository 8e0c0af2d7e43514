use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::layout;

/// SHA-256 over the declared inputs of a step, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulates named inputs into a [`Fingerprint`]. Every input is framed by its kind and name so
/// that moving a value from one input to another changes the result.
pub struct Fingerprinter {
    hasher: Sha256,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn frame(&mut self, kind: &str, name: &str) {
        self.hasher.update(kind.as_bytes());
        self.hasher.update([0u8]);
        self.hasher.update(name.as_bytes());
        self.hasher.update([0u8]);
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    fn file_contents(&mut self, path: &Path) -> io::Result<()> {
        let mut file = fs::File::open(path)?;
        self.hasher.update(file.metadata()?.len().to_le_bytes());
        io::copy(&mut file, &mut self.hasher)?;
        Ok(())
    }

    pub fn property(mut self, name: &str, value: &str) -> Self {
        self.frame("property", name);
        self.bytes(value.as_bytes());
        self
    }

    pub fn properties<'a, I>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.frame("properties", name);
        for value in values {
            self.bytes(value.as_bytes());
        }
        self
    }

    pub fn file(mut self, name: &str, path: &Path) -> io::Result<Self> {
        self.frame("file", name);
        self.file_contents(path)?;
        Ok(self)
    }

    /// Includes several files by file name and contents, in the given order.
    pub fn files<'a, I>(mut self, name: &str, paths: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = &'a Path>,
    {
        self.frame("files", name);
        for path in paths {
            self.bytes(path.file_name().unwrap_or_default().as_encoded_bytes());
            self.file_contents(path)?;
        }
        Ok(self)
    }

    /// Includes the relative path and contents of every file below `root`.
    pub fn dir(mut self, name: &str, root: &Path) -> io::Result<Self> {
        self.frame("dir", name);
        for relative in layout::files_under(root)? {
            self.bytes(relative.as_os_str().as_encoded_bytes());
            self.file_contents(&root.join(relative))?;
        }
        Ok(self)
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(hex::encode(self.hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_are_framed() {
        let a = Fingerprinter::new()
            .property("baseImage", "ab")
            .property("githubUrl", "c")
            .finish();
        let b = Fingerprinter::new()
            .property("baseImage", "a")
            .property("githubUrl", "bc")
            .finish();
        assert_ne!(a, b);
        assert_eq!(
            a,
            Fingerprinter::new()
                .property("baseImage", "ab")
                .property("githubUrl", "c")
                .finish()
        );
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn dir_tracks_names_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/a.sh"), "echo a").unwrap();
        let fingerprint = || Fingerprinter::new().dir("scripts", dir.path()).unwrap().finish();

        let initial = fingerprint();
        assert_eq!(initial, fingerprint());

        fs::write(dir.path().join("sub/a.sh"), "echo b").unwrap();
        let changed = fingerprint();
        assert_ne!(initial, changed);

        fs::rename(dir.path().join("sub/a.sh"), dir.path().join("sub/b.sh")).unwrap();
        assert_ne!(changed, fingerprint());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let error = Fingerprinter::new()
            .file("dockerfile", &dir.path().join("Dockerfile"))
            .err()
            .unwrap();
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }
}
