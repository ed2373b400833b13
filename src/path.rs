//! `PathCodec` — canonicalizes volume-qualified paths and derives KV key prefixes.
//!
//! A [`Path`] is a (volume name, absolute POSIX path) pair. All operations here are
//! deterministic, pure functions over that pair.

use std::fmt;

/// A volume-qualified absolute POSIX path. A path is a *directory* iff it ends in `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    pub volume: String,
    pub path: String,
}

impl Path {
    pub fn new(volume: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            path: path.into(),
        }
    }

    /// The root directory of a volume.
    pub fn root(volume: impl Into<String>) -> Self {
        Self::new(volume, "/")
    }

    pub fn is_dir(&self) -> bool {
        self.path.ends_with('/')
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// The directory containing `self` (whether `self` names a file or a directory), or
    /// `None` if `self` is the root.
    pub fn parent(&self) -> Option<Path> {
        if self.is_root() {
            return None;
        }
        let trimmed = self.path.trim_end_matches('/');
        let idx = trimmed.rfind('/')?;
        Some(Path::new(self.volume.clone(), &trimmed[..=idx]))
    }

    /// Appends `name` to this directory. `name` ending in `/` yields a subdirectory path,
    /// otherwise a file path. Returns `None` if `self` is not a directory.
    pub fn child(&self, name: &str) -> Option<Path> {
        if !self.is_dir() {
            return None;
        }
        let mut p = self.path.clone();
        p.push_str(name.trim_start_matches('/'));
        Some(Path::new(self.volume.clone(), p))
    }

    /// The final path component, without a trailing `/`.
    pub fn filename(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or("")
    }

    /// The directory containing this path, as a string (e.g. for resolving a relative
    /// symlink target against the directory the link lives in).
    pub fn base(&self) -> String {
        self.parent().map(|p| p.path).unwrap_or_else(|| "/".into())
    }

    /// The KV key identifying this path's directory/file-entry record, without the `dirs:`
    /// table prefix (`dirs:<volumeName>:<absolutePath>`).
    pub fn key(&self) -> String {
        format!("{}:{}", self.volume, self.path)
    }

    /// The scan prefix under which `Scan` must return exactly the immediate subdirectories of
    /// `self`. Callers must additionally filter scan results to single path
    /// segments past the prefix — see [`crate::store::FsMetaStore::getdir`].
    pub fn subdirs_prefix(&self) -> String {
        self.key()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.volume, self.path)
    }
}
