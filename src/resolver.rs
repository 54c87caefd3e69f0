//! The I/O seam behind `INCLUDE`/`IMPORT` (§4.6, §9 Design Notes "Read-file
//! / OS calls inside opcodes"): resolving a logical include/import name to
//! source bytes is abstracted behind a trait so the dispatch loop never
//! touches the filesystem directly, and so it is testable with an
//! in-memory resolver.

use std::path::{Path, PathBuf};

use crate::error::{VmError, VmResult};

/// Maps a logical include/import name to source text plus the directory a
/// further nested include inside that source should resolve against.
pub trait SourceResolver {
    /// Resolves `path` relative to `current_dir` for an `INCLUDE` (§4.6):
    /// returns the source text and the directory to treat as "current" for
    /// includes nested inside it.
    fn resolve_include(&self, current_dir: &str, path: &str) -> VmResult<(String, String)>;

    /// Resolves `package` under `<exe_dir>/packages/<package>/__MAIN__.<ext>`
    /// for an `IMPORT` (§4.6): returns the source text and its directory.
    fn resolve_import(&self, exe_dir: &str, package: &str) -> VmResult<(String, String)>;
}

/// Production resolver: reads real files relative to the given directories.
/// Missing files are a fatal I/O failure per §4.8/§7.
pub struct FsResolver {
    /// File extension appended to a package's `__MAIN__` stem (e.g. `rose`).
    pub extension: String,
}

impl FsResolver {
    pub fn new(extension: impl Into<String>) -> Self {
        FsResolver {
            extension: extension.into(),
        }
    }

    fn read(path: &Path) -> VmResult<String> {
        std::fs::read_to_string(path)
            .map_err(|e| VmError::io(format!("cannot read '{}': {e}", path.display())))
    }
}

impl SourceResolver for FsResolver {
    fn resolve_include(&self, current_dir: &str, path: &str) -> VmResult<(String, String)> {
        let full = Path::new(current_dir).join(path);
        let source = Self::read(&full)?;
        let dir = full
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| current_dir.to_string());
        Ok((source, dir))
    }

    fn resolve_import(&self, exe_dir: &str, package: &str) -> VmResult<(String, String)> {
        let dir: PathBuf = Path::new(exe_dir).join("packages").join(package);
        let full = dir.join(format!("__MAIN__.{}", self.extension));
        let source = Self::read(&full)?;
        Ok((source, dir.to_string_lossy().into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `resolve_include` reads a real file relative to `current_dir` and
    /// reports its parent as the directory further nested includes resolve
    /// against (§4.6 `INCLUDE`).
    #[test]
    fn fs_resolver_reads_an_include_relative_to_current_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("greet.rose"), "print \"hi\";").unwrap();

        let resolver = FsResolver::new("rose");
        let (source, new_dir) = resolver
            .resolve_include(&dir.path().to_string_lossy(), "greet.rose")
            .unwrap();

        assert_eq!(source, "print \"hi\";");
        assert_eq!(new_dir, dir.path().to_string_lossy());
    }

    /// A missing include path is a fatal I/O error (§4.8/§7), not a panic.
    #[test]
    fn fs_resolver_reports_missing_include_as_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FsResolver::new("rose");
        let err = resolver
            .resolve_include(&dir.path().to_string_lossy(), "nope.rose")
            .unwrap_err();
        assert!(matches!(err, VmError::Io(_)));
    }

    /// `resolve_import` reads `<exe_dir>/packages/<name>/__MAIN__.<ext>`
    /// (§4.6 `IMPORT`) and reports that package directory as `new_dir`.
    #[test]
    fn fs_resolver_reads_a_package_main_under_exe_dir() {
        let exe_dir = tempfile::tempdir().unwrap();
        let pkg_dir = exe_dir.path().join("packages").join("greeter");
        std::fs::create_dir_all(&pkg_dir).unwrap();
        std::fs::write(pkg_dir.join("__MAIN__.rose"), "var ok = true;").unwrap();

        let resolver = FsResolver::new("rose");
        let (source, new_dir) = resolver
            .resolve_import(&exe_dir.path().to_string_lossy(), "greeter")
            .unwrap();

        assert_eq!(source, "var ok = true;");
        assert_eq!(new_dir, pkg_dir.to_string_lossy());
    }

    /// A missing package `__MAIN__` is a fatal I/O error (§4.8/§7).
    #[test]
    fn fs_resolver_reports_missing_package_as_io_error() {
        let exe_dir = tempfile::tempdir().unwrap();
        let resolver = FsResolver::new("rose");
        let err = resolver
            .resolve_import(&exe_dir.path().to_string_lossy(), "nope")
            .unwrap_err();
        assert!(matches!(err, VmError::Io(_)));
    }
}

/// Test-only resolver backed by an in-memory map of logical path to source,
/// so include/import behavior is testable without touching the filesystem.
#[cfg(any(test, feature = "test-support"))]
pub struct MemoryResolver {
    files: std::collections::HashMap<String, String>,
}

#[cfg(any(test, feature = "test-support"))]
impl MemoryResolver {
    pub fn new() -> Self {
        MemoryResolver {
            files: std::collections::HashMap::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.files.insert(path.into(), source.into());
        self
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Default for MemoryResolver {
    fn default() -> Self {
        MemoryResolver::new()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl SourceResolver for MemoryResolver {
    fn resolve_include(&self, current_dir: &str, path: &str) -> VmResult<(String, String)> {
        let key = format!("{current_dir}/{path}");
        self.files
            .get(&key)
            .or_else(|| self.files.get(path))
            .cloned()
            .map(|s| (s, current_dir.to_string()))
            .ok_or_else(|| VmError::io(format!("no such file '{key}'")))
    }

    fn resolve_import(&self, exe_dir: &str, package: &str) -> VmResult<(String, String)> {
        let key = format!("{exe_dir}/packages/{package}/__MAIN__");
        self.files
            .get(&key)
            .cloned()
            .map(|s| (s, format!("{exe_dir}/packages/{package}")))
            .ok_or_else(|| VmError::io(format!("no such package '{package}'")))
    }
}
