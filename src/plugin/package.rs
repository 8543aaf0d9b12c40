use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::{IoContext, PluginError, Result};
use crate::plugin::manifest::PluginDescriptor;

pub const PACKAGE_EXTENSION: &str = "afp";
pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const PRIVATE_MODULE_DIR: &str = "lib";
pub const MODULE_EXTENSION: &str = "wasm";
/// Largest archive entry the host will inflate.
pub const MAX_ENTRY_SIZE: u64 = 64 * 1024 * 1024;

/// A plugin package held in memory, so the file on disk can be replaced
/// while code from it is resident.
pub struct PackageArchive {
    path: PathBuf,
    archive: ZipArchive<Cursor<Vec<u8>>>,
}

impl PackageArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).at(path)?;
        let archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|err| PluginError::parse(path.display().to_string(), err))?;

        Ok(Self {
            path: path.to_path_buf(),
            archive,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&mut self) -> Result<PluginDescriptor> {
        let context = self.path.display().to_string();
        let bytes = self
            .read(MANIFEST_ENTRY)?
            .ok_or_else(|| PluginError::parse(&context, format!("missing {MANIFEST_ENTRY}")))?;
        let text = String::from_utf8(bytes).map_err(|err| PluginError::parse(&context, err))?;

        let mut descriptor = PluginDescriptor::from_json(&text, &context)?;
        descriptor.install_path = Some(self.path.clone());
        Ok(descriptor)
    }

    /// Reads an archive entry; `None` if the entry does not exist.
    pub fn read(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let name = name.trim_start_matches("./");
        let mut file = match self.archive.by_name(name) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(err) => return Err(PluginError::parse(format!("{}!{name}", self.path.display()), err)),
        };

        let context = format!("{}!{name}", self.path.display());
        let declared = file.size();
        read_bounded(&mut file, declared, MAX_ENTRY_SIZE, &context).map(Some)
    }

    /// Looks up a bundled dependency module by module name.
    pub fn private_module(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        if !is_plain_module_name(name) {
            return Ok(None);
        }
        self.read(&format!("{PRIVATE_MODULE_DIR}/{name}.{MODULE_EXTENSION}"))
    }
}

/// Parses just the manifest out of a package file.
pub fn read_manifest(path: &Path) -> Result<PluginDescriptor> {
    PackageArchive::open(path)?.manifest()
}

pub fn is_package(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(PACKAGE_EXTENSION))
}

/// Reads at most `limit` bytes. The declared size is only trusted to reject
/// early; the buffer grows with what the reader actually yields.
fn read_bounded(reader: impl Read, declared: u64, limit: u64, context: &str) -> Result<Vec<u8>> {
    if declared > limit {
        return Err(PluginError::parse(
            context,
            format!("entry declares {declared} bytes, limit is {limit}"),
        ));
    }

    let mut bytes = Vec::new();
    reader
        .take(limit + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| PluginError::parse(context, err))?;
    if bytes.len() as u64 > limit {
        return Err(PluginError::parse(
            context,
            format!("entry exceeds {limit} bytes"),
        ));
    }
    Ok(bytes)
}

fn is_plain_module_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && !name.contains(['/', '\\', ':'])
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;
    use zip::ZipWriter;
    use zip::write::FileOptions;

    use super::*;

    fn write_package(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        for (name, bytes) in entries {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
    }

    const MANIFEST: &[u8] =
        br#"{"id":"spellcheck","name":"Spell","version":"1.2.0","entry":"spell.wasm"}"#;

    #[test]
    fn reads_manifest_and_modules() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spellcheck.afp");
        write_package(
            &path,
            &[
                (MANIFEST_ENTRY, MANIFEST),
                ("spell.wasm", b"entry"),
                ("lib/dict.wasm", b"dict"),
            ],
        );

        let mut package = PackageArchive::open(&path).unwrap();
        let descriptor = package.manifest().unwrap();

        assert_eq!(descriptor.id.as_str(), "spellcheck");
        assert_eq!(descriptor.install_path.as_deref(), Some(path.as_path()));
        assert_eq!(package.read("spell.wasm").unwrap().unwrap(), b"entry");
        assert_eq!(package.private_module("dict").unwrap().unwrap(), b"dict");
        assert!(package.private_module("missing").unwrap().is_none());
        assert!(package.private_module("../dict").unwrap().is_none());
    }

    #[test]
    fn entry_sizes_are_bounded() {
        let payload = [7u8; 100];

        // A hostile declared size is refused before anything is read.
        let err = read_bounded(&payload[..], u64::MAX, 64, "pkg!big").unwrap_err();
        assert!(matches!(err, PluginError::Parse { .. }));
        // An understated size does not let more than the limit through.
        let err = read_bounded(&payload[..], 1, 64, "pkg!big").unwrap_err();
        assert!(matches!(err, PluginError::Parse { .. }));

        let bytes = read_bounded(&payload[..], 100, 100, "pkg!exact").unwrap();
        assert_eq!(bytes.len(), 100);
    }

    #[test]
    fn missing_manifest_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.afp");
        write_package(&path, &[("spell.wasm", b"entry")]);

        let err = read_manifest(&path).unwrap_err();
        assert!(matches!(err, PluginError::Parse { .. }), "{err}");
    }

    #[test]
    fn garbage_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.afp");
        fs::write(&path, b"not a zip").unwrap();

        assert!(matches!(read_manifest(&path), Err(PluginError::Parse { .. })));
        assert!(is_package(&path));
        assert!(!is_package(dir.path()));
    }
}
