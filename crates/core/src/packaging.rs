//! OCR-D workspace packaging (BagIt in zip).
//!
//! The lifecycle layer treats packaging as opaque and talks to it through
//! [`Packager`]. [`BagItZipPackager`] is the default implementation:
//!
//! - `unpack` reads `bag-info.txt`, extracts the `data/` payload into the
//!   resource directory, checks `manifest-sha512.txt` when present and
//!   requires the METS file named by the bag.
//! - `pack` writes a fresh bag (`bagit.txt`, `bag-info.txt`,
//!   `manifest-sha512.txt`, `data/...`) from a resource directory.
//!
//! Packaging is blocking file I/O; async callers go through
//! `tokio::task::spawn_blocking`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use zip::write::SimpleFileOptions;

use crate::error::CoreError;

/// METS file name assumed when the bag does not name one.
pub const DEFAULT_METS_NAME: &str = "mets.xml";

const BAGIT_TXT: &str = "BagIt-Version: 1.0\nTag-File-Character-Encoding: UTF-8\n";
const PAYLOAD_PREFIX: &str = "data/";

/// Keys recomputed on every pack; never carried over from an upload.
const DERIVED_KEYS: [&str; 2] = ["Bagging-Date", "Payload-Oxum"];

/// Metadata read from (and written to) `bag-info.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagInfo {
    pub ocrd_identifier: String,
    pub bagit_profile_identifier: String,
    pub ocrd_base_version_checksum: Option<String>,
    /// METS path relative to the payload root.
    pub ocrd_mets: Option<String>,
    /// Remaining bag-info keys, preserved verbatim.
    pub extra: BTreeMap<String, String>,
}

impl BagInfo {
    pub fn mets_name(&self) -> &str {
        self.ocrd_mets.as_deref().unwrap_or(DEFAULT_METS_NAME)
    }
}

/// Result of a successful unpack.
#[derive(Debug, Clone)]
pub struct UnpackOutcome {
    pub info: BagInfo,
    /// Digest over the extracted payload, see [`Packager::content_digest`].
    pub content_digest: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// The archive is not an acceptable OCR-D bag.
    #[error("{0}")]
    Invalid(String),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PackageError> for CoreError {
    fn from(err: PackageError) -> Self {
        match err {
            PackageError::Invalid(reason) => CoreError::Validation(reason),
            PackageError::Zip(e) => CoreError::Validation(format!("Unreadable archive: {e}")),
            PackageError::Io(e) => CoreError::Io(e),
        }
    }
}

/// Opaque OCR-D packaging operations.
pub trait Packager: Send + Sync {
    /// Validate `archive` and extract its payload into `dest`.
    fn unpack(&self, archive: &Path, dest: &Path) -> Result<UnpackOutcome, PackageError>;

    /// Write a bag of the payload in `source` to the zip file `dest`.
    fn pack(&self, source: &Path, info: &BagInfo, dest: &Path) -> Result<(), PackageError>;

    /// Stable digest of the payload files in `source`. Entries whose name
    /// starts with `.` are ignored.
    fn content_digest(&self, source: &Path) -> Result<String, PackageError>;
}

/// BagIt-in-zip packager.
#[derive(Debug, Default, Clone, Copy)]
pub struct BagItZipPackager;

impl Packager for BagItZipPackager {
    fn unpack(&self, archive: &Path, dest: &Path) -> Result<UnpackOutcome, PackageError> {
        let mut zip = zip::ZipArchive::new(File::open(archive)?)?;

        if zip.by_name("bagit.txt").is_err() {
            return Err(PackageError::Invalid("bagit.txt missing from archive".into()));
        }
        let info = {
            let mut entry = zip
                .by_name("bag-info.txt")
                .map_err(|_| PackageError::Invalid("bag-info.txt missing from archive".into()))?;
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            parse_bag_info(&text)?
        };
        let manifest = match zip.by_name("manifest-sha512.txt") {
            Ok(mut entry) => {
                let mut text = String::new();
                entry.read_to_string(&mut text)?;
                Some(parse_manifest(&text)?)
            }
            Err(_) => None,
        };

        let mut extracted = BTreeMap::new();
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index)?;
            let Some(name) = entry.enclosed_name() else {
                return Err(PackageError::Invalid(format!(
                    "Archive entry '{}' escapes the bag",
                    entry.name()
                )));
            };
            let Ok(relative) = name.strip_prefix(PAYLOAD_PREFIX) else {
                continue;
            };
            if relative.as_os_str().is_empty() {
                continue;
            }
            let target = dest.join(relative);
            if entry.is_dir() {
                std::fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            let mut hasher = Sha512::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = entry.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n])?;
            }
            extracted.insert(to_bag_path(relative), format!("{:x}", hasher.finalize()));
        }

        if let Some(manifest) = manifest {
            for (path, expected) in &manifest {
                match extracted.get(path) {
                    Some(actual) if actual.eq_ignore_ascii_case(expected) => {}
                    Some(_) => {
                        return Err(PackageError::Invalid(format!(
                            "Checksum mismatch for data/{path}"
                        )))
                    }
                    None => {
                        return Err(PackageError::Invalid(format!(
                            "data/{path} listed in manifest but missing from archive"
                        )))
                    }
                }
            }
        }

        let mets = info.mets_name();
        if !dest.join(mets).is_file() {
            return Err(PackageError::Invalid(format!("METS file '{mets}' not found in bag")));
        }

        let content_digest = self.content_digest(dest)?;
        tracing::debug!(
            ocrd_identifier = %info.ocrd_identifier,
            files = extracted.len(),
            "Unpacked workspace bag"
        );
        Ok(UnpackOutcome { info, content_digest })
    }

    fn pack(&self, source: &Path, info: &BagInfo, dest: &Path) -> Result<(), PackageError> {
        let files = payload_files(source)?;
        let mut writer = zip::ZipWriter::new(BufWriter::new(File::create(dest)?));
        let options = SimpleFileOptions::default();

        writer.start_file("bagit.txt", options)?;
        writer.write_all(BAGIT_TXT.as_bytes())?;

        let mut manifest = String::new();
        let mut octets: u64 = 0;
        for (relative, path) in &files {
            writer.start_file(format!("{PAYLOAD_PREFIX}{relative}"), options)?;
            let mut file = File::open(path)?;
            let mut hasher = Sha512::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                writer.write_all(&buf[..n])?;
                octets += n as u64;
            }
            manifest.push_str(&format!("{:x}  {PAYLOAD_PREFIX}{relative}\n", hasher.finalize()));
        }

        writer.start_file("manifest-sha512.txt", options)?;
        writer.write_all(manifest.as_bytes())?;

        writer.start_file("bag-info.txt", options)?;
        writer.write_all(render_bag_info(info, octets, files.len()).as_bytes())?;

        writer.finish()?.flush()?;
        tracing::debug!(
            ocrd_identifier = %info.ocrd_identifier,
            files = files.len(),
            dest = %dest.display(),
            "Packed workspace bag"
        );
        Ok(())
    }

    fn content_digest(&self, source: &Path) -> Result<String, PackageError> {
        let mut outer = Sha256::new();
        for (relative, path) in payload_files(source)? {
            let mut hasher = Sha512::new();
            std::io::copy(&mut File::open(&path)?, &mut hasher)?;
            outer.update(format!("{:x}  {relative}\n", hasher.finalize()).as_bytes());
        }
        Ok(format!("{:x}", outer.finalize()))
    }
}

// ---------------------------------------------------------------------------
// bag-info.txt / manifest helpers
// ---------------------------------------------------------------------------

fn parse_bag_info(text: &str) -> Result<BagInfo, PackageError> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        // Continuation lines start with whitespace.
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = fields.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(PackageError::Invalid(format!("Malformed bag-info line '{line}'")));
        };
        fields.push((key.trim().to_string(), value.trim().to_string()));
    }

    let mut ocrd_identifier = None;
    let mut bagit_profile_identifier = None;
    let mut ocrd_base_version_checksum = None;
    let mut ocrd_mets = None;
    let mut extra = BTreeMap::new();
    for (key, value) in fields {
        match key.as_str() {
            "Ocrd-Identifier" => ocrd_identifier = Some(value),
            "BagIt-Profile-Identifier" => bagit_profile_identifier = Some(value),
            "Ocrd-Base-Version-Checksum" => ocrd_base_version_checksum = Some(value),
            "Ocrd-Mets" => ocrd_mets = Some(value),
            k if DERIVED_KEYS.contains(&k) => {}
            _ => {
                extra.insert(key, value);
            }
        }
    }

    Ok(BagInfo {
        ocrd_identifier: ocrd_identifier
            .ok_or_else(|| PackageError::Invalid("bag-info.txt lacks Ocrd-Identifier".into()))?,
        bagit_profile_identifier: bagit_profile_identifier.ok_or_else(|| {
            PackageError::Invalid("bag-info.txt lacks BagIt-Profile-Identifier".into())
        })?,
        ocrd_base_version_checksum,
        ocrd_mets,
        extra,
    })
}

fn render_bag_info(info: &BagInfo, octets: u64, file_count: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!("Ocrd-Identifier: {}\n", info.ocrd_identifier));
    out.push_str(&format!(
        "BagIt-Profile-Identifier: {}\n",
        info.bagit_profile_identifier
    ));
    if let Some(checksum) = &info.ocrd_base_version_checksum {
        out.push_str(&format!("Ocrd-Base-Version-Checksum: {checksum}\n"));
    }
    if let Some(mets) = &info.ocrd_mets {
        out.push_str(&format!("Ocrd-Mets: {mets}\n"));
    }
    for (key, value) in &info.extra {
        out.push_str(&format!("{key}: {value}\n"));
    }
    out.push_str(&format!(
        "Bagging-Date: {}\n",
        chrono::Utc::now().format("%Y-%m-%d")
    ));
    out.push_str(&format!("Payload-Oxum: {octets}.{file_count}\n"));
    out
}

/// Map of payload-relative path to lowercase sha512 hex.
fn parse_manifest(text: &str) -> Result<BTreeMap<String, String>, PackageError> {
    let mut entries = BTreeMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let Some((digest, path)) = line.split_once(char::is_whitespace) else {
            return Err(PackageError::Invalid(format!("Malformed manifest line '{line}'")));
        };
        let path = path.trim();
        let Some(relative) = path.strip_prefix(PAYLOAD_PREFIX) else {
            return Err(PackageError::Invalid(format!("Manifest path '{path}' outside data/")));
        };
        entries.insert(relative.to_string(), digest.to_ascii_lowercase());
    }
    Ok(entries)
}

/// Every regular file below `root`, sorted by bag path. Top-level entries
/// starting with `.` (staging files) are skipped.
fn payload_files(root: &Path) -> Result<Vec<(String, PathBuf)>, PackageError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if dir == root && entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if let Ok(relative) = path.strip_prefix(root) {
                    files.push((to_bag_path(relative), path.clone()));
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

/// `/`-joined form of a relative path, as used inside bags.
fn to_bag_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;

    use super::*;

    /// Write a bag zip with the given payload files and bag-info body.
    pub(crate) fn write_bag(
        dest: &Path,
        bag_info: &str,
        payload: &[(&str, &str)],
        with_manifest: bool,
    ) {
        let mut writer = zip::ZipWriter::new(File::create(dest).unwrap());
        let options = SimpleFileOptions::default();
        writer.start_file("bagit.txt", options).unwrap();
        writer.write_all(BAGIT_TXT.as_bytes()).unwrap();
        writer.start_file("bag-info.txt", options).unwrap();
        writer.write_all(bag_info.as_bytes()).unwrap();
        let mut manifest = String::new();
        for (name, body) in payload {
            writer.start_file(format!("data/{name}"), options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
            manifest.push_str(&format!("{:x}  data/{name}\n", Sha512::digest(body.as_bytes())));
        }
        if with_manifest {
            writer.start_file("manifest-sha512.txt", options).unwrap();
            writer.write_all(manifest.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    pub(crate) const BAG_INFO: &str = "Ocrd-Identifier: bag-123\n\
        BagIt-Profile-Identifier: https://ocr-d.de/bagit-profile.json\n\
        Ocrd-Base-Version-Checksum: abc\n\
        Bagging-Date: 2020-01-01\n\
        Contact-Name: Jane\n";

    #[test]
    fn unpack_extracts_payload_and_reads_info() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("bag.zip");
        let dest = tmp.path().join("ws");
        std::fs::create_dir(&dest).unwrap();
        write_bag(
            &archive,
            BAG_INFO,
            &[("mets.xml", "<mets/>"), ("OCR-D-IMG/page1.tif", "img")],
            true,
        );

        let outcome = BagItZipPackager.unpack(&archive, &dest).expect("unpack");
        assert_eq!(outcome.info.ocrd_identifier, "bag-123");
        assert_eq!(outcome.info.ocrd_base_version_checksum.as_deref(), Some("abc"));
        assert_eq!(outcome.info.extra.get("Contact-Name").map(String::as_str), Some("Jane"));
        assert!(!outcome.info.extra.contains_key("Bagging-Date"));
        assert!(dest.join("mets.xml").is_file());
        assert!(dest.join("OCR-D-IMG").join("page1.tif").is_file());
        assert_eq!(outcome.content_digest, BagItZipPackager.content_digest(&dest).unwrap());
    }

    #[test]
    fn unpack_requires_identifier() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("bag.zip");
        write_bag(
            &archive,
            "BagIt-Profile-Identifier: x\n",
            &[("mets.xml", "<mets/>")],
            false,
        );
        let result = BagItZipPackager.unpack(&archive, tmp.path());
        assert_matches!(result, Err(PackageError::Invalid(msg)) if msg.contains("Ocrd-Identifier"));
    }

    #[test]
    fn unpack_requires_mets() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("bag.zip");
        let dest = tmp.path().join("ws");
        std::fs::create_dir(&dest).unwrap();
        write_bag(&archive, BAG_INFO, &[("other.xml", "<x/>")], false);
        let result = BagItZipPackager.unpack(&archive, &dest);
        assert_matches!(result, Err(PackageError::Invalid(msg)) if msg.contains("mets.xml"));
    }

    #[test]
    fn unpack_rejects_checksum_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("bag.zip");
        let dest = tmp.path().join("ws");
        std::fs::create_dir(&dest).unwrap();

        let mut writer = zip::ZipWriter::new(File::create(&archive).unwrap());
        let options = SimpleFileOptions::default();
        writer.start_file("bagit.txt", options).unwrap();
        writer.write_all(BAGIT_TXT.as_bytes()).unwrap();
        writer.start_file("bag-info.txt", options).unwrap();
        writer.write_all(BAG_INFO.as_bytes()).unwrap();
        writer.start_file("data/mets.xml", options).unwrap();
        writer.write_all(b"<mets/>").unwrap();
        writer.start_file("manifest-sha512.txt", options).unwrap();
        writer.write_all(b"deadbeef  data/mets.xml\n").unwrap();
        writer.finish().unwrap();

        let result = BagItZipPackager.unpack(&archive, &dest);
        assert_matches!(
            result,
            Err(PackageError::Invalid(msg)) if msg.contains("Checksum mismatch")
        );
    }

    #[test]
    fn garbage_archive_maps_to_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("bag.zip");
        std::fs::write(&archive, b"not a zip").unwrap();
        let err: CoreError = BagItZipPackager.unpack(&archive, tmp.path()).unwrap_err().into();
        assert_matches!(err, CoreError::Validation(_));
    }

    #[test]
    fn pack_produces_a_bag_that_unpacks_again() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src");
        std::fs::create_dir_all(source.join("OCR-D-IMG")).unwrap();
        std::fs::write(source.join("mets.xml"), "<mets/>").unwrap();
        std::fs::write(source.join("OCR-D-IMG/p1.tif"), "img").unwrap();
        std::fs::write(source.join(".payload.zip"), "staging").unwrap();

        let info = parse_bag_info(BAG_INFO).unwrap();
        let archive = tmp.path().join("out.zip");
        BagItZipPackager.pack(&source, &info, &archive).expect("pack");

        let dest = tmp.path().join("dest");
        std::fs::create_dir(&dest).unwrap();
        let outcome = BagItZipPackager.unpack(&archive, &dest).expect("unpack");
        assert_eq!(outcome.info, info);
        assert!(!dest.join(".payload.zip").exists());
        assert_eq!(
            outcome.content_digest,
            BagItZipPackager.content_digest(&source).unwrap()
        );
    }

    #[test]
    fn digest_tracks_content_changes() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("mets.xml"), "<mets/>").unwrap();
        let before = BagItZipPackager.content_digest(tmp.path()).unwrap();
        assert_eq!(before, BagItZipPackager.content_digest(tmp.path()).unwrap());

        std::fs::write(tmp.path().join("mets.xml"), "<mets changed/>").unwrap();
        let after = BagItZipPackager.content_digest(tmp.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn continuation_lines_are_folded() {
        let info = parse_bag_info(
            "Ocrd-Identifier: a\nBagIt-Profile-Identifier: b\nExternal-Description: one\n  two\n",
        )
        .unwrap();
        assert_eq!(
            info.extra.get("External-Description").map(String::as_str),
            Some("one two")
        );
    }
}
