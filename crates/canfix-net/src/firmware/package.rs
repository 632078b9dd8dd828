//! Firmware package loading
//!
//! A package is a tar archive (optionally gzip compressed) holding an
//! `index.json` and one payload file per entry:
//!
//! ```json
//! {"files": [
//!   {"type": "intelhex", "name": "main.hex", "block size": 1024,
//!    "block type": 1, "subsystem": 0, "offset": 0},
//!   {"type": "list", "block size": 8, "data": [1, 2, "0x03"]}
//! ]}
//! ```
//!
//! Everything is decoded up front so a malformed package fails before any
//! byte reaches the bus.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use canfix_defs::parse_int;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tar::Archive;
use tracing::debug;

use super::error::{PackageError, PackageResult};

const INDEX_NAME: &str = "index.json";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Payload encoding of a package file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    IntelHex,
    Hex,
    List,
    UuEncode,
    BinHex4,
    Binary,
}

impl FileFormat {
    pub fn from_tag(tag: &str) -> PackageResult<Self> {
        match tag {
            "intelhex" => Ok(Self::IntelHex),
            "hex" => Ok(Self::Hex),
            "list" => Ok(Self::List),
            "uuencode" => Ok(Self::UuEncode),
            "binhex4" => Ok(Self::BinHex4),
            "binary" => Ok(Self::Binary),
            other => Err(PackageError::UnknownFormat(other.to_string())),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::IntelHex => "intelhex",
            Self::Hex => "hex",
            Self::List => "list",
            Self::UuEncode => "uuencode",
            Self::BinHex4 => "binhex4",
            Self::Binary => "binary",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Index {
    files: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    #[serde(rename = "type")]
    format: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    offset: u32,
    #[serde(rename = "block type", default)]
    block_type: u8,
    #[serde(default)]
    subsystem: u8,
    #[serde(rename = "block size", default)]
    block_size: Option<u32>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

/// One decoded file of a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFile {
    pub format: FileFormat,
    pub name: String,
    /// Added to every block offset sent to the node
    pub offset: u32,
    pub block_type: u8,
    pub subsystem: u8,
    pub block_size: u32,
    pub data: Vec<u8>,
}

impl PackageFile {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// ceil(size / block size)
    pub fn block_count(&self) -> usize {
        let bs = self.block_size.max(1) as usize;
        self.data.len().div_ceil(bs)
    }

    /// log2 of the block size, sent in every block start
    pub fn block_log2(&self) -> PackageResult<u8> {
        if !self.block_size.is_power_of_two() {
            return Err(PackageError::BadBlockSize {
                name: self.name.clone(),
                size: self.block_size,
            });
        }
        Ok(self.block_size.trailing_zeros() as u8)
    }

    /// Node-side address one past the last byte
    pub fn end_address(&self) -> PackageResult<u32> {
        u32::try_from(self.data.len())
            .ok()
            .and_then(|size| self.offset.checked_add(size))
            .ok_or_else(|| PackageError::AddressOverflow {
                name: self.name.clone(),
                offset: self.offset,
                size: self.data.len(),
            })
    }

    /// Blocks with their node-side offsets; the last one may be short
    pub fn blocks(&self) -> PackageResult<impl Iterator<Item = (u32, &[u8])>> {
        // Every block offset lies below the end address
        self.end_address()?;
        let bs = self.block_size.max(1) as usize;
        let base = self.offset;
        Ok(self
            .data
            .chunks(bs)
            .enumerate()
            .map(move |(n, chunk)| (base + (n * bs) as u32, chunk)))
    }
}

/// Decoded firmware package
#[derive(Debug, Clone, Default)]
pub struct FirmwarePackage {
    path: Option<PathBuf>,
    files: Vec<PackageFile>,
}

impl FirmwarePackage {
    pub fn from_path(path: impl AsRef<Path>) -> PackageResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let mut package = Self::from_bytes(&bytes)?;
        package.path = Some(path.to_path_buf());
        Ok(package)
    }

    /// Load from archive bytes, gzip detected by magic number
    pub fn from_bytes(bytes: &[u8]) -> PackageResult<Self> {
        let members = if bytes.starts_with(&GZIP_MAGIC) {
            read_members(GzDecoder::new(bytes))?
        } else {
            read_members(bytes)?
        };
        let index = members.get(INDEX_NAME).ok_or(PackageError::MissingIndex)?;
        let index: Index = serde_json::from_slice(index)?;

        let files = index
            .files
            .into_iter()
            .enumerate()
            .map(|(n, entry)| decode_entry(n, entry, &members))
            .collect::<PackageResult<Vec<_>>>()?;

        debug!(files = files.len(), "Firmware package loaded");
        Ok(Self { path: None, files })
    }

    pub fn from_files(files: Vec<PackageFile>) -> Self {
        Self { path: None, files }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn files(&self) -> &[PackageFile] {
        &self.files
    }

    /// Sum of the decoded payload lengths
    pub fn total_size(&self) -> usize {
        self.files.iter().map(PackageFile::size).sum()
    }

    pub fn block_count(&self) -> usize {
        self.files.iter().map(PackageFile::block_count).sum()
    }

    /// Check every file's block size and address range
    pub fn validate(&self) -> PackageResult<()> {
        for file in &self.files {
            file.block_log2()?;
            file.end_address()?;
        }
        Ok(())
    }
}

fn read_members<R: Read>(reader: R) -> PackageResult<HashMap<String, Vec<u8>>> {
    let mut archive = Archive::new(reader);
    let mut members = HashMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        members.insert(name, data);
    }
    Ok(members)
}

fn decode_entry(
    n: usize,
    entry: IndexEntry,
    members: &HashMap<String, Vec<u8>>,
) -> PackageResult<PackageFile> {
    let format = FileFormat::from_tag(&entry.format)?;
    let name = entry.name.clone().unwrap_or_else(|| format!("file {}", n));
    let block_size = entry.block_size.ok_or_else(|| PackageError::MissingField {
        name: name.clone(),
        field: "block size",
    })?;

    let payload = || -> PackageResult<&Vec<u8>> {
        let file = entry.name.as_deref().ok_or_else(|| PackageError::MissingField {
            name: name.clone(),
            field: "name",
        })?;
        members
            .get(file.trim_start_matches("./"))
            .ok_or_else(|| PackageError::MissingFile(file.to_string()))
    };

    let data = match format {
        FileFormat::IntelHex => decode_intelhex(&name, payload()?)?,
        FileFormat::Hex => decode_hex(&name, payload()?)?,
        FileFormat::List => decode_list(&name, &entry.data)?,
        FileFormat::UuEncode | FileFormat::BinHex4 | FileFormat::Binary => {
            return Err(PackageError::NotImplemented(format.tag().to_string()))
        }
    };

    Ok(PackageFile {
        format,
        name,
        offset: entry.offset,
        block_type: entry.block_type,
        subsystem: entry.subsystem,
        block_size,
        data,
    })
}

/// Intel HEX into a contiguous image starting at the lowest address
///
/// Gaps are filled with 0xFF (erased flash).
fn decode_intelhex(name: &str, payload: &[u8]) -> PackageResult<Vec<u8>> {
    let text = std::str::from_utf8(payload).map_err(|e| PackageError::Hex {
        name: name.to_string(),
        reason: e.to_string(),
    })?;

    let mut base = 0u32;
    let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();
    for record in ihex::Reader::new(text) {
        let record = record.map_err(|e| PackageError::Hex {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        match record {
            ihex::Record::Data { offset, value } => chunks.push((base + offset as u32, value)),
            ihex::Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
            ihex::Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
            ihex::Record::EndOfFile => break,
            _ => {}
        }
    }

    let Some(start) = chunks.iter().map(|(addr, _)| *addr).min() else {
        return Ok(Vec::new());
    };
    let end = chunks
        .iter()
        .map(|(addr, data)| *addr as usize + data.len())
        .max()
        .unwrap_or(start as usize);

    let mut image = vec![0xFF; end - start as usize];
    for (addr, data) in chunks {
        let at = (addr - start) as usize;
        image[at..at + data.len()].copy_from_slice(&data);
    }
    Ok(image)
}

/// ASCII hex digits, whitespace ignored
fn decode_hex(name: &str, payload: &[u8]) -> PackageResult<Vec<u8>> {
    let digits: Vec<u8> = payload
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    hex::decode(digits).map_err(|e| PackageError::Hex {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Inline byte list; numbers or numeric strings ("0x1F")
fn decode_list(name: &str, data: &[serde_json::Value]) -> PackageResult<Vec<u8>> {
    data.iter()
        .map(|v| {
            let n = match v {
                serde_json::Value::Number(n) => n.as_i64(),
                serde_json::Value::String(s) => parse_int(s).ok(),
                _ => None,
            };
            n.and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| PackageError::InvalidData {
                    name: name.to_string(),
                    reason: format!("{} is not a byte", v),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    const HEX: &str = ":0400000001020304F2\n\
                       :02000800AABB91\n\
                       :00000001FF\n";

    #[test]
    fn test_intelhex_and_list() {
        let index = br#"{"files": [
            {"type": "intelhex", "name": "app.hex", "block size": 8, "block type": 1},
            {"type": "list", "block size": 4, "subsystem": 2, "data": [1, "0x02", 255]}
        ]}"#;
        let bytes = archive(&[("index.json", index), ("app.hex", HEX.as_bytes())]);
        let pkg = FirmwarePackage::from_bytes(&bytes).unwrap();

        let files = pkg.files();
        assert_eq!(files.len(), 2);
        assert_eq!(
            files[0].data,
            vec![1, 2, 3, 4, 0xFF, 0xFF, 0xFF, 0xFF, 0xAA, 0xBB]
        );
        assert_eq!(files[0].block_type, 1);
        assert_eq!(files[0].block_count(), 2);
        assert_eq!(files[1].data, vec![1, 2, 255]);
        assert_eq!(files[1].subsystem, 2);
        assert_eq!(pkg.total_size(), files[0].size() + files[1].size());
        assert!(pkg.validate().is_ok());
    }

    #[test]
    fn test_gzip_and_hex_text() {
        let index = br#"{"files": [{"type": "hex", "name": "./fw.txt", "block size": 2}]}"#;
        let tar = archive(&[("./index.json", index), ("fw.txt", b"DE AD\nbe ef\n")]);
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar).unwrap();
        let pkg = FirmwarePackage::from_bytes(&gz.finish().unwrap()).unwrap();
        assert_eq!(pkg.files()[0].data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_unimplemented_and_unknown_formats() {
        for (tag, expect_nyi) in [("uuencode", true), ("binhex4", true), ("binary", true), ("srec", false)] {
            let index = format!(r#"{{"files": [{{"type": "{}", "name": "x", "block size": 8}}]}}"#, tag);
            let bytes = archive(&[("index.json", index.as_bytes()), ("x", b"")]);
            let err = FirmwarePackage::from_bytes(&bytes).unwrap_err();
            if expect_nyi {
                assert_eq!(err.to_string(), format!("{} not yet implemented", tag));
            } else {
                assert!(matches!(err, PackageError::UnknownFormat(_)));
            }
        }
    }

    #[test]
    fn test_missing_block_size_and_index() {
        let index = br#"{"files": [{"type": "list", "data": [1]}]}"#;
        let err = FirmwarePackage::from_bytes(&archive(&[("index.json", index)])).unwrap_err();
        assert!(matches!(err, PackageError::MissingField { field: "block size", .. }));

        let err = FirmwarePackage::from_bytes(&archive(&[("other", b"x")])).unwrap_err();
        assert!(matches!(err, PackageError::MissingIndex));
    }

    #[test]
    fn test_block_size_must_be_power_of_two() {
        let file = PackageFile {
            format: FileFormat::List,
            name: "odd".into(),
            offset: 0,
            block_type: 0,
            subsystem: 0,
            block_size: 12,
            data: vec![0; 30],
        };
        assert!(matches!(file.block_log2(), Err(PackageError::BadBlockSize { size: 12, .. })));
        let pkg = FirmwarePackage::from_files(vec![file]);
        assert!(pkg.validate().is_err());
    }

    #[test]
    fn test_blocks_carry_offsets() {
        let file = PackageFile {
            format: FileFormat::List,
            name: "f".into(),
            offset: 0x100,
            block_type: 0,
            subsystem: 0,
            block_size: 4,
            data: (0..10).collect(),
        };
        let blocks: Vec<(u32, usize)> = file.blocks().unwrap().map(|(o, b)| (o, b.len())).collect();
        assert_eq!(blocks, vec![(0x100, 4), (0x104, 4), (0x108, 2)]);
        assert_eq!(file.block_log2().unwrap(), 2);
        assert_eq!(file.end_address().unwrap(), 0x10A);
    }

    #[test]
    fn test_offset_past_address_space_is_rejected() {
        let file = PackageFile {
            format: FileFormat::List,
            name: "high".into(),
            offset: 0xFFFF_FFF8,
            block_type: 0,
            subsystem: 0,
            block_size: 8,
            data: vec![0; 16],
        };
        assert!(matches!(
            file.blocks().err(),
            Some(PackageError::AddressOverflow { offset: 0xFFFF_FFF8, size: 16, .. })
        ));

        let err = FirmwarePackage::from_files(vec![file]).validate().unwrap_err();
        assert!(err.to_string().contains("0xFFFFFFF8"), "{}", err);

        // Ending exactly at the top of the address space is fine
        let file = PackageFile {
            format: FileFormat::List,
            name: "top".into(),
            offset: 0xFFFF_FFF0,
            block_type: 0,
            subsystem: 0,
            block_size: 8,
            data: vec![0; 15],
        };
        let offsets: Vec<u32> = file.blocks().unwrap().map(|(o, _)| o).collect();
        assert_eq!(offsets, vec![0xFFFF_FFF0, 0xFFFF_FFF8]);
    }
}
