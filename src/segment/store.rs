//! Data-directory layout and the `index.dat` segment list file
//!
//! `index.dat` is the authoritative list of live file segments:
//!
//! ```text
//! magic "FPIX"    4B
//! format          u32 LE
//! count           u32 LE
//! count x { version u64 LE, included_merges u64 LE }   (segment order)
//! crc32 of all preceding bytes    u32 LE
//! ```
//!
//! It is replaced atomically: write `index.dat.tmp`, fsync, rename, fsync the
//! directory. A reader therefore always sees either the old or the new list,
//! never a partial one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use crate::error::{Error, Result};

use super::types::SegmentId;

/// Name of the segment list file inside the data directory
pub const INDEX_FILE: &str = "index.dat";

const INDEX_MAGIC: &[u8; 4] = b"FPIX";
const INDEX_FORMAT: u32 = 1;

/// Path of a segment's data file inside `dir`
pub fn segment_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("{}.dat", id.file_stem()))
}

/// Whether `dir` holds an index (i.e. contains `index.dat`)
pub fn index_exists(dir: &Path) -> bool {
    dir.join(INDEX_FILE).is_file()
}

/// fsync a directory so a prior rename inside it is durable
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|f| f.sync_all())
        .map_err(Error::from_io)
}

/// Atomically replace `index.dat` with the given segment list.
pub fn write_index_file(dir: &Path, ids: &[SegmentId]) -> Result<()> {
    let mut buf = Vec::with_capacity(12 + ids.len() * 16 + 4);
    buf.extend_from_slice(INDEX_MAGIC);
    buf.extend_from_slice(&INDEX_FORMAT.to_le_bytes());
    buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    for id in ids {
        buf.extend_from_slice(&id.version.to_le_bytes());
        buf.extend_from_slice(&id.included_merges.to_le_bytes());
    }
    let mut hasher = Hasher::new();
    hasher.update(&buf);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());

    let path = dir.join(INDEX_FILE);
    let tmp_path = dir.join("index.dat.tmp");
    {
        let mut file = File::create(&tmp_path).map_err(Error::from_io)?;
        file.write_all(&buf).map_err(Error::from_io)?;
        file.sync_all().map_err(Error::from_io)?;
    }
    fs::rename(&tmp_path, &path).map_err(Error::from_io)?;
    sync_dir(dir)
}

/// Load and validate `index.dat`, returning the segment list in order.
pub fn read_index_file(dir: &Path) -> Result<Vec<SegmentId>> {
    let path = dir.join(INDEX_FILE);
    let data = fs::read(&path).map_err(Error::from_io)?;

    if data.len() < 16 {
        return Err(Error::corruption(&path, "file too small"));
    }
    if &data[0..4] != INDEX_MAGIC {
        return Err(Error::corruption(&path, "bad magic"));
    }
    let format = u32::from_le_bytes(data[4..8].try_into().unwrap());
    if format > INDEX_FORMAT {
        return Err(Error::corruption(
            &path,
            format!("format version {} too new", format),
        ));
    }

    let body_len = data.len() - 4;
    let stored = u32::from_le_bytes(data[body_len..].try_into().unwrap());
    let mut hasher = Hasher::new();
    hasher.update(&data[..body_len]);
    if hasher.finalize() != stored {
        return Err(Error::corruption(&path, "checksum mismatch"));
    }

    let count = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
    if body_len != 12 + count * 16 {
        return Err(Error::corruption(&path, "truncated segment list"));
    }

    let mut ids = Vec::with_capacity(count);
    let mut pos = 12;
    let mut prev_version = 0u64;
    for _ in 0..count {
        let version = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
        let included_merges = u64::from_le_bytes(data[pos + 8..pos + 16].try_into().unwrap());
        pos += 16;
        if version <= prev_version {
            return Err(Error::corruption(&path, "segment versions not increasing"));
        }
        prev_version = version;
        ids.push(SegmentId::new(version, included_merges));
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let ids = vec![
            SegmentId::new(1, 3),
            SegmentId::new(5, 0),
            SegmentId::new(6, 1),
        ];

        write_index_file(tmp.path(), &ids).unwrap();
        assert!(index_exists(tmp.path()));
        assert_eq!(read_index_file(tmp.path()).unwrap(), ids);
    }

    #[test]
    fn test_empty_list() {
        let tmp = tempfile::tempdir().unwrap();
        write_index_file(tmp.path(), &[]).unwrap();
        assert_eq!(read_index_file(tmp.path()).unwrap(), vec![]);
    }

    #[test]
    fn test_atomic_replace() {
        let tmp = tempfile::tempdir().unwrap();
        write_index_file(tmp.path(), &[SegmentId::new(1, 0)]).unwrap();
        write_index_file(tmp.path(), &[SegmentId::new(1, 1)]).unwrap();

        assert_eq!(
            read_index_file(tmp.path()).unwrap(),
            vec![SegmentId::new(1, 1)]
        );
        assert!(!tmp.path().join("index.dat.tmp").exists());
    }

    #[test]
    fn test_corruption_detected() {
        let tmp = tempfile::tempdir().unwrap();
        write_index_file(tmp.path(), &[SegmentId::new(1, 0)]).unwrap();

        let path = tmp.path().join(INDEX_FILE);
        let mut data = fs::read(&path).unwrap();
        data[13] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        assert!(matches!(
            read_index_file(tmp.path()),
            Err(Error::Corruption { .. })
        ));
    }

    #[test]
    fn test_non_increasing_versions_rejected() {
        let tmp = tempfile::tempdir().unwrap();

        // Hand-build a file with out-of-order versions and a valid CRC
        let ids = [SegmentId::new(5, 0), SegmentId::new(2, 0)];
        let mut buf = Vec::new();
        buf.extend_from_slice(INDEX_MAGIC);
        buf.extend_from_slice(&INDEX_FORMAT.to_le_bytes());
        buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
        for id in &ids {
            buf.extend_from_slice(&id.version.to_le_bytes());
            buf.extend_from_slice(&id.included_merges.to_le_bytes());
        }
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        fs::write(tmp.path().join(INDEX_FILE), &buf).unwrap();

        assert!(matches!(
            read_index_file(tmp.path()),
            Err(Error::Corruption { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!index_exists(tmp.path()));
        assert!(matches!(read_index_file(tmp.path()), Err(Error::Io(_))));
    }

    #[test]
    fn test_segment_path() {
        let path = segment_path(Path::new("/data"), SegmentId::new(2, 1));
        assert_eq!(
            path,
            Path::new("/data/segment_0000000002_0000000001.dat")
        );
    }
}
