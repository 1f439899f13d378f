use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// ASCII "MOOO" reversed, as the COW container writes it.
const COW_MAGIC: [u8; 4] = *b"OOOM";
/// Total COW header size including the 8-byte prefix.
const COW_HEADER_SIZE: u64 = 1024;
const QCOW_MAGIC: [u8; 4] = [b'Q', b'F', b'I', 0xfb];

/// Extract the backing-file path referenced by the image header at the start
/// of `reader`.
///
/// Both formats open with the same big-endian prefix: 4 magic bytes followed
/// by a u32 version. COW images carry the backing path inside a fixed
/// 1024-byte header, NUL-padded; QCOW (version 1 or 2) stores a u64 offset
/// and u32 size pointing at the raw path bytes. Byte order and header sizes
/// are load-bearing: a drift here corrupts backing resolution for an entire
/// disk chain.
pub fn read_backing_file<R: Read + Seek>(reader: &mut R, path: &Path) -> Result<String> {
    let io_err = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(io_err)?;
    let version = reader.read_u32::<BigEndian>().map_err(io_err)?;

    if magic == COW_MAGIC {
        return read_cow_backing_file(reader, path);
    }
    if magic == QCOW_MAGIC && (version == 1 || version == 2) {
        return read_qcow_backing_file(reader, path);
    }
    Err(Error::UnknownImageFormat {
        path: path.to_path_buf(),
    })
}

fn read_cow_backing_file<R: Read>(reader: &mut R, path: &Path) -> Result<String> {
    // The 8-byte prefix is already consumed; the rest of the fixed-size
    // header is the NUL-padded backing path.
    let mut data = Vec::new();
    reader
        .take(COW_HEADER_SIZE - 8)
        .read_to_end(&mut data)
        .map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
    while data.last() == Some(&0) {
        data.pop();
    }
    Ok(String::from_utf8_lossy(&data).into_owned())
}

fn read_qcow_backing_file<R: Read + Seek>(reader: &mut R, path: &Path) -> Result<String> {
    let io_err = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };

    let offset = reader.read_u64::<BigEndian>().map_err(io_err)?;
    let size = reader.read_u32::<BigEndian>().map_err(io_err)?;
    if size == 0 {
        return Ok(String::new());
    }

    reader.seek(SeekFrom::Start(offset)).map_err(io_err)?;
    let mut data = vec![0u8; size as usize];
    reader.read_exact(&mut data).map_err(io_err)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Open `path` and extract its backing-file reference.
pub fn backing_file_of(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_backing_file(&mut file, path)
}

/// Lazily resolve the backing file of each image in `paths`.
///
/// Entries with unrecognized headers are skipped so one stray file does not
/// fail the whole batch; I/O failures are still surfaced per entry. The
/// returned iterator is finite and consumed once.
pub fn backing_files_for<I>(paths: I) -> impl Iterator<Item = Result<String>>
where
    I: IntoIterator<Item = PathBuf>,
{
    paths
        .into_iter()
        .filter_map(|path| match backing_file_of(&path) {
            Ok(backing) => Some(Ok(backing)),
            Err(Error::UnknownImageFormat { .. }) => None,
            Err(err) => Some(Err(err)),
        })
}

/// Human-readable size used in image diagnostics.
pub fn fmtsize(size: u64) -> String {
    if size < 10240 {
        return format!("{size} B");
    }
    let mut value = size as f64 / 1024.0;
    for unit in ["KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} TB")
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::{Cursor, Write};
    use tempfile::tempdir;

    fn cow_image(backing: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"OOOM");
        data.write_u32::<BigEndian>(2).unwrap();
        data.extend_from_slice(backing);
        data.resize(1024, 0);
        data
    }

    fn qcow_image(version: u32, offset: u64, backing: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&QCOW_MAGIC);
        data.write_u32::<BigEndian>(version).unwrap();
        data.write_u64::<BigEndian>(offset).unwrap();
        data.write_u32::<BigEndian>(backing.len() as u32).unwrap();
        if !backing.is_empty() {
            data.resize(offset as usize, 0);
            data.extend_from_slice(backing);
        }
        data
    }

    #[test]
    fn cow_header_strips_trailing_nuls() {
        let image = cow_image(b"/images/base.cow");
        let mut cursor = Cursor::new(image);
        let backing = read_backing_file(&mut cursor, Path::new("test.cow")).unwrap();
        assert_eq!(backing, "/images/base.cow");
    }

    #[test]
    fn cow_header_with_no_backing_is_empty() {
        let image = cow_image(b"");
        let mut cursor = Cursor::new(image);
        let backing = read_backing_file(&mut cursor, Path::new("test.cow")).unwrap();
        assert_eq!(backing, "");
    }

    #[test]
    fn qcow_zero_size_means_no_backing_file() {
        let image = qcow_image(2, 20, b"");
        let mut cursor = Cursor::new(image);
        let backing = read_backing_file(&mut cursor, Path::new("test.qcow")).unwrap();
        assert_eq!(backing, "");
    }

    #[test]
    fn qcow_backing_is_read_exactly_from_offset() {
        let image = qcow_image(2, 20, b"/images/base.qcow2");
        let mut cursor = Cursor::new(image);
        let backing = read_backing_file(&mut cursor, Path::new("test.qcow")).unwrap();
        assert_eq!(backing, "/images/base.qcow2");
    }

    #[test]
    fn qcow_version_one_is_accepted() {
        let image = qcow_image(1, 32, b"base");
        let mut cursor = Cursor::new(image);
        assert_eq!(
            read_backing_file(&mut cursor, Path::new("v1.qcow")).unwrap(),
            "base"
        );
    }

    #[test]
    fn qcow_version_three_is_rejected() {
        let image = qcow_image(3, 20, b"");
        let mut cursor = Cursor::new(image);
        assert!(matches!(
            read_backing_file(&mut cursor, Path::new("v3.qcow")),
            Err(Error::UnknownImageFormat { .. })
        ));
    }

    #[test]
    fn unknown_magic_is_a_format_error() {
        let mut cursor = Cursor::new(b"RAW\x00\x00\x00\x00\x02garbage".to_vec());
        assert!(matches!(
            read_backing_file(&mut cursor, Path::new("disk.raw")),
            Err(Error::UnknownImageFormat { .. })
        ));
    }

    #[test]
    fn chain_skips_unrecognized_entries() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.cow");
        let bad = dir.path().join("bad.img");
        fs::write(&good, cow_image(b"/images/base.cow")).unwrap();
        let mut file = fs::File::create(&bad).unwrap();
        file.write_all(b"not an image at all").unwrap();

        let chain: Vec<String> = backing_files_for(vec![bad, good])
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chain, vec!["/images/base.cow".to_string()]);
    }

    #[test]
    fn chain_surfaces_io_errors_per_entry() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.qcow2");
        let mut chain = backing_files_for(vec![missing]);
        assert!(matches!(chain.next(), Some(Err(Error::Io { .. }))));
        assert!(chain.next().is_none());
    }

    #[test]
    fn fmtsize_formats_expected_units() {
        assert_eq!(fmtsize(512), "512 B");
        assert_eq!(fmtsize(10240), "10.0 KB");
        assert_eq!(fmtsize(1024 * 1024), "1.0 MB");
        assert_eq!(fmtsize(3 * 1024 * 1024 * 1024), "3.0 GB");
    }
}
