//! Archive decompression and unpacking
//!
//! Supported: gzip- or zstd-compressed tar and plain tar. The format is
//! detected from magic bytes, never from the URL.

use crate::utils::error::FetchError;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";

/// Container format of a downloaded archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarZst,
    Tar,
}

/// Identify the archive format from its leading bytes
pub fn detect_format(header: &[u8]) -> Option<ArchiveFormat> {
    if header.starts_with(&GZIP_MAGIC) {
        Some(ArchiveFormat::TarGz)
    } else if header.starts_with(&ZSTD_MAGIC) {
        Some(ArchiveFormat::TarZst)
    } else if header.len() >= USTAR_OFFSET + USTAR_MAGIC.len()
        && &header[USTAR_OFFSET..USTAR_OFFSET + USTAR_MAGIC.len()] == USTAR_MAGIC
    {
        Some(ArchiveFormat::Tar)
    } else {
        None
    }
}

/// Decompress and unpack `archive` into `destination`
///
/// Blocking; call from `spawn_blocking`.
pub fn unpack(archive: &Path, destination: &Path) -> Result<ArchiveFormat, FetchError> {
    let mut file = File::open(archive).map_err(|e| extraction(archive, e))?;

    let mut header = [0u8; 512];
    let read = read_header(&mut file, &mut header).map_err(|e| extraction(archive, e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| extraction(archive, e))?;

    let format = detect_format(&header[..read]).ok_or_else(|| {
        FetchError::ExtractionFailure(format!(
            "{}: unrecognized archive format",
            archive.display()
        ))
    })?;

    tracing::info!(
        archive = %archive.display(),
        destination = %destination.display(),
        format = ?format,
        "Extracting archive"
    );

    let reader = BufReader::new(file);
    let result = match format {
        ArchiveFormat::TarGz => tar::Archive::new(GzDecoder::new(reader)).unpack(destination),
        ArchiveFormat::TarZst => {
            let decoder = zstd::stream::read::Decoder::with_buffer(reader)
                .map_err(|e| extraction(archive, e))?;
            tar::Archive::new(decoder).unpack(destination)
        }
        ArchiveFormat::Tar => tar::Archive::new(reader).unpack(destination),
    };

    result.map_err(|e| extraction(archive, e))?;
    Ok(format)
}

fn read_header(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn extraction(archive: &Path, err: io::Error) -> FetchError {
    FetchError::ExtractionFailure(format!("{}: {err}", archive.display()))
}
