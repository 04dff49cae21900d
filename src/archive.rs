use std::fs;
use std::io::{self, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use flate2::Compression;
use flate2::GzBuilder;
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use tracing::{debug, info};
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

use crate::config::DEFAULT_CRC_CHECK_THRESHOLD_BYTES;
use crate::error::RetrievalError;
use crate::fs_util::{self, WildcardPattern};

pub const GZIP_EXTENSION: &str = ".gz";
pub const ZIP_EXTENSION: &str = ".zip";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedEntry {
    pub name: String,
    pub path: Utf8PathBuf,
}

/// Names and paths actually written by an extraction; these can differ in case
/// or base name from what the caller asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractListing {
    pub entries: Vec<ExtractedEntry>,
}

impl ExtractListing {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.entries.iter().map(|entry| entry.path.as_path())
    }

    pub fn find_file_name(&self, name: &str) -> Option<&ExtractedEntry> {
        self.entries.iter().find(|entry| {
            entry
                .path
                .file_name()
                .map(|file| file.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })
    }

    pub fn find_by_relative(&self, relative: &str) -> Option<&ExtractedEntry> {
        let wanted = normalize_entry_name(relative);
        self.entries
            .iter()
            .find(|entry| normalize_entry_name(&entry.name) == wanted)
            .or_else(|| {
                let file_name = wanted.rsplit('/').next().unwrap_or(&wanted).to_string();
                self.find_file_name(&file_name)
            })
    }
}

fn normalize_entry_name(name: &str) -> String {
    name.replace('\\', "/").trim_matches('/').to_ascii_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZipVerification {
    pub entries: usize,
    pub full_check: bool,
}

#[derive(Debug, Clone)]
pub struct ArchiveCodec {
    crc_check_threshold_bytes: u64,
    compression: Compression,
}

impl Default for ArchiveCodec {
    fn default() -> Self {
        Self::new(DEFAULT_CRC_CHECK_THRESHOLD_BYTES)
    }
}

impl ArchiveCodec {
    pub fn new(crc_check_threshold_bytes: u64) -> Self {
        Self {
            crc_check_threshold_bytes,
            compression: Compression::default(),
        }
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression = Compression::new(level.min(9));
        self
    }

    pub fn crc_check_threshold_bytes(&self) -> u64 {
        self.crc_check_threshold_bytes
    }

    pub fn unzip(
        &self,
        zip_path: &Utf8Path,
        target_dir: &Utf8Path,
        filter: Option<&WildcardPattern>,
    ) -> Result<ExtractListing, RetrievalError> {
        let mut archive = open_zip(zip_path)?;
        fs::create_dir_all(target_dir.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;

        let mut listing = ExtractListing::default();
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|err| RetrievalError::corrupt_archive(zip_path, err))?;
            let relative = entry
                .enclosed_name()
                .ok_or_else(|| {
                    RetrievalError::corrupt_archive(zip_path, "zip entry path traversal detected")
                })?;
            let entry_path = fs_util::utf8_path(target_dir.as_std_path().join(relative))?;

            if entry.is_dir() {
                fs::create_dir_all(entry_path.as_std_path())
                    .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
                continue;
            }

            let name = entry.name().to_string();
            if let Some(filter) = filter {
                let file_name = name.rsplit(['/', '\\']).next().unwrap_or(&name);
                if !filter.is_match(file_name) {
                    continue;
                }
            }

            if let Some(parent) = entry_path.parent() {
                fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
            }
            let mut outfile = fs::File::create(entry_path.as_std_path())
                .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
            io::copy(&mut entry, &mut outfile)
                .map_err(|err| RetrievalError::corrupt_archive(zip_path, format!("{name}: {err}")))?;
            drop(outfile);

            if let Some(modified) = entry.last_modified().and_then(zip_time_to_utc) {
                fs_util::set_modified_utc(&entry_path, modified)?;
            }
            listing.entries.push(ExtractedEntry {
                name,
                path: entry_path,
            });
        }

        debug!(archive = %zip_path, files = listing.len(), "unzipped");
        Ok(listing)
    }

    /// Decompresses `<name>.gz` to `<target_dir>/<name>`.
    pub fn gunzip(
        &self,
        gz_path: &Utf8Path,
        target_dir: &Utf8Path,
    ) -> Result<ExtractListing, RetrievalError> {
        let output_name = gunzipped_name(gz_path)?;
        fs::create_dir_all(target_dir.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        let output_path = target_dir.join(&output_name);

        let input = fs::File::open(gz_path.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(format!("open {gz_path}: {err}")))?;
        let mut decoder = MultiGzDecoder::new(io::BufReader::new(input));
        let temp = tempfile::Builder::new()
            .prefix(".gunzip")
            .tempfile_in(target_dir.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        {
            let mut writer = io::BufWriter::new(temp.as_file());
            io::copy(&mut decoder, &mut writer)
                .map_err(|err| RetrievalError::corrupt_archive(gz_path, err))?;
            writer
                .flush()
                .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        }
        let header_time = decoder
            .header()
            .map(|header| header.mtime())
            .filter(|mtime| *mtime > 0)
            .and_then(|mtime| DateTime::<Utc>::from_timestamp(i64::from(mtime), 0));
        temp.persist(output_path.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;

        let container_time = fs_util::modified_utc(gz_path)?;
        let restored = match header_time {
            Some(stored) if stored >= container_time => stored,
            _ => container_time,
        };
        fs_util::set_modified_utc(&output_path, restored)?;

        debug!(archive = %gz_path, output = %output_path, "gunzipped");
        Ok(ExtractListing {
            entries: vec![ExtractedEntry {
                name: output_name,
                path: output_path,
            }],
        })
    }

    pub fn zip_file(
        &self,
        source: &Utf8Path,
        zip_path: &Utf8Path,
    ) -> Result<(), RetrievalError> {
        let name = fs_util::file_name(source)?.to_string();
        self.write_zip(zip_path, |writer| self.add_file(writer, source, &name))?;
        info!(source = %source, archive = %zip_path, "zipped file");
        Ok(())
    }

    /// Zips every file under `source_dir`, storing paths relative to it.
    pub fn zip_directory(
        &self,
        source_dir: &Utf8Path,
        zip_path: &Utf8Path,
    ) -> Result<usize, RetrievalError> {
        let mut count = 0;
        self.write_zip(zip_path, |writer| {
            for path in fs_util::walk_dir(source_dir.as_std_path())? {
                let path = fs_util::utf8_path(path)?;
                if path == zip_path {
                    continue;
                }
                let relative = path
                    .strip_prefix(source_dir)
                    .map_err(|_| RetrievalError::InvalidPath(path.to_string()))?
                    .as_str()
                    .replace('\\', "/");
                if path.as_std_path().is_dir() {
                    writer
                        .add_directory(relative, self.entry_options(&path)?)
                        .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
                } else {
                    self.add_file(writer, &path, &relative)?;
                    count += 1;
                }
            }
            Ok(())
        })?;
        info!(source = %source_dir, archive = %zip_path, files = count, "zipped directory");
        Ok(count)
    }

    /// Writes `<source>.gz` (or `gz_path`), keeping the original name and
    /// modification time in the gzip header.
    pub fn gzip_file(
        &self,
        source: &Utf8Path,
        gz_path: Option<&Utf8Path>,
    ) -> Result<Utf8PathBuf, RetrievalError> {
        let gz_path = gz_path
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from(format!("{source}{GZIP_EXTENSION}")));
        let name = fs_util::file_name(source)?.to_string();
        let modified = fs_util::modified_utc(source)?;
        let header_mtime = u32::try_from(modified.timestamp()).unwrap_or(0);

        let mut input = fs::File::open(source.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(format!("open {source}: {err}")))?;
        let output = fs::File::create(gz_path.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(format!("create {gz_path}: {err}")))?;
        let mut encoder = GzBuilder::new()
            .filename(name.as_bytes())
            .mtime(header_mtime)
            .write(io::BufWriter::new(output), self.compression);
        io::copy(&mut input, &mut encoder)
            .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        let mut writer = encoder
            .finish()
            .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        writer
            .flush()
            .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        drop(writer);

        fs_util::set_modified_utc(&gz_path, modified)?;
        info!(source = %source, archive = %gz_path, "gzipped file");
        Ok(gz_path)
    }

    /// Structural check always; per-entry CRC32 and byte counts only when the
    /// archive is smaller than the configured threshold.
    pub fn verify_zip(&self, zip_path: &Utf8Path) -> Result<ZipVerification, RetrievalError> {
        let archive_size = fs::metadata(zip_path.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(format!("stat {zip_path}: {err}")))?
            .len();
        let mut archive = open_zip(zip_path)?;
        let full_check = archive_size < self.crc_check_threshold_bytes;

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|err| RetrievalError::corrupt_archive(zip_path, err))?;
            if entry.enclosed_name().is_none() {
                return Err(RetrievalError::corrupt_archive(
                    zip_path,
                    format!("unsafe entry name {}", entry.name()),
                ));
            }
            if !full_check || entry.is_dir() {
                continue;
            }

            let name = entry.name().to_string();
            let expected_crc = entry.crc32();
            let expected_size = entry.size();
            let (crc, size) = crc_and_size(&mut entry)
                .map_err(|err| RetrievalError::corrupt_archive(zip_path, format!("{name}: {err}")))?;
            if crc != expected_crc {
                return Err(RetrievalError::corrupt_archive(
                    zip_path,
                    format!("{name}: CRC32 {crc:08x} does not match stored {expected_crc:08x}"),
                ));
            }
            if size != expected_size {
                return Err(RetrievalError::corrupt_archive(
                    zip_path,
                    format!("{name}: {size} bytes read, {expected_size} expected"),
                ));
            }
        }

        if !full_check {
            debug!(archive = %zip_path, size = archive_size, "skipped CRC check for large archive");
        }
        Ok(ZipVerification {
            entries: archive.len(),
            full_check,
        })
    }

    pub fn verify_gzip(&self, gz_path: &Utf8Path) -> Result<u64, RetrievalError> {
        let input = fs::File::open(gz_path.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(format!("open {gz_path}: {err}")))?;
        let mut decoder = MultiGzDecoder::new(io::BufReader::new(input));
        io::copy(&mut decoder, &mut io::sink())
            .map_err(|err| RetrievalError::corrupt_archive(gz_path, err))
    }

    fn write_zip<F>(&self, zip_path: &Utf8Path, fill: F) -> Result<(), RetrievalError>
    where
        F: FnOnce(&mut zip::ZipWriter<fs::File>) -> Result<(), RetrievalError>,
    {
        if let Some(parent) = zip_path.parent().filter(|parent| !parent.as_str().is_empty()) {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        }
        let file = fs::File::create(zip_path.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(format!("create {zip_path}: {err}")))?;
        let mut writer = zip::ZipWriter::new(file);
        fill(&mut writer)?;
        writer
            .finish()
            .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn add_file(
        &self,
        writer: &mut zip::ZipWriter<fs::File>,
        source: &Utf8Path,
        name: &str,
    ) -> Result<(), RetrievalError> {
        writer
            .start_file(name, self.entry_options(source)?)
            .map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        let mut input = fs::File::open(source.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(format!("open {source}: {err}")))?;
        io::copy(&mut input, writer).map_err(|err| RetrievalError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn entry_options(&self, source: &Utf8Path) -> Result<SimpleFileOptions, RetrievalError> {
        let size = fs::metadata(source.as_std_path())
            .map_err(|err| RetrievalError::Filesystem(err.to_string()))?
            .len();
        let mut options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .large_file(size >= u64::from(u32::MAX));
        if let Some(modified) = utc_to_zip_time(fs_util::modified_utc(source)?) {
            options = options.last_modified_time(modified);
        }
        Ok(options)
    }
}

fn open_zip(zip_path: &Utf8Path) -> Result<ZipArchive<fs::File>, RetrievalError> {
    let file = fs::File::open(zip_path.as_std_path())
        .map_err(|err| RetrievalError::Filesystem(format!("open zip {zip_path}: {err}")))?;
    ZipArchive::new(file).map_err(|err| RetrievalError::corrupt_archive(zip_path, err))
}

fn crc_and_size<R: Read>(reader: &mut R) -> io::Result<(u32, u64)> {
    let mut crc = flate2::Crc::new();
    let mut total = 0_u64;
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        crc.update(&buffer[..read]);
        total += read as u64;
    }
    Ok((crc.sum(), total))
}

/// `Dataset.mzML.gz` -> `Dataset.mzML`; only a trailing `.gz` is removed.
pub fn gunzipped_name(gz_path: &Utf8Path) -> Result<String, RetrievalError> {
    let name = fs_util::file_name(gz_path)?;
    let stem_len = name.len().saturating_sub(GZIP_EXTENSION.len());
    let has_suffix = name.len() > GZIP_EXTENSION.len()
        && name.is_char_boundary(stem_len)
        && name[stem_len..].eq_ignore_ascii_case(GZIP_EXTENSION);
    if !has_suffix {
        return Err(RetrievalError::corrupt_archive(
            gz_path,
            "gzip file name does not end in .gz",
        ));
    }
    Ok(name[..stem_len].to_string())
}

fn zip_time_to_utc(time: zip::DateTime) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(
        i32::from(time.year()),
        u32::from(time.month()),
        u32::from(time.day()),
    )?
    .and_hms_opt(
        u32::from(time.hour()),
        u32::from(time.minute()),
        u32::from(time.second()),
    )
    .map(|naive| naive.and_utc())
}

fn utc_to_zip_time(time: DateTime<Utc>) -> Option<zip::DateTime> {
    let year = u16::try_from(time.year()).ok()?;
    zip::DateTime::from_date_and_time(
        year,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    )
    .ok()
}
