//! PKZIP record layouts (APPNOTE 6.3.3).
//!
//! Every entry is written with general-purpose flag bit 3: the local header
//! carries zero CRC and sizes, and the real values follow the payload in a
//! data descriptor and in the central directory.

use std::fmt;

use time::{Month, OffsetDateTime, PrimitiveDateTime};

use super::ArchiveError;

pub const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;
pub const END_OF_CENTRAL_DIR_SIGNATURE: u32 = 0x0605_4b50;
pub const ZIP64_END_OF_CENTRAL_DIR_SIGNATURE: u32 = 0x0606_4b50;
pub const ZIP64_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;

pub const LOCAL_HEADER_LEN: usize = 30;
pub const CENTRAL_HEADER_LEN: usize = 46;
pub const END_OF_CENTRAL_DIR_LEN: usize = 22;
pub const ZIP64_END_OF_CENTRAL_DIR_LEN: usize = 56;
pub const ZIP64_LOCATOR_LEN: usize = 20;

pub const ZIP64_EXTRA_ID: u16 = 0x0001;

pub const VERSION_DEFAULT: u16 = 20;
pub const VERSION_ZIP64: u16 = 45;
const CREATOR_UNIX: u16 = 3 << 8;

pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
pub const FLAG_UTF8: u16 = 0x0800;

pub const UINT16_MAX: u64 = 0xffff;
pub const UINT32_MAX: u64 = 0xffff_ffff;

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;
const MSDOS_DIR_ATTR: u32 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Stored,
    Deflated,
}

impl Method {
    pub fn code(self) -> u16 {
        match self {
            Self::Stored => 0,
            Self::Deflated => 8,
        }
    }

    pub fn from_code(code: u16) -> Result<Self, ArchiveError> {
        match code {
            0 => Ok(Self::Stored),
            8 => Ok(Self::Deflated),
            other => Err(ArchiveError::UnsupportedMethod(other)),
        }
    }
}

/// MS-DOS date and time as stored in PKZIP headers (two-second precision).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosTime {
    pub date: u16,
    pub time: u16,
}

impl DosTime {
    /// 2008-01-01 00:00:00.
    pub const DEFAULT: DosTime = DosTime {
        date: (28 << 9) | (1 << 5) | 1,
        time: 0,
    };

    pub fn from_datetime(dt: PrimitiveDateTime) -> Self {
        let year = dt.year().clamp(1980, 2107);
        let date = (((year - 1980) as u16) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
        let time =
            ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() as u16 / 2);
        Self { date, time }
    }

    pub fn from_unix(seconds: i64) -> Result<Self, ArchiveError> {
        let dt = OffsetDateTime::from_unix_timestamp(seconds)
            .map_err(|err| ArchiveError::InvalidTimestamp(err.to_string()))?;
        Ok(Self::from_datetime(PrimitiveDateTime::new(dt.date(), dt.time())))
    }

    pub fn to_datetime(self) -> Option<PrimitiveDateTime> {
        let year = 1980 + i32::from(self.date >> 9);
        let month = Month::try_from(((self.date >> 5) & 0x0f) as u8).ok()?;
        let day = (self.date & 0x1f) as u8;
        let date = time::Date::from_calendar_date(year, month, day).ok()?;
        let time = time::Time::from_hms(
            (self.time >> 11) as u8,
            ((self.time >> 5) & 0x3f) as u8,
            ((self.time & 0x1f) * 2) as u8,
        )
        .ok()?;
        Some(PrimitiveDateTime::new(date, time))
    }
}

impl Default for DosTime {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Metadata of one archive entry.
#[derive(Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub method: Method,
    pub modified: DosTime,
    pub flags: u16,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub external_attrs: u32,
    /// Extra fields other than the ZIP64 record, written verbatim.
    pub extra: Vec<u8>,
    /// Offset of the local header, assigned when the entry is written.
    pub offset: u64,
}

impl fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHeader")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("crc32", &format_args!("{:#010x}", self.crc32))
            .field("compressed_size", &self.compressed_size)
            .field("uncompressed_size", &self.uncompressed_size)
            .field("mode", &format_args!("{:o}", self.mode()))
            .field("offset", &self.offset)
            .finish()
    }
}

impl FileHeader {
    pub fn new(name: impl Into<String>, method: Method) -> Self {
        let mut header = Self {
            name: name.into(),
            method,
            modified: DosTime::DEFAULT,
            flags: FLAG_DATA_DESCRIPTOR,
            version_made_by: CREATOR_UNIX | VERSION_DEFAULT,
            version_needed: VERSION_DEFAULT,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            external_attrs: 0,
            extra: Vec::new(),
            offset: 0,
        };
        header.set_mode(S_IFREG | 0o644);
        header
    }

    /// Sets Unix mode bits (including the file-type bits).
    pub fn set_mode(&mut self, mode: u32) {
        self.external_attrs = mode << 16;
        if mode & S_IFMT == S_IFDIR {
            self.external_attrs |= MSDOS_DIR_ATTR;
        }
    }

    pub fn mode(&self) -> u32 {
        self.external_attrs >> 16
    }

    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    pub fn is_symlink(&self) -> bool {
        self.mode() & S_IFMT == S_IFLNK
    }

    /// True when any size or the offset needs the 64-bit extension.
    pub fn is_zip64(&self) -> bool {
        self.compressed_size >= UINT32_MAX
            || self.uncompressed_size >= UINT32_MAX
            || self.offset >= UINT32_MAX
    }

    fn name_flags(&self) -> u16 {
        if self.name.is_ascii() {
            0
        } else {
            FLAG_UTF8
        }
    }

    /// Upgrades version fields when the entry turned out to need ZIP64.
    pub(crate) fn finalize_versions(&mut self) {
        if self.is_zip64() {
            self.version_needed = self.version_needed.max(VERSION_ZIP64);
            self.version_made_by = (self.version_made_by & 0xff00) | VERSION_ZIP64;
        }
    }
}

pub(crate) fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Local file header with zeroed CRC and sizes (flag bit 3 set).
pub fn encode_local_header(header: &FileHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LOCAL_HEADER_LEN + header.name.len() + header.extra.len());
    put_u32(&mut buf, LOCAL_HEADER_SIGNATURE);
    put_u16(&mut buf, header.version_needed);
    put_u16(&mut buf, header.flags | FLAG_DATA_DESCRIPTOR | header.name_flags());
    put_u16(&mut buf, header.method.code());
    put_u16(&mut buf, header.modified.time);
    put_u16(&mut buf, header.modified.date);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 0);
    put_u16(&mut buf, header.name.len() as u16);
    put_u16(&mut buf, header.extra.len() as u16);
    buf.extend_from_slice(header.name.as_bytes());
    buf.extend_from_slice(&header.extra);
    buf
}

pub fn encode_data_descriptor(header: &FileHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    put_u32(&mut buf, DATA_DESCRIPTOR_SIGNATURE);
    put_u32(&mut buf, header.crc32);
    if header.is_zip64() {
        put_u64(&mut buf, header.compressed_size);
        put_u64(&mut buf, header.uncompressed_size);
    } else {
        put_u32(&mut buf, header.compressed_size as u32);
        put_u32(&mut buf, header.uncompressed_size as u32);
    }
    buf
}

pub fn encode_central_header(header: &FileHeader) -> Vec<u8> {
    let zip64 = header.is_zip64();
    let mut extra = header.extra.clone();
    if zip64 {
        put_u16(&mut extra, ZIP64_EXTRA_ID);
        put_u16(&mut extra, 24);
        put_u64(&mut extra, header.uncompressed_size);
        put_u64(&mut extra, header.compressed_size);
        put_u64(&mut extra, header.offset);
    }

    let (compressed, uncompressed, offset) = if zip64 {
        (UINT32_MAX as u32, UINT32_MAX as u32, UINT32_MAX as u32)
    } else {
        (
            header.compressed_size as u32,
            header.uncompressed_size as u32,
            header.offset as u32,
        )
    };

    let mut buf = Vec::with_capacity(CENTRAL_HEADER_LEN + header.name.len() + extra.len());
    put_u32(&mut buf, CENTRAL_HEADER_SIGNATURE);
    put_u16(&mut buf, header.version_made_by);
    put_u16(&mut buf, header.version_needed);
    put_u16(&mut buf, header.flags | FLAG_DATA_DESCRIPTOR | header.name_flags());
    put_u16(&mut buf, header.method.code());
    put_u16(&mut buf, header.modified.time);
    put_u16(&mut buf, header.modified.date);
    put_u32(&mut buf, header.crc32);
    put_u32(&mut buf, compressed);
    put_u32(&mut buf, uncompressed);
    put_u16(&mut buf, header.name.len() as u16);
    put_u16(&mut buf, extra.len() as u16);
    put_u16(&mut buf, 0); // comment length
    put_u16(&mut buf, 0); // disk number start
    put_u16(&mut buf, 0); // internal attributes
    put_u32(&mut buf, header.external_attrs);
    put_u32(&mut buf, offset);
    buf.extend_from_slice(header.name.as_bytes());
    buf.extend_from_slice(&extra);
    buf
}

/// Trailer after the central directory. Adds the ZIP64 end record and its
/// locator when `force_zip64` is set or a count, size or offset overflows.
pub fn encode_end_records(
    records: u64,
    directory_size: u64,
    directory_offset: u64,
    force_zip64: bool,
) -> Vec<u8> {
    let zip64 = force_zip64
        || records >= UINT16_MAX
        || directory_size >= UINT32_MAX
        || directory_offset >= UINT32_MAX;

    let mut buf = Vec::new();
    if zip64 {
        let end64_offset = directory_offset + directory_size;
        put_u32(&mut buf, ZIP64_END_OF_CENTRAL_DIR_SIGNATURE);
        put_u64(&mut buf, (ZIP64_END_OF_CENTRAL_DIR_LEN - 12) as u64);
        put_u16(&mut buf, CREATOR_UNIX | VERSION_ZIP64);
        put_u16(&mut buf, VERSION_ZIP64);
        put_u32(&mut buf, 0);
        put_u32(&mut buf, 0);
        put_u64(&mut buf, records);
        put_u64(&mut buf, records);
        put_u64(&mut buf, directory_size);
        put_u64(&mut buf, directory_offset);

        put_u32(&mut buf, ZIP64_LOCATOR_SIGNATURE);
        put_u32(&mut buf, 0);
        put_u64(&mut buf, end64_offset);
        put_u32(&mut buf, 1);
    }

    put_u32(&mut buf, END_OF_CENTRAL_DIR_SIGNATURE);
    put_u16(&mut buf, 0);
    put_u16(&mut buf, 0);
    put_u16(&mut buf, records.min(UINT16_MAX) as u16);
    put_u16(&mut buf, records.min(UINT16_MAX) as u16);
    put_u32(&mut buf, directory_size.min(UINT32_MAX) as u32);
    put_u32(&mut buf, directory_offset.min(UINT32_MAX) as u32);
    put_u16(&mut buf, 0);
    buf
}

/// Removes ZIP64 extended-information records from an extra-field area,
/// keeping every other record verbatim. A truncated trailing record is
/// kept as-is.
pub fn strip_zip64_extra(extra: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(extra.len());
    let mut rest = extra;
    while rest.len() >= 4 {
        let id = u16::from_le_bytes([rest[0], rest[1]]);
        let size = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        if rest.len() < 4 + size {
            break;
        }
        if id != ZIP64_EXTRA_ID {
            out.extend_from_slice(&rest[..4 + size]);
        }
        rest = &rest[4 + size..];
    }
    out.extend_from_slice(rest);
    out
}
