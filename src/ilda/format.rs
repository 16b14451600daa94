//! Raw ILDA section headers and point records, read as big-endian bytes.

use byteorder::{ReadBytesExt, BE};
use std::io;

/// Magic bytes at the start of every section header.
pub const MAGIC: [u8; 4] = *b"ILDA";

/// Status bit marking a blanked point.
pub const STATUS_BLANKED: u8 = 0x40;

/// Status bit marking the last point of a frame.
pub const STATUS_LAST_POINT: u8 = 0x80;

/// Record types that may be read from big-endian bytes.
pub trait ReadFromBytes: Sized {
    fn read_from_bytes<R: ReadBytesExt>(reader: R) -> io::Result<Self>;
}

/// Types that have a constant size when read from bytes.
pub trait SizeBytes {
    const SIZE_BYTES: usize;
}

/// The record layout announced by a section header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    /// 3D coordinates, indexed color.
    Indexed3d,
    /// 2D coordinates, indexed color.
    Indexed2d,
    /// Color palette entries.
    Palette,
    /// 3D coordinates, true color.
    TrueColor3d,
    /// 2D coordinates, true color.
    TrueColor2d,
}

impl Format {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Format::Indexed3d),
            1 => Some(Format::Indexed2d),
            2 => Some(Format::Palette),
            4 => Some(Format::TrueColor3d),
            5 => Some(Format::TrueColor2d),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Format::Indexed3d => 0,
            Format::Indexed2d => 1,
            Format::Palette => 2,
            Format::TrueColor3d => 4,
            Format::TrueColor2d => 5,
        }
    }

    /// Size in bytes of a single record of this format.
    pub fn record_size(self) -> usize {
        match self {
            Format::Indexed3d => IndexedPoint3d::SIZE_BYTES,
            Format::Indexed2d => IndexedPoint2d::SIZE_BYTES,
            Format::Palette => PaletteEntry::SIZE_BYTES,
            Format::TrueColor3d => TrueColorPoint3d::SIZE_BYTES,
            Format::TrueColor2d => TrueColorPoint2d::SIZE_BYTES,
        }
    }
}

/// A 32-byte section header, minus the magic.
///
/// The format byte is kept raw so an unsupported value can be reported with
/// the rest of the header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub format_code: u8,
    pub name: String,
    pub company: String,
    pub record_count: u16,
    pub number: u16,
    pub total_frames: u16,
    pub projector_id: u8,
}

impl Header {
    pub fn format(&self) -> Option<Format> {
        Format::from_code(self.format_code)
    }
}

impl SizeBytes for Header {
    // Excludes the 4 magic bytes
    const SIZE_BYTES: usize = 28;
}

impl ReadFromBytes for Header {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved)?;
        let format_code = reader.read_u8()?;
        let name = read_text(&mut reader)?;
        let company = read_text(&mut reader)?;
        let record_count = reader.read_u16::<BE>()?;
        let number = reader.read_u16::<BE>()?;
        let total_frames = reader.read_u16::<BE>()?;
        let projector_id = reader.read_u8()?;
        let _reserved = reader.read_u8()?;
        Ok(Header {
            format_code,
            name,
            company,
            record_count,
            number,
            total_frames,
            projector_id,
        })
    }
}

/// Read an 8-byte, NUL-padded text field.
fn read_text<R: ReadBytesExt>(reader: &mut R) -> io::Result<String> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).trim_end().to_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexedPoint3d {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub status: u8,
    pub color_index: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexedPoint2d {
    pub x: i16,
    pub y: i16,
    pub status: u8,
    pub color_index: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrueColorPoint3d {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub status: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrueColorPoint2d {
    pub x: i16,
    pub y: i16,
    pub status: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaletteEntry {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl SizeBytes for IndexedPoint3d {
    const SIZE_BYTES: usize = 8;
}

impl SizeBytes for IndexedPoint2d {
    const SIZE_BYTES: usize = 6;
}

impl SizeBytes for TrueColorPoint3d {
    const SIZE_BYTES: usize = 10;
}

impl SizeBytes for TrueColorPoint2d {
    const SIZE_BYTES: usize = 8;
}

impl SizeBytes for PaletteEntry {
    const SIZE_BYTES: usize = 3;
}

impl ReadFromBytes for IndexedPoint3d {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        Ok(IndexedPoint3d {
            x: reader.read_i16::<BE>()?,
            y: reader.read_i16::<BE>()?,
            z: reader.read_i16::<BE>()?,
            status: reader.read_u8()?,
            color_index: reader.read_u8()?,
        })
    }
}

impl ReadFromBytes for IndexedPoint2d {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        Ok(IndexedPoint2d {
            x: reader.read_i16::<BE>()?,
            y: reader.read_i16::<BE>()?,
            status: reader.read_u8()?,
            color_index: reader.read_u8()?,
        })
    }
}

impl ReadFromBytes for TrueColorPoint3d {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        Ok(TrueColorPoint3d {
            x: reader.read_i16::<BE>()?,
            y: reader.read_i16::<BE>()?,
            z: reader.read_i16::<BE>()?,
            status: reader.read_u8()?,
            r: reader.read_u8()?,
            g: reader.read_u8()?,
            b: reader.read_u8()?,
        })
    }
}

impl ReadFromBytes for TrueColorPoint2d {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        Ok(TrueColorPoint2d {
            x: reader.read_i16::<BE>()?,
            y: reader.read_i16::<BE>()?,
            status: reader.read_u8()?,
            r: reader.read_u8()?,
            g: reader.read_u8()?,
            b: reader.read_u8()?,
        })
    }
}

impl ReadFromBytes for PaletteEntry {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        Ok(PaletteEntry {
            r: reader.read_u8()?,
            g: reader.read_u8()?,
            b: reader.read_u8()?,
        })
    }
}
