//! ILDA animation file decoding.
//!
//! An ILDA file is a sequence of sections, each a 32-byte header followed by
//! `record_count` fixed-size records. Point sections become
//! [`FrameRecord`]s ready for the frame encoder; palette sections become
//! [`PaletteRecord`]s and replace the color table used by later
//! indexed-color frames.
//!
//! ```no_run
//! use helios_dac::ilda::{decode_file, IldaOptions, Record};
//!
//! let options = IldaOptions::default().with_adc_bits(12);
//! for record in decode_file("show.ild", &options)? {
//!     if let Record::Frame(frame) = record {
//!         println!("{}: {} points", frame.name, frame.points.len());
//!     }
//! }
//! # Ok::<(), helios_dac::ilda::PartialDecode>(())
//! ```

pub mod format;
pub mod palette;

pub use self::palette::Palette;

use log::debug;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use thiserror::Error;

use self::format::{
    Format, Header, IndexedPoint2d, IndexedPoint3d, PaletteEntry, ReadFromBytes, SizeBytes,
    TrueColorPoint2d, TrueColorPoint3d, MAGIC, STATUS_BLANKED,
};
use crate::error::{Error, Result};
use crate::frame::{Frame, WriteFrameFlags};
use crate::types::{Color, Point};

/// Options controlling how raw ILDA coordinates become device points.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IldaOptions {
    /// Resolution of the target DAC. Raw 16-bit coordinates are shifted
    /// right by `16 - adc_bits`.
    pub adc_bits: u8,
    pub x_scale: f32,
    pub y_scale: f32,
    /// Intensity given to decoded points.
    pub intensity: u8,
}

impl Default for IldaOptions {
    fn default() -> Self {
        Self {
            adc_bits: 16,
            x_scale: 1.0,
            y_scale: 1.0,
            intensity: 255,
        }
    }
}

impl IldaOptions {
    /// Set the DAC resolution, clamped to 1..=16 (builder pattern).
    pub fn with_adc_bits(mut self, bits: u8) -> Self {
        self.adc_bits = bits.clamp(1, 16);
        self
    }

    /// Set both scale factors (builder pattern).
    pub fn with_scale(mut self, x_scale: f32, y_scale: f32) -> Self {
        self.x_scale = x_scale;
        self.y_scale = y_scale;
        self
    }

    /// Set the intensity of decoded points (builder pattern).
    pub fn with_intensity(mut self, intensity: u8) -> Self {
        self.intensity = intensity;
        self
    }

    fn scale(&self, raw: i16, factor: f32) -> i16 {
        let shift = 16 - u32::from(self.adc_bits.clamp(1, 16));
        // Float to int casts saturate
        (f32::from(raw >> shift) * factor) as i16
    }
}

/// A decoded ILDA section.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    Palette(PaletteRecord),
    Frame(FrameRecord),
}

impl Record {
    pub fn as_frame(&self) -> Option<&FrameRecord> {
        match self {
            Record::Frame(frame) => Some(frame),
            Record::Palette(_) => None,
        }
    }

    pub fn into_frame(self) -> Option<FrameRecord> {
        match self {
            Record::Frame(frame) => Some(frame),
            Record::Palette(_) => None,
        }
    }
}

/// Color table loaded from a format 2 section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaletteRecord {
    pub name: String,
    pub company: String,
    pub colors: Vec<Color>,
}

/// One frame of points.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameRecord {
    pub name: String,
    pub company: String,
    pub number: u16,
    pub total_frames: u16,
    pub projector_id: u8,
    pub points: Vec<Point>,
}

impl FrameRecord {
    /// Build a frame for playback at `pps`.
    pub fn to_frame(&self, pps: u32, flags: WriteFrameFlags) -> Frame {
        Frame::new_with_flags(pps, self.points.clone(), flags)
    }
}

/// Decoding failed part way through a file.
///
/// Records decoded before the failure are kept.
#[derive(Debug, Error)]
#[error("ILDA decoding failed after {count} records: {source}", count = .records.len())]
pub struct PartialDecode {
    pub records: Vec<Record>,
    #[source]
    pub source: Error,
}

impl From<PartialDecode> for Error {
    fn from(partial: PartialDecode) -> Self {
        partial.source
    }
}

/// Streaming ILDA decoder.
///
/// Yields one [`Record`] per section until the end-of-file section, a
/// section without the `ILDA` magic, or the end of the stream. After an
/// error the reader yields nothing more.
pub struct IldaReader<R> {
    reader: R,
    options: IldaOptions,
    palette: Option<Palette>,
    finished: bool,
}

impl<R: Read> IldaReader<R> {
    pub fn new(reader: R, options: IldaOptions) -> Self {
        IldaReader {
            reader,
            options,
            palette: None,
            finished: false,
        }
    }

    pub fn options(&self) -> &IldaOptions {
        &self.options
    }

    /// The palette most recently loaded from the file, if any.
    pub fn palette(&self) -> Option<&Palette> {
        self.palette.as_ref()
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Decode the next section, or `None` at the end of the file.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.finished {
            return Ok(None);
        }
        let record = self.read_record();
        if !matches!(record, Ok(Some(_))) {
            self.finished = true;
        }
        record
    }

    fn read_record(&mut self) -> Result<Option<Record>> {
        let Some(magic) = self.read_magic()? else {
            debug!("ILDA: end of stream");
            return Ok(None);
        };
        if magic != MAGIC {
            debug!("ILDA: no magic in section header, stopping");
            return Ok(None);
        }

        let mut raw = [0u8; Header::SIZE_BYTES];
        self.reader.read_exact(&mut raw).map_err(truncated("header"))?;
        let header = Header::read_from_bytes(&raw[..]).map_err(truncated("header"))?;
        if header.record_count == 0 {
            debug!("ILDA: end-of-file section");
            return Ok(None);
        }

        let format = header.format().ok_or_else(|| {
            Error::malformed(format!("unsupported ILDA format {}", header.format_code))
        })?;
        let count = usize::from(header.record_count);
        let body = self.read_body(format, count)?;

        let points = match format {
            Format::Palette => return self.read_palette(header, &body).map(Some),
            Format::Indexed3d => self.read_points::<IndexedPoint3d>(&body, count)?,
            Format::Indexed2d => self.read_points::<IndexedPoint2d>(&body, count)?,
            Format::TrueColor3d => self.read_points::<TrueColorPoint3d>(&body, count)?,
            Format::TrueColor2d => self.read_points::<TrueColorPoint2d>(&body, count)?,
        };

        Ok(Some(Record::Frame(FrameRecord {
            name: header.name,
            company: header.company,
            number: header.number,
            total_frames: header.total_frames,
            projector_id: header.projector_id,
            points,
        })))
    }

    /// Read the 4 magic bytes. `None` when the stream ends cleanly first.
    fn read_magic(&mut self) -> Result<Option<[u8; 4]>> {
        let mut magic = [0u8; 4];
        let mut filled = 0;
        while filled < magic.len() {
            match self.reader.read(&mut magic[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(Error::malformed("truncated header")),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(magic))
    }

    /// Read all `count` records of a section in one go.
    fn read_body(&mut self, format: Format, count: usize) -> Result<Vec<u8>> {
        let what = match format {
            Format::Palette => "palette records",
            _ => "point records",
        };
        let mut body = vec![0u8; count * format.record_size()];
        self.reader.read_exact(&mut body).map_err(truncated(what))?;
        Ok(body)
    }

    fn read_palette(&mut self, header: Header, mut body: &[u8]) -> Result<Record> {
        let mut colors = Vec::with_capacity(usize::from(header.record_count));
        for _ in 0..header.record_count {
            let entry =
                PaletteEntry::read_from_bytes(&mut body).map_err(truncated("palette records"))?;
            colors.push(Color::new(entry.r, entry.g, entry.b));
        }
        debug!("ILDA: loaded palette with {} colors", colors.len());
        self.palette = Some(Palette::new(colors.clone()));

        Ok(Record::Palette(PaletteRecord {
            name: header.name,
            company: header.company,
            colors,
        }))
    }

    fn read_points<P: PointRecord>(&self, mut body: &[u8], count: usize) -> Result<Vec<Point>> {
        let default_palette;
        let palette = match &self.palette {
            Some(palette) => palette,
            None => {
                default_palette = Palette::default();
                &default_palette
            }
        };

        let mut points = Vec::with_capacity(count);
        for _ in 0..count {
            let raw = P::read_from_bytes(&mut body).map_err(truncated("point records"))?;
            let (x, y) = raw.xy();
            points.push(Point {
                x: self.options.scale(x, self.options.x_scale),
                y: self.options.scale(y, self.options.y_scale),
                color: raw.color(palette),
                intensity: self.options.intensity,
                blanked: raw.status() & STATUS_BLANKED != 0,
            });
        }
        Ok(points)
    }
}

impl<R: Read> Iterator for IldaReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Decode every section of an ILDA stream.
pub fn decode<R: Read>(
    reader: R,
    options: &IldaOptions,
) -> std::result::Result<Vec<Record>, PartialDecode> {
    let mut reader = IldaReader::new(reader, options.clone());
    let mut records = Vec::new();
    loop {
        match reader.next_record() {
            Ok(Some(record)) => records.push(record),
            Ok(None) => return Ok(records),
            Err(source) => return Err(PartialDecode { records, source }),
        }
    }
}

/// Decode an ILDA file from disk.
pub fn decode_file(
    path: impl AsRef<Path>,
    options: &IldaOptions,
) -> std::result::Result<Vec<Record>, PartialDecode> {
    let file = File::open(path).map_err(|e| PartialDecode {
        records: Vec::new(),
        source: e.into(),
    })?;
    decode(BufReader::new(file), options)
}

fn truncated(what: &'static str) -> impl Fn(io::Error) -> Error {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::malformed(format!("truncated {}", what))
        } else {
            Error::Io(e)
        }
    }
}

/// Common view over the four point record layouts.
trait PointRecord: ReadFromBytes {
    fn xy(&self) -> (i16, i16);
    fn status(&self) -> u8;
    fn color(&self, palette: &Palette) -> Color;
}

impl PointRecord for IndexedPoint3d {
    fn xy(&self) -> (i16, i16) {
        (self.x, self.y)
    }
    fn status(&self) -> u8 {
        self.status
    }
    fn color(&self, palette: &Palette) -> Color {
        palette.color(self.color_index)
    }
}

impl PointRecord for IndexedPoint2d {
    fn xy(&self) -> (i16, i16) {
        (self.x, self.y)
    }
    fn status(&self) -> u8 {
        self.status
    }
    fn color(&self, palette: &Palette) -> Color {
        palette.color(self.color_index)
    }
}

impl PointRecord for TrueColorPoint3d {
    fn xy(&self) -> (i16, i16) {
        (self.x, self.y)
    }
    fn status(&self) -> u8 {
        self.status
    }
    fn color(&self, _palette: &Palette) -> Color {
        Color::new(self.r, self.g, self.b)
    }
}

impl PointRecord for TrueColorPoint2d {
    fn xy(&self) -> (i16, i16) {
        (self.x, self.y)
    }
    fn status(&self) -> u8 {
        self.status
    }
    fn color(&self, _palette: &Palette) -> Color {
        Color::new(self.r, self.g, self.b)
    }
}
