use std::fs;
use std::io::Read;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::MultiGzDecoder;
use ndarray::{Array3, ShapeBuilder};

use crate::error::AbiError;

/// Decoded grid-data payload: sample array plus the header's spatial
/// direction matrix. Sample order on disk is first-axis-fastest, which is
/// preserved here by building the array in column-major layout.
#[derive(Debug, Clone)]
pub struct RawVolume {
    pub data: Array3<f32>,
    pub space_directions: [[f64; 3]; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl SampleType {
    fn parse(value: &str) -> Result<Self, AbiError> {
        match value {
            "uchar" | "uint8" | "uint8_t" | "unsigned char" => Ok(SampleType::U8),
            "signed char" | "int8" | "int8_t" => Ok(SampleType::I8),
            "ushort" | "uint16" | "uint16_t" | "unsigned short" => Ok(SampleType::U16),
            "short" | "int16" | "int16_t" | "signed short" => Ok(SampleType::I16),
            "uint" | "uint32" | "uint32_t" | "unsigned int" => Ok(SampleType::U32),
            "int" | "int32" | "int32_t" | "signed int" => Ok(SampleType::I32),
            "float" => Ok(SampleType::F32),
            "double" => Ok(SampleType::F64),
            other => Err(AbiError::HeaderParse(format!("unsupported type: {other}"))),
        }
    }

    fn size(self) -> usize {
        match self {
            SampleType::U8 | SampleType::I8 => 1,
            SampleType::U16 | SampleType::I16 => 2,
            SampleType::U32 | SampleType::I32 | SampleType::F32 => 4,
            SampleType::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Raw,
    Gzip,
}

/// Validated header of the subset the grid-data service produces: 3-D scalar
/// payloads, `raw` or `gzip` encoding, with a `space directions` field.
/// Anything missing or inconsistent fails loudly; there are no defaults.
#[derive(Debug)]
struct HeaderFields {
    sizes: [usize; 3],
    sample_type: SampleType,
    encoding: Encoding,
    space_directions: [[f64; 3]; 3],
    big_endian: bool,
    data_file: Option<String>,
}

/// Read an NRRD file into a [`RawVolume`]. A `data file` field names a
/// detached payload, resolved relative to the header's own directory.
pub fn read(path: &Path) -> Result<RawVolume, AbiError> {
    let bytes = fs::read(path).map_err(|err| AbiError::Filesystem(err.to_string()))?;
    let (header, data) = split_header(&bytes)?;
    let fields = parse_fields(header)?;

    match &fields.data_file {
        Some(name) => {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            let payload = fs::read(base.join(name)).map_err(|err| {
                AbiError::HeaderParse(format!("detached data file {name}: {err}"))
            })?;
            assemble(&fields, &payload)
        }
        None => assemble(&fields, data),
    }
}

/// Read an in-memory NRRD document. The data must be attached; a detached
/// header has no directory to resolve its payload against.
pub fn read_bytes(bytes: &[u8]) -> Result<RawVolume, AbiError> {
    let (header, data) = split_header(bytes)?;
    let fields = parse_fields(header)?;
    if let Some(name) = &fields.data_file {
        return Err(AbiError::HeaderParse(format!(
            "detached data file {name} needs a containing directory"
        )));
    }
    assemble(&fields, data)
}

fn parse_fields(header: &str) -> Result<HeaderFields, AbiError> {
    let mut sizes: Option<Vec<usize>> = None;
    let mut dimension: Option<usize> = None;
    let mut sample_type: Option<SampleType> = None;
    let mut encoding: Option<Encoding> = None;
    let mut directions: Option<[[f64; 3]; 3]> = None;
    let mut big_endian = false;
    let mut data_file: Option<String> = None;

    for line in header.lines().skip(1) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        // "field: value" lines; "key:=value" comments are ignored.
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        if value.starts_with('=') {
            continue;
        }
        let field = field.trim().to_lowercase();
        let value = value.trim();
        match field.as_str() {
            "dimension" => {
                dimension = Some(value.parse().map_err(|_| {
                    AbiError::HeaderParse(format!("bad dimension: {value}"))
                })?);
            }
            "sizes" => {
                let parsed = value
                    .split_whitespace()
                    .map(|v| v.parse::<usize>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| AbiError::HeaderParse(format!("bad sizes: {value}")))?;
                sizes = Some(parsed);
            }
            "type" => sample_type = Some(SampleType::parse(value)?),
            "encoding" => {
                encoding = Some(match value {
                    "raw" => Encoding::Raw,
                    "gzip" | "gz" => Encoding::Gzip,
                    other => {
                        return Err(AbiError::HeaderParse(format!(
                            "unsupported encoding: {other}"
                        )));
                    }
                });
            }
            "space directions" => directions = Some(parse_directions(value)?),
            "endian" => big_endian = value.eq_ignore_ascii_case("big"),
            "data file" | "datafile" => {
                // Only the single-filename form; LIST and %d formats are
                // multi-file layouts the grid service never emits.
                if value.split_whitespace().count() != 1 {
                    return Err(AbiError::HeaderParse(format!(
                        "unsupported data file form: {value}"
                    )));
                }
                data_file = Some(value.to_string());
            }
            _ => {}
        }
    }

    let dimension = dimension
        .ok_or_else(|| AbiError::HeaderParse("missing dimension field".to_string()))?;
    if dimension != 3 {
        return Err(AbiError::HeaderParse(format!(
            "expected a 3-D volume, got dimension {dimension}"
        )));
    }
    let sizes = sizes.ok_or_else(|| AbiError::HeaderParse("missing sizes field".to_string()))?;
    if sizes.len() != 3 {
        return Err(AbiError::HeaderParse(format!(
            "expected 3 sizes, got {}",
            sizes.len()
        )));
    }

    Ok(HeaderFields {
        sizes: [sizes[0], sizes[1], sizes[2]],
        sample_type: sample_type
            .ok_or_else(|| AbiError::HeaderParse("missing type field".to_string()))?,
        encoding: encoding
            .ok_or_else(|| AbiError::HeaderParse("missing encoding field".to_string()))?,
        space_directions: directions
            .ok_or_else(|| AbiError::HeaderParse("missing space directions field".to_string()))?,
        big_endian,
        data_file,
    })
}

fn assemble(fields: &HeaderFields, data: &[u8]) -> Result<RawVolume, AbiError> {
    let decoded = match fields.encoding {
        Encoding::Raw => data.to_vec(),
        Encoding::Gzip => {
            let mut decoder = MultiGzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|err| AbiError::HeaderParse(format!("gzip data: {err}")))?;
            out
        }
    };

    let [s0, s1, s2] = fields.sizes;
    let count = s0 * s1 * s2;
    let expected_len = count * fields.sample_type.size();
    if decoded.len() < expected_len {
        return Err(AbiError::HeaderParse(format!(
            "data too short: {} bytes, expected {expected_len}",
            decoded.len()
        )));
    }

    let samples = decode_samples(&decoded[..expected_len], fields.sample_type, fields.big_endian);
    let data = Array3::from_shape_vec((s0, s1, s2).f(), samples)
        .map_err(|err| AbiError::HeaderParse(err.to_string()))?;

    Ok(RawVolume {
        data,
        space_directions: fields.space_directions,
    })
}

/// Split at the first blank line. A file with no blank line is a detached
/// header: all header, no attached data.
fn split_header(bytes: &[u8]) -> Result<(&str, &[u8]), AbiError> {
    if !bytes.starts_with(b"NRRD") {
        return Err(AbiError::HeaderParse("not an NRRD file".to_string()));
    }
    let (header_end, data_start) = match find_blank_line(bytes) {
        Some(boundary) => boundary,
        None => (bytes.len(), bytes.len()),
    };
    let header = std::str::from_utf8(&bytes[..header_end])
        .map_err(|_| AbiError::HeaderParse("non-utf8 header".to_string()))?;
    Ok((header, &bytes[data_start..]))
}

/// Byte offsets of the first blank line: (end of header, start of data).
fn find_blank_line(bytes: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            if bytes.get(i + 1) == Some(&b'\n') {
                return Some((i, i + 2));
            }
            if bytes.get(i + 1) == Some(&b'\r') && bytes.get(i + 2) == Some(&b'\n') {
                return Some((i, i + 3));
            }
        }
        i += 1;
    }
    None
}

/// Parse `(a,b,c) (d,e,f) (g,h,i)`. A `none` entry marks a non-spatial axis,
/// which a 3-D scalar grid must not have.
fn parse_directions(value: &str) -> Result<[[f64; 3]; 3], AbiError> {
    let mut rows = Vec::new();
    for token in value.split_whitespace() {
        if token.eq_ignore_ascii_case("none") {
            return Err(AbiError::HeaderParse(
                "non-spatial axis in space directions".to_string(),
            ));
        }
        let inner = token
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .ok_or_else(|| {
                AbiError::HeaderParse(format!("bad space directions entry: {token}"))
            })?;
        let parts = inner
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| AbiError::HeaderParse(format!("bad space directions entry: {token}")))?;
        if parts.len() != 3 {
            return Err(AbiError::HeaderParse(format!(
                "bad space directions entry: {token}"
            )));
        }
        rows.push([parts[0], parts[1], parts[2]]);
    }
    if rows.len() != 3 {
        return Err(AbiError::HeaderParse(format!(
            "expected 3 space direction vectors, got {}",
            rows.len()
        )));
    }
    Ok([rows[0], rows[1], rows[2]])
}

fn decode_samples(bytes: &[u8], sample_type: SampleType, big_endian: bool) -> Vec<f32> {
    let width = sample_type.size();
    bytes
        .chunks_exact(width)
        .map(|chunk| decode_one(chunk, sample_type, big_endian))
        .collect()
}

fn decode_one(chunk: &[u8], sample_type: SampleType, big_endian: bool) -> f32 {
    macro_rules! read {
        ($method:ident) => {
            if big_endian {
                BigEndian::$method(chunk)
            } else {
                LittleEndian::$method(chunk)
            }
        };
    }
    match sample_type {
        SampleType::U8 => chunk[0] as f32,
        SampleType::I8 => chunk[0] as i8 as f32,
        SampleType::U16 => read!(read_u16) as f32,
        SampleType::I16 => read!(read_i16) as f32,
        SampleType::U32 => read!(read_u32) as f32,
        SampleType::I32 => read!(read_i32) as f32,
        SampleType::F32 => read!(read_f32),
        SampleType::F64 => read!(read_f64) as f32,
    }
}
