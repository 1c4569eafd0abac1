use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use ndarray::{Array3, ShapeBuilder};

use crate::error::AbiError;

// NIfTI-1 field offsets within the 348-byte header.
const SIZEOF_HDR: usize = 0;
const DIM: usize = 40;
const DATATYPE: usize = 70;
const BITPIX: usize = 72;
const PIXDIM: usize = 76;
const VOX_OFFSET: usize = 108;
const SCL_SLOPE: usize = 112;
const XYZT_UNITS: usize = 123;
const DESCRIP: usize = 148;
const QFORM_CODE: usize = 252;
const SFORM_CODE: usize = 254;
const SROW_X: usize = 280;
const SROW_Y: usize = 296;
const SROW_Z: usize = 312;
const MAGIC: usize = 344;

const HEADER_SIZE: usize = 348;
const DATA_OFFSET: usize = 352;
const DATATYPE_FLOAT32: i16 = 16;
const UNITS_MM: u8 = 2;
const XFORM_ALIGNED: i16 = 2;

/// Write a float32 volume as a single-file NIfTI-1 image with the given
/// sform affine. A `.gz` suffix selects gzip compression. Samples are laid
/// out first-axis-fastest, as the format requires.
pub fn write(path: &Path, data: &Array3<f32>, affine: &[[f64; 4]; 4]) -> Result<(), AbiError> {
    let file = File::create(path).map_err(|err| AbiError::Filesystem(err.to_string()))?;
    if is_gz(path) {
        let encoder = GzEncoder::new(file, Compression::default());
        write_to(BufWriter::new(encoder), data, affine)
    } else {
        write_to(BufWriter::new(file), data, affine)
    }
}

fn write_to<W: Write>(
    mut out: W,
    data: &Array3<f32>,
    affine: &[[f64; 4]; 4],
) -> Result<(), AbiError> {
    let (nx, ny, nz) = data.dim();
    let mut header = [0u8; HEADER_SIZE];

    LittleEndian::write_i32(&mut header[SIZEOF_HDR..], HEADER_SIZE as i32);
    let dim: [i16; 8] = [3, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (i, v) in dim.iter().enumerate() {
        LittleEndian::write_i16(&mut header[DIM + i * 2..], *v);
    }
    LittleEndian::write_i16(&mut header[DATATYPE..], DATATYPE_FLOAT32);
    LittleEndian::write_i16(&mut header[BITPIX..], 32);

    let mut pixdim = [0.0f32; 8];
    pixdim[0] = 1.0;
    for axis in 0..3 {
        let row = affine[axis];
        pixdim[axis + 1] =
            ((row[0] * row[0] + row[1] * row[1] + row[2] * row[2]).sqrt()) as f32;
    }
    for (i, v) in pixdim.iter().enumerate() {
        LittleEndian::write_f32(&mut header[PIXDIM + i * 4..], *v);
    }

    LittleEndian::write_f32(&mut header[VOX_OFFSET..], DATA_OFFSET as f32);
    LittleEndian::write_f32(&mut header[SCL_SLOPE..], 1.0);
    header[XYZT_UNITS] = UNITS_MM;

    let descrip = b"abi-connect";
    header[DESCRIP..DESCRIP + descrip.len()].copy_from_slice(descrip);

    LittleEndian::write_i16(&mut header[QFORM_CODE..], 0);
    LittleEndian::write_i16(&mut header[SFORM_CODE..], XFORM_ALIGNED);
    for (offset, row) in [(SROW_X, 0), (SROW_Y, 1), (SROW_Z, 2)] {
        for col in 0..4 {
            LittleEndian::write_f32(&mut header[offset + col * 4..], affine[row][col] as f32);
        }
    }
    header[MAGIC..MAGIC + 4].copy_from_slice(b"n+1\0");

    out.write_all(&header)
        .map_err(|err| AbiError::Filesystem(err.to_string()))?;
    // Extension flag bytes pad the header to the data offset.
    out.write_all(&[0u8; DATA_OFFSET - HEADER_SIZE])
        .map_err(|err| AbiError::Filesystem(err.to_string()))?;

    let mut buf = Vec::with_capacity(nx * ny * nz * 4);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                buf.extend_from_slice(&data[[x, y, z]].to_le_bytes());
            }
        }
    }
    out.write_all(&buf)
        .map_err(|err| AbiError::Filesystem(err.to_string()))?;
    out.flush()
        .map_err(|err| AbiError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Read a float32 NIfTI-1 image back into an array and its sform affine.
pub fn read(path: &Path) -> Result<(Array3<f32>, [[f64; 4]; 4]), AbiError> {
    let mut file = File::open(path).map_err(|err| AbiError::Filesystem(err.to_string()))?;
    let mut bytes = Vec::new();
    if is_gz(path) {
        MultiGzDecoder::new(file)
            .read_to_end(&mut bytes)
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
    } else {
        file.read_to_end(&mut bytes)
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
    }
    read_bytes(&bytes)
}

fn read_bytes(bytes: &[u8]) -> Result<(Array3<f32>, [[f64; 4]; 4]), AbiError> {
    if bytes.len() < DATA_OFFSET {
        return Err(AbiError::HeaderParse("truncated nifti header".to_string()));
    }
    if LittleEndian::read_i32(&bytes[SIZEOF_HDR..]) != HEADER_SIZE as i32 {
        return Err(AbiError::HeaderParse("not a NIfTI-1 header".to_string()));
    }
    if &bytes[MAGIC..MAGIC + 3] != b"n+1" {
        return Err(AbiError::HeaderParse("bad nifti magic".to_string()));
    }
    let datatype = LittleEndian::read_i16(&bytes[DATATYPE..]);
    if datatype != DATATYPE_FLOAT32 {
        return Err(AbiError::HeaderParse(format!(
            "unsupported nifti datatype: {datatype}"
        )));
    }

    let nx = LittleEndian::read_i16(&bytes[DIM + 2..]) as usize;
    let ny = LittleEndian::read_i16(&bytes[DIM + 4..]) as usize;
    let nz = LittleEndian::read_i16(&bytes[DIM + 6..]) as usize;

    let mut affine = [[0.0f64; 4]; 4];
    affine[3][3] = 1.0;
    for (offset, row) in [(SROW_X, 0), (SROW_Y, 1), (SROW_Z, 2)] {
        for col in 0..4 {
            affine[row][col] = LittleEndian::read_f32(&bytes[offset + col * 4..]) as f64;
        }
    }

    let vox_offset = LittleEndian::read_f32(&bytes[VOX_OFFSET..]) as usize;
    let count = nx * ny * nz;
    let data_bytes = bytes
        .get(vox_offset..vox_offset + count * 4)
        .ok_or_else(|| AbiError::HeaderParse("truncated nifti data".to_string()))?;
    let samples: Vec<f32> = data_bytes
        .chunks_exact(4)
        .map(LittleEndian::read_f32)
        .collect();

    let data = Array3::from_shape_vec((nx, ny, nz).f(), samples)
        .map_err(|err| AbiError::HeaderParse(err.to_string()))?;
    Ok((data, affine))
}

fn is_gz(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}
