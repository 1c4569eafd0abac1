use std::path::{Path, PathBuf};

use ndarray::{Array3, Axis};
use tracing::debug;

use crate::error::AbiError;
use crate::nifti;
use crate::nrrd::{self, RawVolume};

/// Scales header spacing (micrometers) into the millimeter world units the
/// reference space uses.
const SPACING_SCALE: f64 = 0.001;

/// A volume in RAS world orientation with its 4x4 voxel-to-world affine.
#[derive(Debug, Clone)]
pub struct OrientedVolume {
    pub data: Array3<f32>,
    pub affine: [[f64; 4]; 4],
}

impl OrientedVolume {
    pub fn save(&self, path: &Path) -> Result<(), AbiError> {
        nifti::write(path, &self.data, &self.affine)
    }

    pub fn load(path: &Path) -> Result<Self, AbiError> {
        let (data, affine) = nifti::read(path)?;
        Ok(Self { data, affine })
    }
}

/// Convert a decoded grid payload into RAS orientation.
///
/// The source convention is PIR; the remap runs PIR -> RIP -> RPI -> RPS ->
/// RAS as two axis swaps followed by three axis reversals. Every step is an
/// exact array transform with no numeric approximation.
pub fn convert(raw: RawVolume) -> OrientedVolume {
    let affine = affine_from_directions(&raw.space_directions);
    let mut data = raw.data;
    data.swap_axes(0, 2);
    data.swap_axes(1, 2);
    data.invert_axis(Axis(2));
    data.invert_axis(Axis(1));
    data.invert_axis(Axis(0));
    OrientedVolume { data, affine }
}

/// Read an NRRD payload and write the RAS-oriented NIfTI next to it,
/// returning the new path.
pub fn convert_file(nrrd_path: &Path) -> Result<PathBuf, AbiError> {
    let raw = nrrd::read(nrrd_path)?;
    let oriented = convert(raw);

    let stem = nrrd_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| AbiError::Filesystem(format!("bad path: {}", nrrd_path.display())))?;
    let nii_path = nrrd_path.with_file_name(format!("{stem}.nii"));
    oriented.save(&nii_path)?;
    debug!(from = %nrrd_path.display(), to = %nii_path.display(), "volume converted");
    Ok(nii_path)
}

/// Homogeneous 4x4 from the header's 3x3 spacing matrix, scaled to
/// millimeters. Translation is unsupported and left at zero.
pub fn affine_from_directions(directions: &[[f64; 3]; 3]) -> [[f64; 4]; 4] {
    let mut affine = [[0.0; 4]; 4];
    for row in 0..3 {
        for col in 0..3 {
            affine[row][col] = directions[row][col] * SPACING_SCALE;
        }
    }
    affine[3][3] = 1.0;
    affine
}
