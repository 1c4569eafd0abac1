use std::path::{Path, PathBuf};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::domain::ResolutionTier;
use crate::error::AbiError;

pub const DEFAULT_ATLAS_DIR: &str = "/usr/share/mouse-brain-atlases";

/// Reference and transform locations, resolved once at startup and passed
/// explicitly so tests can substitute doubles.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub reference_100um: Utf8PathBuf,
    pub reference_25um: Utf8PathBuf,
    pub transform: Utf8PathBuf,
    pub interpolation: String,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self::with_atlas_dir(Utf8Path::new(DEFAULT_ATLAS_DIR))
    }
}

impl RegistrationConfig {
    pub fn with_atlas_dir(atlas: &Utf8Path) -> Self {
        Self {
            reference_100um: atlas.join("dsurqec_200micron_masked.nii"),
            reference_25um: atlas.join("dsurqec_40micron_masked.nii"),
            transform: atlas.join("abi2dsurqec_Composite.h5"),
            interpolation: "BSpline".to_string(),
        }
    }

    pub fn reference_for(&self, tier: ResolutionTier) -> &Utf8Path {
        match tier {
            ResolutionTier::Um100 => &self.reference_100um,
            ResolutionTier::Um25 => &self.reference_25um,
        }
    }
}

pub trait RegistrationTool: Send + Sync {
    fn apply(
        &self,
        input: &Path,
        reference: &Path,
        transform: &Path,
        interpolation: &str,
        output: &Path,
    ) -> Result<(), AbiError>;
}

/// `antsApplyTransforms` from the ANTs toolkit, looked up on PATH.
#[derive(Clone)]
pub struct AntsApplyTransforms {
    program: Option<PathBuf>,
}

impl AntsApplyTransforms {
    pub fn new() -> Self {
        Self {
            program: find_in_path("antsApplyTransforms"),
        }
    }
}

impl Default for AntsApplyTransforms {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationTool for AntsApplyTransforms {
    fn apply(
        &self,
        input: &Path,
        reference: &Path,
        transform: &Path,
        interpolation: &str,
        output: &Path,
    ) -> Result<(), AbiError> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| AbiError::MissingTool("antsApplyTransforms".to_string()))?;

        let result = Command::new(program)
            .arg("--dimensionality")
            .arg("3")
            .arg("--input")
            .arg(input)
            .arg("--reference-image")
            .arg(reference)
            .arg("--transform")
            .arg(transform)
            .arg("--interpolation")
            .arg(interpolation)
            .arg("--output")
            .arg(output)
            .output()
            .map_err(|err| AbiError::Registration(err.to_string()))?;

        if result.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("antsApplyTransforms exited with {}", result.status)
        } else {
            stderr
        };
        Err(AbiError::Registration(message))
    }
}

/// Maps converted volumes into the shared reference space. Registration
/// failures are dataset-fatal and never retried.
pub struct RegistrationAdapter<R> {
    tool: R,
    config: RegistrationConfig,
}

impl<R: RegistrationTool> RegistrationAdapter<R> {
    pub fn new(tool: R, config: RegistrationConfig) -> Self {
        Self { tool, config }
    }

    pub fn register(
        &self,
        input: &Utf8Path,
        tier: ResolutionTier,
    ) -> Result<Utf8PathBuf, AbiError> {
        let output = registered_output_path(input, tier.target_um())?;
        let reference = self.config.reference_for(tier);
        info!(input = %input, reference = %reference, output = %output, "registering volume");

        self.tool.apply(
            input.as_std_path(),
            reference.as_std_path(),
            self.config.transform.as_std_path(),
            &self.config.interpolation,
            output.as_std_path(),
        )?;

        if !output.as_std_path().exists() {
            return Err(AbiError::Registration(format!(
                "tool produced no output at {output}"
            )));
        }
        Ok(output)
    }
}

/// Output path for a registered volume: the `<n>um` token of the stem is
/// replaced with the target resolution (or appended when absent) and the
/// reference-space suffix is added.
pub fn registered_output_path(input: &Utf8Path, target_um: u32) -> Result<Utf8PathBuf, AbiError> {
    let name = input
        .file_name()
        .ok_or_else(|| AbiError::Filesystem(format!("bad path: {input}")))?;
    let stem = name.trim_end_matches(".gz").trim_end_matches(".nii");

    let mut tokens: Vec<String> = stem.split('_').map(str::to_string).collect();
    let mut replaced = false;
    for token in &mut tokens {
        if token.contains("um") {
            *token = format!("{target_um}um");
            replaced = true;
        }
    }
    if !replaced {
        tokens.push(format!("{target_um}um"));
    }

    let new_name = format!("{}_2dsurqec.nii.gz", tokens.join("_"));
    Ok(input.with_file_name(new_name))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let candidate = path.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}
