use std::fs;
use std::path::Path;
use std::time::Duration;

use camino::Utf8PathBuf;

use abi_connect::catalog::{CatalogClient, CatalogPage, CatalogRecord, PaginationCursor};
use abi_connect::domain::ResolutionTier;
use abi_connect::download::{FetchedResource, ResourceFetcher, RetryingFetcher};
use abi_connect::error::AbiError;
use abi_connect::pipeline::Pipeline;
use abi_connect::registration::{RegistrationAdapter, RegistrationConfig, RegistrationTool};
use abi_connect::store::{Phase, Store};

/// Serves one fixed page followed by empty pages, like a short listing.
struct StaticCatalog {
    records: Vec<CatalogRecord>,
}

impl CatalogClient for StaticCatalog {
    fn fetch_page(&self, cursor: &PaginationCursor) -> Result<CatalogPage, AbiError> {
        let total_rows = self.records.len() as u64;
        let msg = if cursor.start_row == 0 {
            self.records.clone()
        } else {
            Vec::new()
        };
        Ok(CatalogPage { msg, total_rows })
    }
}

/// Answers metadata urls with a SectionDataSet document and grid urls with a
/// small NRRD payload, keyed on the dataset id embedded in the url.
struct CannedApi;

impl ResourceFetcher for CannedApi {
    fn fetch(&self, url: &str, destination_dir: &Path) -> Result<FetchedResource, AbiError> {
        if let Some(rest) = url.split("query.xml?id=").nth(1) {
            let id: u64 = parse_leading_digits(rest)?;
            let filename = "query.xml".to_string();
            let path = destination_dir.join(&filename);
            fs::write(&path, experiment_xml(id))
                .map_err(|err| AbiError::Filesystem(err.to_string()))?;
            return Ok(FetchedResource { filename, path });
        }
        if let Some(rest) = url.split("download_file/").nth(1) {
            let id: u64 = parse_leading_digits(rest)?;
            let filename = format!("{id}_projection_density_100um.nrrd");
            let path = destination_dir.join(&filename);
            fs::write(&path, raw_nrrd())
                .map_err(|err| AbiError::Filesystem(err.to_string()))?;
            return Ok(FetchedResource { filename, path });
        }
        if let Some(rest) = url.split("structure_graph_download/").nth(1) {
            let filename = rest.to_string();
            let path = destination_dir.join(&filename);
            fs::write(&path, b"{\"msg\": []}")
                .map_err(|err| AbiError::Filesystem(err.to_string()))?;
            return Ok(FetchedResource { filename, path });
        }
        Err(AbiError::DownloadHttp(format!("unexpected url {url}")))
    }
}

fn parse_leading_digits(value: &str) -> Result<u64, AbiError> {
    let digits: String = value.chars().take_while(|ch| ch.is_ascii_digit()).collect();
    digits
        .parse()
        .map_err(|_| AbiError::DownloadHttp(format!("no id in {value}")))
}

/// Stands in for the external registration tool by copying input to output.
struct CopyingTool;

impl RegistrationTool for CopyingTool {
    fn apply(
        &self,
        input: &Path,
        _reference: &Path,
        _transform: &Path,
        _interpolation: &str,
        output: &Path,
    ) -> Result<(), AbiError> {
        fs::copy(input, output).map_err(|err| AbiError::Registration(err.to_string()))?;
        Ok(())
    }
}

fn experiment_xml(id: u64) -> String {
    // Three datasets carry Cre driver lines; 3003 is a wild-type specimen.
    let (specimen, acronym, safe_name) = match id {
        1001 => ("Rbp4-Cre_KL100-1001", "MOp", "Primary motor area"),
        2002 => ("Cux2-IRES-Cre-2002", "SSp-ll", "Primary somatosensory area"),
        5005 => ("Gpr26-Cre_KO250-5005", "ACA", "Anterior cingulate area"),
        _ => ("C57BL/6J-3003", "VISp", "Primary visual area"),
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response success="true">
  <section-data-sets>
    <section-data-set>
      <id>{id}</id>
      <specimen>
        <name>{specimen}</name>
        <stereotaxic-injections>
          <stereotaxic-injection>
            <primary-injection-structure>
              <acronym>{acronym}</acronym>
              <safe-name>{safe_name}</safe-name>
            </primary-injection-structure>
          </stereotaxic-injection>
        </stereotaxic-injections>
      </specimen>
    </section-data-set>
  </section-data-sets>
</Response>"#
    )
}

fn raw_nrrd() -> Vec<u8> {
    let mut bytes = b"NRRD0004\n\
type: float\n\
dimension: 3\n\
sizes: 2 2 2\n\
space directions: (100,0,0) (0,100,0) (0,0,100)\n\
encoding: raw\n\
endian: little\n\
\n"
    .to_vec();
    for value in 0..8 {
        bytes.extend_from_slice(&(value as f32).to_le_bytes());
    }
    bytes
}

fn build_pipeline(root: Utf8PathBuf) -> Pipeline<StaticCatalog, RetryingFetcher<CannedApi>, CopyingTool> {
    let catalog = StaticCatalog {
        records: vec![
            CatalogRecord {
                id: 1001,
                failed: false,
            },
            CatalogRecord {
                id: 2002,
                failed: false,
            },
            CatalogRecord {
                id: 3003,
                failed: false,
            },
            CatalogRecord {
                id: 5005,
                failed: false,
            },
            CatalogRecord {
                id: 4004,
                failed: true,
            },
        ],
    };
    let fetcher = RetryingFetcher::new(CannedApi, 3, Duration::from_millis(0));
    let registrar = RegistrationAdapter::new(CopyingTool, RegistrationConfig::default());

    Pipeline::new(
        catalog,
        fetcher,
        registrar,
        Store::new(root),
        "http://localhost".to_string(),
        50,
        ResolutionTier::Um100,
    )
}

fn workspace() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("abi-data")).unwrap();
    (temp, root)
}

#[test]
fn download_acquires_non_failed_datasets() {
    let (_temp, root) = workspace();
    let pipeline = build_pipeline(root.clone());

    let report = pipeline.run_download(0, None).unwrap();
    assert_eq!(report.completed, 4);
    assert_eq!(report.skipped, 0);

    let store = pipeline.store();
    for id in [1001, 2002, 3003, 5005] {
        assert!(store.metadata_xml_path(id).as_std_path().exists());
        assert!(store.metadata_json_path(id).as_std_path().exists());
        assert!(
            store
                .unit_source_dir(id)
                .join(format!("{id}_projection_density_100um.nrrd"))
                .as_std_path()
                .exists()
        );
        assert!(store.phase_done(id, Phase::Acquired).unwrap());
    }
    // The failed row never becomes a unit.
    assert!(!store.unit_source_dir(4004).as_std_path().exists());

    // The structure graph and the id listing land next to the data tree.
    assert!(store.structure_graph_path("json").as_std_path().exists());
    assert!(store.structure_graph_path("xml").as_std_path().exists());
    let ids = fs::read_to_string(store.dataset_ids_path().as_std_path()).unwrap();
    assert_eq!(ids, "1001\n2002\n3003\n5005\n");
}

#[test]
fn download_is_idempotent_per_unit() {
    let (_temp, root) = workspace();
    let pipeline = build_pipeline(root);

    pipeline.run_download(0, None).unwrap();
    let second = pipeline.run_download(0, None).unwrap();
    assert_eq!(second.completed, 0);
    assert_eq!(second.skipped, 4);
}

#[test]
fn process_registers_and_drops_intermediates() {
    let (_temp, root) = workspace();
    let pipeline = build_pipeline(root);

    pipeline.run_download(0, None).unwrap();
    let report = pipeline.run_process().unwrap();
    assert_eq!(report.completed, 4);

    let store = pipeline.store();
    for id in [1001, 2002, 3003, 5005] {
        let proc_dir = store.unit_proc_dir(id);
        assert!(
            proc_dir
                .join(format!("{id}_projection_density_200um_2dsurqec.nii.gz"))
                .as_std_path()
                .exists()
        );
        // Intermediates are gone, metadata travels along.
        assert!(
            !proc_dir
                .join(format!("{id}_projection_density_100um.nrrd"))
                .as_std_path()
                .exists()
        );
        assert!(
            !proc_dir
                .join(format!("{id}_projection_density_100um.nii"))
                .as_std_path()
                .exists()
        );
        assert!(
            proc_dir
                .join(format!("{id}_experiment_metadata.json"))
                .as_std_path()
                .exists()
        );
        assert!(store.phase_done(id, Phase::Registered).unwrap());
    }
}

#[test]
fn bids_tree_holds_only_marked_expressions() {
    let (_temp, root) = workspace();
    let pipeline = build_pipeline(root);

    pipeline.run_download(0, None).unwrap();
    pipeline.run_process().unwrap();
    let report = pipeline.run_bids().unwrap();
    assert_eq!(report.completed, 3);
    assert_eq!(report.skipped, 1);

    let bids = pipeline.store().bids_root();
    let placed = [
        ("Primary_motor_area", "MOp", "Rbp4"),
        ("Primary_somatosensory_area", "SSpll", "Cux2"),
        ("Anterior_cingulate_area", "ACA", "Gpr26"),
    ];
    for (structure, seed, expression) in placed {
        let base = format!("{structure}/seed-{seed}_expression-{expression}_FLUO");
        assert!(bids.join(format!("{base}.nii.gz")).as_std_path().exists());
        assert!(bids.join(format!("{base}.json")).as_std_path().exists());
    }
    // The wild-type specimen has no expression marker and stays out.
    assert!(!bids.join("Primary_visual_area").as_std_path().exists());
}

#[test]
fn archive_buckets_the_bids_tree() {
    let (_temp, root) = workspace();
    let pipeline = build_pipeline(root);

    pipeline.run_download(0, None).unwrap();
    pipeline.run_process().unwrap();
    pipeline.run_bids().unwrap();
    let archives = pipeline.run_archive().unwrap();

    // The Anterior structure fills the a bucket; both Primary structures
    // fall in the late half of the p range.
    assert_eq!(archives.len(), 2);
    assert!(archives[0].as_str().ends_with("bids_a.tar.gz"));
    assert!(archives[1].as_str().ends_with("bids_pri-po.tar.gz"));
    for archive in &archives {
        assert!(archive.as_std_path().exists());
    }

    let bids = pipeline.store().bids_root();
    assert!(
        bids.join("bids_a/Anterior_cingulate_area")
            .as_std_path()
            .exists()
    );
    let late = bids.join("bids_pri-po");
    assert!(late.join("Primary_motor_area").as_std_path().exists());
    assert!(late.join("Primary_somatosensory_area").as_std_path().exists());
}
