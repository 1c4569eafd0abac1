use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use crate::catalog::{self, CatalogClient, CatalogRecord, PaginationCursor};
use crate::convert;
use crate::domain::{ExperimentMetadata, ResolutionTier};
use crate::download::ResourceFetcher;
use crate::error::AbiError;
use crate::metadata;
use crate::organize;
use crate::registration::{RegistrationAdapter, RegistrationTool};
use crate::store::{Phase, StatusRecord, Store};

/// Per-phase driver over the dataset store. Catalog, download, and
/// registration backends are injected so the whole run can be exercised
/// against doubles.
pub struct Pipeline<C, F, R> {
    catalog: C,
    fetcher: F,
    registrar: RegistrationAdapter<R>,
    store: Store,
    api_base_url: String,
    page_size: u64,
    tier: ResolutionTier,
}

/// Units covered by one phase run and how many of those were carried over
/// from an earlier run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PhaseReport {
    pub completed: usize,
    pub skipped: usize,
}

impl<C, F, R> Pipeline<C, F, R>
where
    C: CatalogClient,
    F: ResourceFetcher,
    R: RegistrationTool,
{
    pub fn new(
        catalog: C,
        fetcher: F,
        registrar: RegistrationAdapter<R>,
        store: Store,
        api_base_url: String,
        page_size: u64,
        tier: ResolutionTier,
    ) -> Self {
        Self {
            catalog,
            fetcher,
            registrar,
            store,
            api_base_url,
            page_size,
            tier,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Walk the remote catalog and pull each dataset's metadata document and
    /// grid volume into `sourcedata/<id>/`. Units that already completed
    /// acquisition are left untouched.
    pub fn run_download(
        &self,
        start_row: u64,
        total_rows: Option<u64>,
    ) -> Result<PhaseReport, AbiError> {
        self.store.ensure_root()?;
        if let Err(err) = self.fetch_structure_graph() {
            warn!(error = %err, "structure graph not downloaded");
        }
        let cursor = PaginationCursor::new(self.page_size, start_row, total_rows);
        let records = catalog::fetch_all(&self.catalog, cursor)?;
        info!(datasets = records.len(), "catalog walk complete");
        self.write_dataset_ids(&records)?;

        let mut report = PhaseReport::default();
        for record in records {
            if self.store.phase_done(record.id, Phase::Acquired)? {
                report.skipped += 1;
                continue;
            }
            match self.acquire_unit(record.id) {
                Ok(()) => report.completed += 1,
                Err(err) => warn!(dataset_id = record.id, error = %err, "acquisition failed"),
            }
        }
        Ok(report)
    }

    fn acquire_unit(&self, dataset_id: u64) -> Result<(), AbiError> {
        let unit_dir = self.store.unit_source_dir(dataset_id);
        Store::ensure_dir(&unit_dir)?;

        let metadata_url = catalog::metadata_url(&self.api_base_url, dataset_id);
        let fetched = self.fetcher.fetch(&metadata_url, unit_dir.as_std_path())?;
        let xml_path = self.store.metadata_xml_path(dataset_id);
        if fetched.path != xml_path.as_std_path() {
            fs::rename(&fetched.path, xml_path.as_std_path())
                .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        }

        // A document we cannot interpret is still kept on disk; the unit
        // just carries no structured metadata and is skipped when the bids
        // tree is built.
        match metadata::extract_file(xml_path.as_std_path()) {
            Ok(extracted) => {
                Store::write_json_atomic(&self.store.metadata_json_path(dataset_id), &extracted)?;
            }
            Err(err) => {
                warn!(dataset_id, error = %err, "metadata document not usable");
            }
        }

        let grid_url =
            catalog::grid_download_url(&self.api_base_url, dataset_id, self.tier.source_um());
        let fetched = self.fetcher.fetch(&grid_url, unit_dir.as_std_path())?;
        info!(dataset_id, file = %fetched.filename, "grid volume acquired");

        self.store
            .write_status(&StatusRecord::now(dataset_id, Phase::Acquired))
    }

    /// The adult mouse structure graph in both served formats, kept next to
    /// the data tree as `structure_graph.json` / `structure_graph.xml`.
    fn fetch_structure_graph(&self) -> Result<(), AbiError> {
        for format in ["json", "xml"] {
            let target = self.store.structure_graph_path(format);
            let dest_dir = target.parent().unwrap_or_else(|| Utf8Path::new("."));
            let url = catalog::structure_graph_url(&self.api_base_url, format);
            let fetched = self.fetcher.fetch(&url, dest_dir.as_std_path())?;
            if fetched.path != target.as_std_path() {
                fs::rename(&fetched.path, target.as_std_path())
                    .map_err(|err| AbiError::Filesystem(err.to_string()))?;
            }
        }
        Ok(())
    }

    /// One dataset id per line, covering every non-failed catalog record of
    /// the walk that just completed.
    fn write_dataset_ids(&self, records: &[CatalogRecord]) -> Result<(), AbiError> {
        let mut listing = String::new();
        for record in records {
            listing.push_str(&record.id.to_string());
            listing.push('\n');
        }
        Store::write_bytes_atomic(&self.store.dataset_ids_path(), listing.as_bytes())
    }

    /// Convert and register every acquired unit into `procdata/<id>/`.
    /// Per-unit failures are logged and the unit is skipped; the phase only
    /// fails on store-level errors.
    pub fn run_process(&self) -> Result<PhaseReport, AbiError> {
        let mut report = PhaseReport::default();
        for dataset_id in Store::list_unit_ids(&self.store.sourcedata_root())? {
            if self.store.phase_done(dataset_id, Phase::Registered)? {
                report.skipped += 1;
                continue;
            }
            match self.process_unit(dataset_id) {
                Ok(()) => report.completed += 1,
                Err(err) => warn!(dataset_id, error = %err, "processing failed"),
            }
        }
        Ok(report)
    }

    fn process_unit(&self, dataset_id: u64) -> Result<(), AbiError> {
        let source_dir = self.store.unit_source_dir(dataset_id);
        let Some(nrrd_path) = Store::find_by_extension(&source_dir, "nrrd")? else {
            return Err(AbiError::Filesystem(format!(
                "no nrrd volume in {source_dir}"
            )));
        };
        let nrrd_name = nrrd_path
            .file_name()
            .ok_or_else(|| AbiError::Filesystem(format!("bad path: {nrrd_path}")))?;

        let proc_dir = self.store.unit_proc_dir(dataset_id);
        Store::ensure_dir(&proc_dir)?;
        let staged_nrrd = proc_dir.join(nrrd_name);
        Store::copy_file_atomic(&nrrd_path, &staged_nrrd)?;

        let oriented_path = convert::convert_file(staged_nrrd.as_std_path())?;
        let oriented_path = Utf8PathBuf::from_path_buf(oriented_path)
            .map_err(|path| AbiError::Filesystem(format!("non-utf8 path: {}", path.display())))?;
        self.store
            .write_status(&StatusRecord::now(dataset_id, Phase::Converted))?;

        let registered = self.registrar.register(&oriented_path, self.tier)?;
        info!(dataset_id, volume = %registered, "volume registered");

        // Only the registered volume and the metadata stay in procdata.
        fs::remove_file(staged_nrrd.as_std_path())
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        fs::remove_file(oriented_path.as_std_path())
            .map_err(|err| AbiError::Filesystem(err.to_string()))?;

        let json_path = self.store.metadata_json_path(dataset_id);
        if json_path.as_std_path().exists() {
            let name = json_path
                .file_name()
                .ok_or_else(|| AbiError::Filesystem(format!("bad path: {json_path}")))?;
            Store::copy_file_atomic(&json_path, &proc_dir.join(name))?;
        }

        self.store
            .write_status(&StatusRecord::now(dataset_id, Phase::Registered))
    }

    /// Lay registered volumes out as a bids-style tree keyed by injection
    /// structure and expression marker. Units without a usable marker or
    /// without structured metadata are skipped.
    pub fn run_bids(&self) -> Result<PhaseReport, AbiError> {
        let bids_root = self.store.bids_root();
        let mut report = PhaseReport::default();

        for dataset_id in Store::list_unit_ids(&self.store.procdata_root())? {
            let proc_dir = self.store.unit_proc_dir(dataset_id);
            let Some(metadata) = read_unit_metadata(&proc_dir, dataset_id)? else {
                warn!(dataset_id, "no structured metadata, unit left out of bids tree");
                report.skipped += 1;
                continue;
            };
            let Some(volume) = find_registered_volume(&proc_dir)? else {
                warn!(dataset_id, "no registered volume, unit left out of bids tree");
                report.skipped += 1;
                continue;
            };
            match organize::place_bids_unit(&bids_root, &volume, &metadata)? {
                Some(_) => report.completed += 1,
                None => {
                    info!(dataset_id, expression = %metadata.expression_name,
                        "no expression marker, unit left out of bids tree");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    /// Partition the bids tree into lexical buckets and archive each one.
    pub fn run_archive(&self) -> Result<Vec<Utf8PathBuf>, AbiError> {
        organize::classify_and_archive(&self.store.bids_root())
    }
}

fn read_unit_metadata(
    proc_dir: &Utf8Path,
    dataset_id: u64,
) -> Result<Option<ExperimentMetadata>, AbiError> {
    let path = proc_dir.join(format!("{dataset_id}_experiment_metadata.json"));
    if !path.as_std_path().exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| AbiError::Filesystem(err.to_string()))?;
    let metadata = serde_json::from_str(&content)
        .map_err(|err| AbiError::MalformedMetadata(err.to_string()))?;
    Ok(Some(metadata))
}

fn find_registered_volume(proc_dir: &Utf8Path) -> Result<Option<Utf8PathBuf>, AbiError> {
    let entries = fs::read_dir(proc_dir.as_std_path())
        .map_err(|err| AbiError::Filesystem(err.to_string()))?;
    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| AbiError::Filesystem(err.to_string()))?;
        if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path())
            && path.as_str().ends_with("_2dsurqec.nii.gz")
        {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches.into_iter().next())
}
