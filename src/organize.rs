use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{info, warn};

use crate::archive;
use crate::domain::{ExperimentMetadata, bids_label, structure_dir_name};
use crate::error::AbiError;
use crate::store::Store;

/// Ordered first-letter partition used to split a dataset tree into
/// distribution-sized packages. The `p` range is handled separately because
/// it is split at the first entry naming a "Primary" structure.
const LETTER_BUCKETS: &[(&str, &str)] = &[
    ("a", "a"),
    ("bc", "b-c"),
    ("de", "d-e"),
    ("fghij", "f-j"),
    ("kl", "k-l"),
    ("m", "m"),
    ("no", "n-o"),
    ("qr", "q-r"),
    ("s", "s"),
    ("tuvwxyz", "t-z"),
];

const P_EARLY: &str = "pa-pre";
const P_LATE: &str = "pri-po";

/// Assign names to buckets. Every non-empty bucket appears in partition
/// order; names not starting with an ASCII letter are dropped (the caller
/// logs them). Within a bucket, names keep sorted order.
pub fn classify(names: &[String]) -> Vec<(&'static str, Vec<String>)> {
    let mut sorted: Vec<&String> = names.iter().collect();
    sorted.sort();

    let mut p_entries: Vec<String> = Vec::new();
    let mut buckets: Vec<(&'static str, Vec<String>)> = LETTER_BUCKETS
        .iter()
        .map(|(_, label)| (*label, Vec::new()))
        .collect();

    for name in sorted {
        let Some(first) = name.chars().next() else {
            continue;
        };
        let first = first.to_ascii_lowercase();
        if first == 'p' {
            p_entries.push(name.clone());
            continue;
        }
        if let Some(position) = LETTER_BUCKETS
            .iter()
            .position(|(letters, _)| letters.contains(first))
        {
            buckets[position].1.push(name.clone());
        }
    }

    // Split the p range at the first entry containing "Primary"; with no
    // such entry everything stays in the early half.
    let split = p_entries
        .iter()
        .position(|name| name.contains("Primary"))
        .unwrap_or(p_entries.len());
    let p_late = p_entries.split_off(split);

    let mut out = Vec::new();
    for (label, members) in buckets {
        if label == "q-r" {
            if !p_entries.is_empty() {
                out.push((P_EARLY, std::mem::take(&mut p_entries)));
            }
            if !p_late.is_empty() {
                out.push((P_LATE, p_late.clone()));
            }
        }
        if !members.is_empty() {
            out.push((label, members));
        }
    }
    out
}

/// Relocate the entries of `root` into per-bucket subdirectories and archive
/// each one, returning the archive paths in bucket order.
pub fn classify_and_archive(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, AbiError> {
    let stem = root
        .file_name()
        .ok_or_else(|| AbiError::Filesystem(format!("bad path: {root}")))?;

    let mut names = Vec::new();
    let entries =
        fs::read_dir(root.as_std_path()).map_err(|err| AbiError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| AbiError::Filesystem(err.to_string()))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !name.chars().next().map(|ch| ch.is_ascii_alphabetic()).unwrap_or(false) {
            warn!(entry = %name, "skipping entry outside the letter partition");
            continue;
        }
        names.push(name);
    }

    let mut archives = Vec::new();
    for (label, members) in classify(&names) {
        let bucket_dir = root.join(format!("{stem}_{label}"));
        Store::ensure_dir(&bucket_dir)?;
        for member in &members {
            let from = root.join(member);
            let to = bucket_dir.join(member);
            fs::rename(from.as_std_path(), to.as_std_path())
                .map_err(|err| AbiError::Filesystem(err.to_string()))?;
        }
        let archive_path = Utf8PathBuf::from(format!("{bucket_dir}.tar.gz"));
        archive::archive_dir(&bucket_dir, &archive_path)?;
        info!(bucket = label, members = members.len(), archive = %archive_path, "bucket archived");
        archives.push(archive_path);
    }
    Ok(archives)
}

/// Relocate one processed unit into the BIDS tree:
/// `bids/<structure safe-name>/seed-<ACR>_expression-<EXPR>_FLUO.nii.gz`
/// plus a JSON sidecar of the extracted metadata. Grouping by safe-name
/// spreads the tree across the letter partition and keeps the capitalized
/// `Primary` names the p-split keys on. Returns `None` when the unit has no
/// usable expression marker; such units are skipped here, never deleted.
pub fn place_bids_unit(
    bids_root: &Utf8Path,
    registered_volume: &Utf8Path,
    metadata: &ExperimentMetadata,
) -> Result<Option<Utf8PathBuf>, AbiError> {
    let Some(marker) = metadata.expression_marker() else {
        return Ok(None);
    };
    let seed = bids_label(&metadata.seed.acronym);
    let expression = bids_label(&marker);

    let structure_dir = bids_root.join(structure_dir_name(&metadata.seed.safe_name));
    let base = format!("seed-{seed}_expression-{expression}_FLUO");
    let volume_path = structure_dir.join(format!("{base}.nii.gz"));
    let sidecar_path = structure_dir.join(format!("{base}.json"));

    Store::copy_file_atomic(registered_volume, &volume_path)?;
    Store::write_json_atomic(&sidecar_path, metadata)?;
    info!(dataset_id = metadata.dataset_id, volume = %volume_path, "unit placed in bids tree");
    Ok(Some(volume_path))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::domain::SeedStructure;

    use super::*;

    fn classify_map(names: &[&str]) -> BTreeMap<&'static str, Vec<String>> {
        let owned: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        classify(&owned).into_iter().collect()
    }

    #[test]
    fn fixed_name_list_partition() {
        let buckets = classify_map(&[
            "Apple", "Bravo", "Delta", "Primary-X", "Paddle", "Sigma", "Zulu",
        ]);

        assert_eq!(buckets["a"], vec!["Apple"]);
        assert_eq!(buckets["b-c"], vec!["Bravo"]);
        assert_eq!(buckets["d-e"], vec!["Delta"]);
        assert_eq!(buckets["pa-pre"], vec!["Paddle"]);
        assert_eq!(buckets["pri-po"], vec!["Primary-X"]);
        assert_eq!(buckets["s"], vec!["Sigma"]);
        assert_eq!(buckets["t-z"], vec!["Zulu"]);
        assert_eq!(buckets.len(), 7);
    }

    #[test]
    fn p_bucket_without_primary_stays_early() {
        let buckets = classify_map(&["Paddle", "Pebble"]);
        assert_eq!(buckets["pa-pre"], vec!["Paddle", "Pebble"]);
        assert!(!buckets.contains_key("pri-po"));
    }

    #[test]
    fn p_split_keeps_sorted_order() {
        let buckets = classify_map(&["Pz", "Primary-A", "Pa", "Primary-B"]);
        assert_eq!(buckets["pa-pre"], vec!["Pa"]);
        assert_eq!(buckets["pri-po"], vec!["Primary-A", "Primary-B", "Pz"]);
    }

    #[test]
    fn bucket_order_is_stable() {
        let owned: Vec<String> = ["Zulu", "Apple", "Primary-X", "Mike"]
            .iter()
            .map(|name| name.to_string())
            .collect();
        let labels: Vec<&str> = classify(&owned).iter().map(|(label, _)| *label).collect();
        assert_eq!(labels, vec!["a", "m", "pri-po", "t-z"]);
    }

    #[test]
    fn classify_and_archive_relocates_and_bundles() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("pkg")).unwrap();
        for name in ["alpha", "mike", "4invalid"] {
            std::fs::create_dir_all(root.join(name).as_std_path()).unwrap();
            std::fs::write(root.join(name).join("data.txt").as_std_path(), b"x").unwrap();
        }

        let archives = classify_and_archive(&root).unwrap();
        assert_eq!(archives.len(), 2);
        assert!(archives[0].as_str().ends_with("pkg_a.tar.gz"));
        assert!(archives[1].as_str().ends_with("pkg_m.tar.gz"));
        assert!(root.join("pkg_a/alpha/data.txt").as_std_path().exists());
        // Entries outside the partition stay untouched.
        assert!(root.join("4invalid").as_std_path().exists());
    }

    #[test]
    fn bids_placement_uses_sanitized_labels() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let volume = root.join("v_2dsurqec.nii.gz");
        std::fs::write(volume.as_std_path(), b"volume").unwrap();

        let metadata = ExperimentMetadata {
            dataset_id: 5,
            seed: SeedStructure {
                acronym: "SSp-ll".to_string(),
                safe_name: "Primary somatosensory area".to_string(),
                injection_method: None,
                injection_quality: None,
            },
            expression_name: "Cux2-IRES-Cre-11".to_string(),
        };

        let bids_root = root.join("bids");
        let placed = place_bids_unit(&bids_root, &volume, &metadata)
            .unwrap()
            .unwrap();
        assert!(placed.as_str().ends_with(
            "bids/Primary_somatosensory_area/seed-SSpll_expression-Cux2_FLUO.nii.gz"
        ));
        let sidecar =
            bids_root.join("Primary_somatosensory_area/seed-SSpll_expression-Cux2_FLUO.json");
        let content = std::fs::read_to_string(sidecar.as_std_path()).unwrap();
        assert!(content.contains("\"dataset_id\": 5"));
    }

    #[test]
    fn bids_placement_skips_units_without_marker() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let metadata = ExperimentMetadata {
            dataset_id: 6,
            seed: SeedStructure {
                acronym: "MOp".to_string(),
                safe_name: "Primary motor area".to_string(),
                injection_method: None,
                injection_quality: None,
            },
            expression_name: "C57BL/6J-100".to_string(),
        };

        let placed =
            place_bids_unit(&root.join("bids"), &root.join("missing.nii.gz"), &metadata).unwrap();
        assert!(placed.is_none());
    }
}
