use std::fs;
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::domain::{ExperimentMetadata, SeedStructure};
use crate::error::AbiError;

/// Parse one SectionDataSet XML document into a structured record.
///
/// Each required field must match exactly once; zero or multiple matches is
/// an error, never a silent first/default choice. Field selectors are
/// parent-qualified so nested `structure` ids and acronyms do not collide
/// with the fields we want.
pub fn extract(xml: &str) -> Result<ExperimentMetadata, AbiError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut dataset_ids = Vec::new();
    let mut safe_names = Vec::new();
    let mut acronyms = Vec::new();
    let mut specimen_names = Vec::new();
    let mut injection_method = None;
    let mut injection_quality = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                path.push(name);
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(ref e)) => {
                let Ok(text) = e.unescape() else { continue };
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                match (parent(&path, 1), parent(&path, 0)) {
                    (Some("section-data-set"), Some("id")) => {
                        dataset_ids.push(text.to_string());
                    }
                    (Some("primary-injection-structure"), Some("safe-name")) => {
                        safe_names.push(text.to_string());
                    }
                    (Some("primary-injection-structure"), Some("acronym")) => {
                        acronyms.push(text.to_string());
                    }
                    (Some("specimen"), Some("name")) => {
                        specimen_names.push(text.to_string());
                    }
                    (_, Some("injection-method")) => {
                        injection_method.get_or_insert_with(|| text.to_string());
                    }
                    (_, Some("injection-quality")) => {
                        injection_quality.get_or_insert_with(|| text.to_string());
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(AbiError::MalformedMetadata(format!("xml parse error: {err}")));
            }
            _ => {}
        }
    }

    let id_text = exactly_one(dataset_ids, "section-data-set/id")?;
    let dataset_id = id_text
        .parse::<u64>()
        .map_err(|_| AbiError::MalformedMetadata(format!("non-numeric dataset id: {id_text}")))?;

    Ok(ExperimentMetadata {
        dataset_id,
        seed: SeedStructure {
            acronym: exactly_one(acronyms, "primary-injection-structure/acronym")?,
            safe_name: exactly_one(safe_names, "primary-injection-structure/safe-name")?,
            injection_method,
            injection_quality,
        },
        expression_name: exactly_one(specimen_names, "specimen/name")?,
    })
}

pub fn extract_file(path: &Path) -> Result<ExperimentMetadata, AbiError> {
    let xml = fs::read_to_string(path).map_err(|err| AbiError::Filesystem(err.to_string()))?;
    extract(&xml)
}

fn parent(path: &[String], depth_from_leaf: usize) -> Option<&str> {
    path.len()
        .checked_sub(depth_from_leaf + 1)
        .map(|index| path[index].as_str())
}

fn exactly_one(mut matches: Vec<String>, field: &str) -> Result<String, AbiError> {
    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(AbiError::MalformedMetadata(format!("missing field {field}"))),
        n => Err(AbiError::MalformedMetadata(format!(
            "expected exactly one {field}, found {n}"
        ))),
    }
}
