use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

use crate::error::AbiError;

pub const DEFAULT_API_BASE: &str = "http://api.brain-map.org";

const CATALOG_CRITERIA: &str = "criteria=model::SectionDataSet,rma::criteria,\
products%5Bid$eq5%5D,rma::include,\
specimen(stereotaxic_injections(primary_injection_structure,structures))";

/// One row of the remote SectionDataSet listing.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogRecord {
    pub id: u64,
    pub failed: bool,
}

/// One page of the listing plus the authoritative row count.
#[derive(Debug, Deserialize)]
pub struct CatalogPage {
    pub msg: Vec<CatalogRecord>,
    pub total_rows: u64,
}

/// Restartable position within the paged listing. `total_rows` is unknown
/// until the first page response resolves it.
#[derive(Debug, Clone, Copy)]
pub struct PaginationCursor {
    pub start_row: u64,
    pub page_size: u64,
    pub total_rows: Option<u64>,
}

impl PaginationCursor {
    pub fn new(page_size: u64, start_row: u64, total_rows: Option<u64>) -> Self {
        Self {
            start_row,
            page_size,
            total_rows,
        }
    }
}

pub trait CatalogClient: Send + Sync {
    fn fetch_page(&self, cursor: &PaginationCursor) -> Result<CatalogPage, AbiError>;
}

#[derive(Clone)]
pub struct CatalogHttpClient {
    client: Client,
    base_url: String,
}

impl CatalogHttpClient {
    pub fn new(base_url: &str) -> Result<Self, AbiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("abi-connect/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AbiError::CatalogHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| AbiError::CatalogHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl CatalogClient for CatalogHttpClient {
    fn fetch_page(&self, cursor: &PaginationCursor) -> Result<CatalogPage, AbiError> {
        let url = catalog_page_url(&self.base_url, cursor);
        debug!(url = %url, "catalog page request");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| AbiError::CatalogHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "catalog request failed".to_string());
            return Err(AbiError::CatalogStatus { status, message });
        }
        response
            .json::<CatalogPage>()
            .map_err(|err| AbiError::CatalogHttp(err.to_string()))
    }
}

pub fn catalog_page_url(base_url: &str, cursor: &PaginationCursor) -> String {
    format!(
        "{base_url}/api/v2/data/query.json?{CATALOG_CRITERIA}&start_row={}&num_rows={}",
        cursor.start_row, cursor.page_size
    )
}

pub fn metadata_url(base_url: &str, dataset_id: u64) -> String {
    format!(
        "{base_url}/api/v2/data/SectionDataSet/query.xml?id={dataset_id}\
&include=specimen(stereotaxic_injections(primary_injection_structure,structures))"
    )
}

pub fn grid_download_url(base_url: &str, dataset_id: u64, resolution_um: u32) -> String {
    format!(
        "{base_url}/grid_data/download_file/{dataset_id}\
?image=projection_density&resolution={resolution_um}"
    )
}

/// The adult mouse structure graph, as json or xml.
pub fn structure_graph_url(base_url: &str, format: &str) -> String {
    format!("{base_url}/api/v2/structure_graph_download/1.{format}")
}

/// Drive the cursor until the listing is exhausted, yielding the non-failed
/// records in page order. A page that delivers zero new records while rows
/// remain means the server stopped making progress; that is an error, not a
/// reason to loop.
pub fn fetch_all<C: CatalogClient>(
    client: &C,
    mut cursor: PaginationCursor,
) -> Result<Vec<CatalogRecord>, AbiError> {
    let mut records = Vec::new();

    loop {
        let page = client.fetch_page(&cursor)?;
        if cursor.total_rows.is_none() {
            cursor.total_rows = Some(page.total_rows);
        }
        let total_rows = cursor.total_rows.unwrap_or(0);

        if page.msg.is_empty() {
            if cursor.start_row >= total_rows {
                break;
            }
            return Err(AbiError::CatalogStalled {
                start_row: cursor.start_row,
                total_rows,
            });
        }

        cursor.start_row += page.msg.len() as u64;
        for record in page.msg {
            if !record.failed {
                records.push(record);
            }
        }

        if cursor.start_row >= total_rows {
            break;
        }
    }

    debug!(count = records.len(), "catalog listing complete");
    Ok(records)
}
