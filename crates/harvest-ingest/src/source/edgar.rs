//! SEC EDGAR document source
//!
//! For each company the submissions index is read first, then the primary
//! document of every filing of the configured form is downloaded:
//!
//! ```text
//! GET {submissions}/submissions/CIK0000320193.json
//! GET {submissions}/submissions/CIK0000320193-submissions-001.json   (older pages, if needed)
//! GET {archives}/Archives/edgar/data/320193/000032019323000106/aapl-20230930.htm
//! ```
//!
//! The index inlines only the most recent filings. Prolific filers push
//! their annual reports out of that table, so the older pages listed under
//! `filings.files` are read until the filing limit is met.
//!
//! Documents land at `<dest>/<form>/<accession>/<primary document>`.

use super::{DocumentSource, FetchError, FetchedDocument};
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use futures::StreamExt;
use harvest_common::checksum::DocumentDigest;
use harvest_common::{HarvestError, WorkItem};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Configuration for the EDGAR source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgarConfig {
    /// Base URL serving `submissions/CIK##########.json`
    pub submissions_base_url: String,

    /// Base URL serving `Archives/edgar/data/...`
    pub archives_base_url: String,

    /// Static client identity, e.g. "Example Research contact@example.org"
    pub user_agent: String,

    /// Form type to download (e.g. "10-K")
    pub form_type: String,

    /// Download at most this many filings per company, newest first
    pub filing_limit: Option<usize>,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EdgarConfig {
    fn default() -> Self {
        Self {
            submissions_base_url: "https://data.sec.gov".to_string(),
            archives_base_url: "https://www.sec.gov".to_string(),
            user_agent: String::new(),
            form_type: "10-K".to_string(),
            filing_limit: None,
            timeout_secs: 60,
        }
    }
}

impl EdgarConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.user_agent.trim().is_empty() {
            return Err("User agent cannot be empty (EDGAR requires a contact identity)".into());
        }
        if self.submissions_base_url.is_empty() || self.archives_base_url.is_empty() {
            return Err("EDGAR base URLs cannot be empty".into());
        }
        if self.form_type.trim().is_empty() {
            return Err("Form type cannot be empty".into());
        }
        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".into());
        }
        if self.filing_limit == Some(0) {
            return Err("Filing limit must be greater than 0 when set".into());
        }
        Ok(())
    }

    pub fn submissions_url(&self, cik: u64) -> String {
        format!(
            "{}/submissions/CIK{:010}.json",
            self.submissions_base_url.trim_end_matches('/'),
            cik
        )
    }

    pub fn submissions_page_url(&self, name: &str) -> String {
        format!(
            "{}/submissions/{}",
            self.submissions_base_url.trim_end_matches('/'),
            name
        )
    }

    pub fn document_url(&self, cik: u64, accession: &str, document: &str) -> String {
        format!(
            "{}/Archives/edgar/data/{}/{}/{}",
            self.archives_base_url.trim_end_matches('/'),
            cik,
            accession.replace('-', ""),
            document
        )
    }
}

#[derive(Debug, Deserialize)]
struct Submissions {
    filings: Filings,
}

#[derive(Debug, Deserialize)]
struct Filings {
    recent: FilingTable,
    #[serde(default)]
    files: Vec<FilingPage>,
}

/// An older slice of the filing history, stored as its own index file
#[derive(Debug, Deserialize)]
struct FilingPage {
    name: String,
}

/// Column-oriented filing table as served by EDGAR, both inline as
/// `filings.recent` and as the whole body of an older page
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilingTable {
    accession_number: Vec<String>,
    form: Vec<String>,
    primary_document: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilingRef {
    accession: String,
    document: String,
}

/// Pick the filings of `form` from one table, newest first as served
fn select_filings(
    recent: &FilingTable,
    form: &str,
    limit: Option<usize>,
) -> Result<Vec<FilingRef>, FetchError> {
    let rows = recent.accession_number.len();
    if recent.form.len() != rows || recent.primary_document.len() != rows {
        return Err(FetchError::Malformed(format!(
            "filing columns have mismatched lengths ({} accessions, {} forms, {} documents)",
            rows,
            recent.form.len(),
            recent.primary_document.len()
        )));
    }

    let selected = recent
        .accession_number
        .iter()
        .zip(&recent.form)
        .zip(&recent.primary_document)
        .filter(|((_, f), doc)| f.as_str() == form && !doc.is_empty())
        .map(|((accession, _), doc)| FilingRef {
            accession: accession.clone(),
            document: doc.clone(),
        })
        .take(limit.unwrap_or(usize::MAX))
        .collect();

    Ok(selected)
}

/// Reduce a server-provided name to a single safe path component
fn path_component(raw: &str) -> Result<String, FetchError> {
    let name = raw.rsplit('/').next().unwrap_or(raw).replace('\\', "_");
    if name.is_empty() || name == "." || name == ".." {
        return Err(FetchError::Malformed(format!("unusable file name {raw:?}")));
    }
    Ok(name)
}

/// EDGAR client
pub struct EdgarSource {
    client: Client,
    config: EdgarConfig,
}

impl EdgarSource {
    pub fn new(config: EdgarConfig) -> Result<Self, HarvestError> {
        config.validate().map_err(HarvestError::Config)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| HarvestError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        gate: &RateLimiter,
    ) -> Result<T, FetchError> {
        gate.acquire().await;
        debug!(%url, "Fetching submissions index");

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::from_status(response.status(), url));
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| FetchError::Malformed(format!("submissions index {url}: {e}")))
    }

    /// Collect filings of the configured form across the inline table and
    /// as many older pages as the filing limit requires
    async fn find_filings(&self, cik: u64, gate: &RateLimiter) -> Result<Vec<FilingRef>, FetchError> {
        let form = self.config.form_type.as_str();
        let limit = self.config.filing_limit;

        let index: Submissions = self.fetch_json(&self.config.submissions_url(cik), gate).await?;
        let mut filings = select_filings(&index.filings.recent, form, limit)?;

        for page in &index.filings.files {
            let remaining = match limit {
                Some(limit) if filings.len() >= limit => break,
                Some(limit) => Some(limit - filings.len()),
                None => None,
            };
            let url = self.config.submissions_page_url(&path_component(&page.name)?);
            let table: FilingTable = self.fetch_json(&url, gate).await?;
            filings.extend(select_filings(&table, form, remaining)?);
        }

        Ok(filings)
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        relative_path: PathBuf,
        gate: &RateLimiter,
    ) -> Result<FetchedDocument, FetchError> {
        gate.acquire().await;
        debug!(%url, "Downloading document");

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::from_status(response.status(), url));
        }

        let target = dest.join(&relative_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&target).await?;
        let mut digest = DocumentDigest::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            digest.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(FetchedDocument {
            relative_path,
            size: digest.len(),
            sha256: digest.finalize_hex(),
            source_url: url.to_string(),
        })
    }
}

#[async_trait]
impl DocumentSource for EdgarSource {
    async fn fetch(
        &self,
        item: &WorkItem,
        dest: &Path,
        gate: &RateLimiter,
    ) -> Result<Vec<FetchedDocument>, FetchError> {
        let filings = self.find_filings(item.registry_id, gate).await?;

        if filings.is_empty() {
            return Err(FetchError::NotFound(format!(
                "no {} filings for {} (CIK {})",
                self.config.form_type, item.key, item.registry_id
            )));
        }

        let form_dir = path_component(&self.config.form_type.replace('/', "_"))?;
        let mut documents = Vec::with_capacity(filings.len());

        for filing in &filings {
            let url = self
                .config
                .document_url(item.registry_id, &filing.accession, &filing.document);
            let relative_path = PathBuf::from(&form_dir)
                .join(path_component(&filing.accession)?)
                .join(path_component(&filing.document)?);

            documents.push(self.download(&url, dest, relative_path, gate).await?);
        }

        info!(
            entity = %item.key,
            filings = documents.len(),
            bytes = documents.iter().map(|d| d.size).sum::<u64>(),
            "Downloaded filings"
        );

        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recent(rows: &[(&str, &str, &str)]) -> FilingTable {
        FilingTable {
            accession_number: rows.iter().map(|r| r.0.to_string()).collect(),
            form: rows.iter().map(|r| r.1.to_string()).collect(),
            primary_document: rows.iter().map(|r| r.2.to_string()).collect(),
        }
    }

    #[test]
    fn test_urls() {
        let config = EdgarConfig {
            submissions_base_url: "https://data.sec.gov/".to_string(),
            ..EdgarConfig::default()
        };
        assert_eq!(
            config.submissions_url(320193),
            "https://data.sec.gov/submissions/CIK0000320193.json"
        );
        assert_eq!(
            config.submissions_page_url("CIK0000320193-submissions-001.json"),
            "https://data.sec.gov/submissions/CIK0000320193-submissions-001.json"
        );
        assert_eq!(
            config.document_url(320193, "0000320193-23-000106", "aapl-20230930.htm"),
            "https://www.sec.gov/Archives/edgar/data/320193/000032019323000106/aapl-20230930.htm"
        );
    }

    #[test]
    fn test_select_filings_filters_form_and_limit() {
        let table = recent(&[
            ("a-1", "10-Q", "q.htm"),
            ("a-2", "10-K", "k2.htm"),
            ("a-3", "10-K/A", "ka.htm"),
            ("a-4", "10-K", "k4.htm"),
            ("a-5", "10-K", ""),
        ]);

        let all = select_filings(&table, "10-K", None).unwrap();
        assert_eq!(
            all.iter().map(|f| f.accession.as_str()).collect::<Vec<_>>(),
            vec!["a-2", "a-4"]
        );

        let limited = select_filings(&table, "10-K", Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].document, "k2.htm");
    }

    #[test]
    fn test_select_filings_rejects_ragged_columns() {
        let mut table = recent(&[("a-1", "10-K", "k.htm")]);
        table.form.push("10-K".to_string());
        assert!(matches!(
            select_filings(&table, "10-K", None),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn test_index_pages_are_optional() {
        let inline_only: Submissions = serde_json::from_str(
            r#"{"filings": {"recent": {"accessionNumber": [], "form": [], "primaryDocument": []}}}"#,
        )
        .unwrap();
        assert!(inline_only.filings.files.is_empty());

        let paged: Submissions = serde_json::from_str(
            r#"{"filings": {
                "recent": {"accessionNumber": [], "form": [], "primaryDocument": []},
                "files": [{"name": "CIK0000019617-submissions-001.json", "filingCount": 2000}]
            }}"#,
        )
        .unwrap();
        assert_eq!(paged.filings.files[0].name, "CIK0000019617-submissions-001.json");
    }

    #[test]
    fn test_path_component() {
        assert_eq!(path_component("doc.htm").unwrap(), "doc.htm");
        assert_eq!(path_component("sub/doc.htm").unwrap(), "doc.htm");
        assert!(path_component("..").is_err());
        assert!(path_component("").is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(EdgarConfig::default().validate().is_err());

        let config = EdgarConfig {
            user_agent: "Example Research contact@example.org".to_string(),
            ..EdgarConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(EdgarSource::new(config).is_ok());
    }
}
