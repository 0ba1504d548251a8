use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{IdType, PropertyMap};
use crate::error::MolidError;

pub const PUBCHEM_REST_URL: &str = "https://pubchem.ncbi.nlm.nih.gov/rest/";

const PROPERTIES: &[&str] = &[
    "Title",
    "IUPACName",
    "MolecularFormula",
    "MolecularWeight",
    "InChI",
    "InChIKey",
    "ConnectivitySMILES",
    "SMILES",
    "XLogP",
    "ExactMass",
    "MonoisotopicMass",
    "TPSA",
    "Complexity",
    "Charge",
];

const NUMERIC_PROPERTIES: &[&str] = &["MolecularWeight", "ExactMass", "MonoisotopicMass"];

const IUPAC_HEADINGS: &[&str] = &["Preferred IUPAC Name", "IUPAC Name", "Systematic Name"];

static CAS_RN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<head>\d{2,7})-(?P<mid>\d{2})-(?P<check>\d)$").expect("CAS pattern is valid")
});

/// Remote identifier resolution. Every failure, including "no such compound",
/// comes back as `MolidError::RemoteLookup`.
pub trait RemoteResolver {
    fn resolve(&self, identifier: &str, id_type: IdType) -> Result<PropertyMap, MolidError>;
}

#[derive(Clone)]
pub struct PubchemHttpClient {
    client: Client,
    base_url: Url,
    retry_delay: Duration,
}

impl PubchemHttpClient {
    pub fn new() -> Result<Self, MolidError> {
        Self::with_base_url(PUBCHEM_REST_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, MolidError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("molid/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MolidError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| MolidError::RemoteLookup {
                identifier: String::new(),
                reason: err.to_string(),
            })?;
        let base_url = Url::parse(base_url).map_err(|err| MolidError::RemoteLookup {
            identifier: String::new(),
            reason: format!("invalid base URL {base_url}: {err}"),
        })?;
        Ok(Self {
            client,
            base_url,
            retry_delay: Duration::from_millis(200),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, String> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| format!("base URL cannot take a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, String>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(self.retry_delay * (attempt as u32 + 1));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(self.retry_delay * (attempt as u32 + 1));
                        attempt += 1;
                        continue;
                    }
                    return Err(err.to_string());
                }
            }
        }
    }

    /// `Ok(None)` on 404, which PubChem uses for "no match".
    fn get_json(&self, url: Url) -> Result<Option<Value>, String> {
        debug!(%url, "PubChem request");
        let response = self.send_with_retries(|| self.client.get(url.clone()))?;
        let status = response.status().as_u16();
        if status == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(format!("PubChem returned status {status}"));
        }
        response
            .json::<Value>()
            .map(Some)
            .map_err(|err| format!("malformed PubChem response: {err}"))
    }

    fn resolve_cids(&self, identifier: &str, id_type: IdType) -> Result<Vec<i64>, String> {
        let mut segments = vec!["pug", "compound"];
        segments.extend(namespace(id_type).split('/'));
        segments.extend([identifier.trim(), "cids", "JSON"]);
        let Some(body) = self.get_json(self.endpoint(&segments)?)? else {
            return Ok(Vec::new());
        };
        let cids = body
            .pointer("/IdentifierList/CID")
            .or_else(|| body.pointer("/InformationList/Information/0/CID"));
        Ok(match cids {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
            Some(value) => value.as_i64().into_iter().collect(),
            None => Vec::new(),
        })
    }

    fn fetch_properties(&self, cid: i64) -> Result<Option<PropertyMap>, String> {
        let cid = cid.to_string();
        let properties = PROPERTIES.join(",");
        let url = self.endpoint(&["pug", "compound", "cid", &cid, "property", &properties, "JSON"])?;
        let Some(body) = self.get_json(url)? else {
            return Ok(None);
        };
        let record = body
            .pointer("/PropertyTable/Properties/0")
            .and_then(Value::as_object)
            .map(|object| {
                object
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect::<PropertyMap>()
            });
        Ok(record.map(coerce_numeric))
    }

    /// Enrichment only: any failure here is logged and ignored.
    fn fetch_iupac_name(&self, cid: i64) -> Option<String> {
        let cid = cid.to_string();
        let segments = ["pug_view", "data", "compound", cid.as_str(), "JSON"];

        if let Ok(mut url) = self.endpoint(&segments) {
            url.query_pairs_mut().append_pair("heading", "IUPAC Name");
            match self.get_json(url) {
                Ok(Some(body)) => {
                    if let Some(name) = iupac_from_record(&body) {
                        return Some(name);
                    }
                }
                Ok(None) => {}
                Err(reason) => debug!(cid = %cid, %reason, "heading-filtered PUG-View failed"),
            }
        }

        match self.endpoint(&segments).and_then(|url| self.get_json(url)) {
            Ok(Some(body)) => iupac_from_record(&body),
            Ok(None) => None,
            Err(reason) => {
                warn!(cid = %cid, %reason, "PUG-View record unavailable");
                None
            }
        }
    }

    fn fetch_registry_numbers(&self, cid: i64) -> Vec<String> {
        let cid = cid.to_string();
        let body = match self
            .endpoint(&["pug", "compound", "cid", &cid, "xrefs", "RN", "JSON"])
            .and_then(|url| self.get_json(url))
        {
            Ok(Some(body)) => body,
            Ok(None) => return Vec::new(),
            Err(reason) => {
                debug!(cid = %cid, %reason, "registry numbers unavailable");
                return Vec::new();
            }
        };
        match body.pointer("/InformationList/Information/0/RN") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(rn)) => vec![rn.clone()],
            _ => Vec::new(),
        }
    }

    fn lookup(&self, identifier: &str, id_type: IdType) -> Result<PropertyMap, String> {
        let cid = if id_type == IdType::Cid {
            identifier
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("invalid CID value: {identifier}"))?
        } else {
            *self
                .resolve_cids(identifier, id_type)?
                .first()
                .ok_or_else(|| "no PubChem compound matches".to_string())?
        };

        let mut record = self
            .fetch_properties(cid)?
            .ok_or_else(|| format!("no properties for CID {cid}"))?;
        record.entry("CID".to_string()).or_insert(Value::from(cid));

        let has_iupac = record
            .get("IUPACName")
            .and_then(Value::as_str)
            .is_some_and(|name| !name.trim().is_empty());
        if !has_iupac {
            let fallback = self
                .fetch_iupac_name(cid)
                .or_else(|| record.get("Title").and_then(Value::as_str).map(str::to_string));
            if let Some(name) = fallback {
                record.insert("IUPACName".to_string(), Value::from(name));
            }
        }

        let registry_numbers = self.fetch_registry_numbers(cid);
        if let Some(cas) = pick_cas(&registry_numbers) {
            record.insert("CAS".to_string(), Value::from(cas));
        }
        if id_type == IdType::Cas {
            record
                .entry("CAS".to_string())
                .or_insert(Value::from(identifier.trim()));
        }
        Ok(record)
    }
}

impl RemoteResolver for PubchemHttpClient {
    fn resolve(&self, identifier: &str, id_type: IdType) -> Result<PropertyMap, MolidError> {
        self.lookup(identifier, id_type)
            .map_err(|reason| MolidError::RemoteLookup {
                identifier: identifier.to_string(),
                reason,
            })
    }
}

fn namespace(id_type: IdType) -> &'static str {
    match id_type {
        IdType::Molecularformula => "fastformula",
        IdType::Cas => "xref/rn",
        other => other.as_str(),
    }
}

fn coerce_numeric(mut record: PropertyMap) -> PropertyMap {
    for key in NUMERIC_PROPERTIES {
        let parsed = record
            .get(*key)
            .and_then(Value::as_str)
            .and_then(|text| text.parse::<f64>().ok());
        if let Some(number) = parsed {
            record.insert(key.to_string(), Value::from(number));
        }
    }
    record
}

/// Prefers a checksum-valid CAS number, otherwise the first listed one.
fn pick_cas(registry_numbers: &[String]) -> Option<String> {
    registry_numbers
        .iter()
        .find(|rn| is_cas_rn(rn))
        .or_else(|| registry_numbers.first())
        .cloned()
}

/// CAS Registry Number format and check digit.
pub fn is_cas_rn(candidate: &str) -> bool {
    let Some(caps) = CAS_RN.captures(candidate.trim()) else {
        return false;
    };
    let digits = format!("{}{}", &caps["head"], &caps["mid"]);
    let checksum: u32 = digits
        .chars()
        .rev()
        .enumerate()
        .filter_map(|(idx, ch)| ch.to_digit(10).map(|digit| digit * (idx as u32 + 1)))
        .sum();
    caps["check"].parse::<u32>().ok() == Some(checksum % 10)
}

/// Walks PUG-View sections for the first IUPAC-style name.
pub fn iupac_from_record(payload: &Value) -> Option<String> {
    payload
        .pointer("/Record/Section")
        .and_then(Value::as_array)
        .and_then(|sections| walk_sections(sections))
}

fn walk_sections(sections: &[Value]) -> Option<String> {
    for section in sections {
        let information = section
            .get("Information")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let heading_matches = section
            .get("TOCHeading")
            .and_then(Value::as_str)
            .is_some_and(|heading| IUPAC_HEADINGS.contains(&heading));
        for info in information {
            let name_matches = info
                .get("Name")
                .and_then(Value::as_str)
                .is_some_and(|name| IUPAC_HEADINGS.contains(&name));
            if heading_matches || name_matches {
                if let Some(value) = information_string(info) {
                    return Some(value);
                }
            }
        }
        if let Some(found) = section
            .get("Section")
            .and_then(Value::as_array)
            .and_then(|children| walk_sections(children))
        {
            return Some(found);
        }
    }
    None
}

fn information_string(info: &Value) -> Option<String> {
    let value = info.get("Value")?;
    let markup = value
        .pointer("/StringWithMarkup/0/String")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty());
    if let Some(text) = markup {
        return Some(text.to_string());
    }
    value
        .get("StringList")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
