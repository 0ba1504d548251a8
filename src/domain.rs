use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MolidError;

/// Resolved compound properties, keyed by PubChem property name.
pub type PropertyMap = BTreeMap<String, Value>;

pub const INCHIKEY_LEN: usize = 27;
pub const INCHIKEY_PREFIX_LEN: usize = 14;

/// A structurally valid standard InChIKey (`XXXXXXXXXXXXXX-YYYYYYYYFV-P`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InchiKey(String);

impl InchiKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The connectivity layer: always the first 14 characters.
    pub fn prefix(&self) -> &str {
        &self.0[..INCHIKEY_PREFIX_LEN]
    }

    /// Connectivity-only queries carry just the 14-character skeleton block.
    pub fn is_prefix(value: &str) -> bool {
        value.len() == INCHIKEY_PREFIX_LEN && value.bytes().all(|b| b.is_ascii_uppercase())
    }
}

impl fmt::Display for InchiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InchiKey {
    type Err = MolidError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().strip_prefix("InChIKey=").unwrap_or(value.trim());
        let bytes = normalized.as_bytes();
        let is_valid = bytes.len() == INCHIKEY_LEN
            && bytes.iter().enumerate().all(|(idx, b)| match idx {
                14 | 25 => *b == b'-',
                _ => b.is_ascii_uppercase(),
            });
        if !is_valid {
            return Err(MolidError::InvalidInchiKey(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for InchiKey {
    type Error = MolidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InchiKey> for String {
    fn from(value: InchiKey) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IdType {
    Inchikey,
    Inchi,
    Smiles,
    Cid,
    Name,
    Molecularformula,
    Cas,
}

impl IdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdType::Inchikey => "inchikey",
            IdType::Inchi => "inchi",
            IdType::Smiles => "smiles",
            IdType::Cid => "cid",
            IdType::Name => "name",
            IdType::Molecularformula => "molecularformula",
            IdType::Cas => "cas",
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IdType {
    type Err = MolidError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inchikey" => Ok(IdType::Inchikey),
            "inchi" => Ok(IdType::Inchi),
            "smiles" => Ok(IdType::Smiles),
            "cid" => Ok(IdType::Cid),
            "name" => Ok(IdType::Name),
            "molecularformula" | "formula" => Ok(IdType::Molecularformula),
            "cas" => Ok(IdType::Cas),
            _ => Err(MolidError::InvalidIdType(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SearchMode {
    OfflineBasic,
    OfflineAdvanced,
    OnlineOnly,
    OnlineCached,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::OfflineBasic => "offline-basic",
            SearchMode::OfflineAdvanced => "offline-advanced",
            SearchMode::OnlineOnly => "online-only",
            SearchMode::OnlineCached => "online-cached",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = MolidError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "offline-basic" => Ok(SearchMode::OfflineBasic),
            "offline-advanced" => Ok(SearchMode::OfflineAdvanced),
            "online-only" => Ok(SearchMode::OnlineOnly),
            "online-cached" => Ok(SearchMode::OnlineCached),
            _ => Err(MolidError::InvalidMode(value.to_string())),
        }
    }
}

/// Where a resolved payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Offline,
    Cache,
    Api,
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceTag::Offline => write!(f, "offline"),
            SourceTag::Cache => write!(f, "cache"),
            SourceTag::Api => write!(f, "api"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveManifestEntry {
    pub name: String,
    pub size: Option<u64>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedArchiveRecord {
    pub archive_name: String,
    pub ingested_at: String,
    pub row_count: u64,
}

impl ProcessedArchiveRecord {
    pub fn now(archive_name: &str, row_count: u64) -> Self {
        Self {
            archive_name: archive_name.to_string(),
            ingested_at: chrono::Utc::now().to_rfc3339(),
            row_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompoundRecord {
    pub cid: Option<i64>,
    pub title: Option<String>,
    pub iupac_name: Option<String>,
    pub formula: Option<String>,
    pub smiles: Option<String>,
    pub inchi: Option<String>,
    pub inchikey: InchiKey,
    pub exact_mass: Option<String>,
    pub molecular_weight: Option<String>,
    pub monoisotopic_mass: Option<String>,
}

impl CompoundRecord {
    pub fn new(inchikey: InchiKey) -> Self {
        Self {
            cid: None,
            title: None,
            iupac_name: None,
            formula: None,
            smiles: None,
            inchi: None,
            inchikey,
            exact_mass: None,
            molecular_weight: None,
            monoisotopic_mass: None,
        }
    }

    pub fn inchikey14(&self) -> &str {
        self.inchikey.prefix()
    }

    pub fn to_properties(&self) -> PropertyMap {
        let mut map = PropertyMap::new();
        if let Some(cid) = self.cid {
            map.insert("CID".to_string(), Value::from(cid));
        }
        let text_fields = [
            ("Title", &self.title),
            ("IUPACName", &self.iupac_name),
            ("MolecularFormula", &self.formula),
            ("SMILES", &self.smiles),
            ("InChI", &self.inchi),
            ("ExactMass", &self.exact_mass),
            ("MolecularWeight", &self.molecular_weight),
            ("MonoisotopicMass", &self.monoisotopic_mass),
        ];
        for (key, value) in text_fields {
            if let Some(value) = value {
                map.insert(key.to_string(), Value::from(value.as_str()));
            }
        }
        map.insert(
            "InChIKey".to_string(),
            Value::from(self.inchikey.as_str()),
        );
        map.insert("InChIKey14".to_string(), Value::from(self.inchikey14()));
        map
    }
}

/// Reorders a molecular formula into Hill notation (C, H, then alphabetical).
pub fn canonical_formula(formula: &str) -> String {
    let compact: String = formula.chars().filter(|ch| !ch.is_whitespace()).collect();
    let mut counts = BTreeMap::<String, u64>::new();
    let chars: Vec<char> = compact.chars().collect();
    let mut idx = 0;
    while idx < chars.len() {
        if !chars[idx].is_ascii_uppercase() {
            idx += 1;
            continue;
        }
        let mut element = chars[idx].to_string();
        idx += 1;
        if idx < chars.len() && chars[idx].is_ascii_lowercase() {
            element.push(chars[idx]);
            idx += 1;
        }
        let start = idx;
        while idx < chars.len() && chars[idx].is_ascii_digit() {
            idx += 1;
        }
        let count = chars[start..idx]
            .iter()
            .collect::<String>()
            .parse::<u64>()
            .unwrap_or(1);
        *counts.entry(element).or_insert(0) += count;
    }

    let mut ordered = Vec::new();
    if counts.contains_key("C") {
        ordered.push("C".to_string());
        if counts.contains_key("H") {
            ordered.push("H".to_string());
        }
        ordered.extend(
            counts
                .keys()
                .filter(|element| element.as_str() != "C" && element.as_str() != "H")
                .cloned(),
        );
    } else {
        ordered.extend(counts.keys().cloned());
    }

    ordered
        .into_iter()
        .map(|element| match counts[&element] {
            1 => element,
            n => format!("{element}{n}"),
        })
        .collect()
}
