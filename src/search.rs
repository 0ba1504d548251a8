use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheStore};
use crate::config::SearchConfiguration;
use crate::domain::{
    CompoundRecord, IdType, InchiKey, PropertyMap, SearchMode, SourceTag, canonical_formula,
};
use crate::error::MolidError;
use crate::pubchem::RemoteResolver;
use crate::store::{CompoundColumn, MasterStore};
use crate::structure::{Geometry, StructureConverter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub identifier: String,
    pub id_type: IdType,
}

impl Query {
    pub fn new(identifier: impl Into<String>, id_type: IdType) -> Self {
        Self {
            identifier: identifier.into(),
            id_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub records: Vec<PropertyMap>,
    pub source: SourceTag,
}

/// Answers identifier queries according to one fixed search mode.
pub struct SearchEngine<R: RemoteResolver, C: StructureConverter> {
    config: SearchConfiguration,
    master: Option<MasterStore>,
    cache: Option<CacheStore>,
    remote: R,
    converter: C,
}

impl<R: RemoteResolver, C: StructureConverter> fmt::Debug for SearchEngine<R, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchEngine")
            .field("mode", &self.config.mode)
            .field("master", &self.master.as_ref().map(MasterStore::path))
            .field("cache", &self.cache.as_ref().map(CacheStore::path))
            .finish_non_exhaustive()
    }
}

impl<R: RemoteResolver, C: StructureConverter> SearchEngine<R, C> {
    /// Opens only the stores the mode uses. Offline modes fail fast when the
    /// master store is absent.
    pub fn new(config: SearchConfiguration, remote: R, converter: C) -> Result<Self, MolidError> {
        let (master, cache) = match config.mode {
            SearchMode::OfflineBasic | SearchMode::OfflineAdvanced => (
                Some(MasterStore::open(
                    config.master_db.as_std_path(),
                    config.mode.as_str(),
                )?),
                None,
            ),
            SearchMode::OnlineOnly => (None, None),
            SearchMode::OnlineCached => (None, Some(CacheStore::open(config.cache_db.as_std_path())?)),
        };
        debug!(mode = %config.mode, "search engine ready");
        Ok(Self {
            config,
            master,
            cache,
            remote,
            converter,
        })
    }

    pub fn mode(&self) -> SearchMode {
        self.config.mode
    }

    /// `Ok(None)` means an offline mode found nothing. Online misses surface as
    /// `MolidError::RemoteLookup`.
    pub fn resolve(&mut self, query: &Query) -> Result<Option<Resolution>, MolidError> {
        let identifier = query.identifier.trim();
        if identifier.is_empty() {
            return Err(MolidError::InvalidQuery("empty identifier".to_string()));
        }
        info!(mode = %self.config.mode, id_type = %query.id_type, identifier, "resolving");
        match self.config.mode {
            SearchMode::OfflineBasic => self.resolve_offline_basic(identifier, query.id_type),
            SearchMode::OfflineAdvanced => self.resolve_offline_advanced(identifier, query.id_type),
            SearchMode::OnlineOnly => self.resolve_online_only(identifier, query.id_type).map(Some),
            SearchMode::OnlineCached => {
                self.resolve_online_cached(identifier, query.id_type).map(Some)
            }
        }
    }

    /// Searches by the InChIKey computed from a 3D structure.
    pub fn resolve_geometry(&mut self, geometry: &Geometry) -> Result<Option<Resolution>, MolidError> {
        let inchikey = self.converter.structure_to_inchikey(geometry)?;
        debug!(%inchikey, "structure converted");
        self.resolve(&Query::new(inchikey.as_str(), IdType::Inchikey))
    }

    fn master(&self) -> Result<&MasterStore, MolidError> {
        self.master.as_ref().ok_or_else(|| MolidError::MissingStore {
            path: self.config.master_db.clone().into_std_path_buf(),
            required_by: self.config.mode.as_str().to_string(),
        })
    }

    fn resolve_offline_basic(
        &self,
        identifier: &str,
        id_type: IdType,
    ) -> Result<Option<Resolution>, MolidError> {
        let master = self.master()?;
        let records = match id_type {
            IdType::Inchikey if InchiKey::is_prefix(identifier) => {
                master.lookup_prefix(identifier)?
            }
            IdType::Inchikey => lookup_key(master, &identifier.parse()?)?,
            IdType::Inchi | IdType::Smiles => {
                let inchikey = self.converter.identifier_to_inchikey(identifier, id_type)?;
                debug!(%inchikey, "identifier converted");
                lookup_key(master, &inchikey)?
            }
            other => return Err(self.unsupported(other)),
        };
        Ok(offline_resolution(records))
    }

    fn resolve_offline_advanced(
        &self,
        identifier: &str,
        id_type: IdType,
    ) -> Result<Option<Resolution>, MolidError> {
        let (column, value) = match id_type {
            IdType::Cid => {
                let cid = identifier
                    .parse::<i64>()
                    .map_err(|_| MolidError::InvalidQuery(format!("CID is not a number: {identifier}")))?;
                (CompoundColumn::Cid, cid.to_string())
            }
            IdType::Name => (CompoundColumn::Title, identifier.to_string()),
            IdType::Smiles => (CompoundColumn::Smiles, identifier.to_string()),
            IdType::Inchi => (CompoundColumn::Inchi, identifier.to_string()),
            IdType::Inchikey if InchiKey::is_prefix(identifier) => {
                (CompoundColumn::Inchikey14, identifier.to_string())
            }
            IdType::Inchikey => (
                CompoundColumn::Inchikey,
                identifier.parse::<InchiKey>()?.as_str().to_string(),
            ),
            IdType::Molecularformula => (CompoundColumn::Formula, canonical_formula(identifier)),
            IdType::Cas => return Err(self.unsupported(id_type)),
        };
        let records = self.master()?.lookup_filtered(&[(column, value)])?;
        Ok(offline_resolution(records))
    }

    fn resolve_online_only(
        &self,
        identifier: &str,
        id_type: IdType,
    ) -> Result<Resolution, MolidError> {
        let record = self.remote.resolve(identifier, id_type)?;
        Ok(Resolution {
            records: vec![record],
            source: SourceTag::Api,
        })
    }

    fn resolve_online_cached(
        &mut self,
        identifier: &str,
        id_type: IdType,
    ) -> Result<Resolution, MolidError> {
        let cache = self.cache.as_mut().ok_or_else(|| MolidError::MissingStore {
            path: self.config.cache_db.clone().into_std_path_buf(),
            required_by: SearchMode::OnlineCached.as_str().to_string(),
        })?;
        if let Some(entry) = cache.get(identifier, id_type)? {
            debug!(identifier, fetched_at = %entry.fetched_at, "cache hit");
            return Ok(Resolution {
                records: entry.records,
                source: SourceTag::Cache,
            });
        }

        let record = self.remote.resolve(identifier, id_type)?;
        let records = vec![record];
        if self.config.cache_enabled {
            cache.put(&CacheEntry::now(identifier, id_type, records.clone()))?;
        }
        Ok(Resolution {
            records,
            source: SourceTag::Api,
        })
    }

    fn unsupported(&self, id_type: IdType) -> MolidError {
        MolidError::UnsupportedIdType {
            mode: self.config.mode.as_str().to_string(),
            id_type: id_type.as_str().to_string(),
        }
    }
}

/// Exact key first, then every stereo/protonation variant sharing its skeleton.
fn lookup_key(master: &MasterStore, inchikey: &InchiKey) -> Result<Vec<CompoundRecord>, MolidError> {
    if let Some(record) = master.lookup_full(inchikey)? {
        return Ok(vec![record]);
    }
    master.lookup_prefix(inchikey.prefix())
}

fn offline_resolution(records: Vec<CompoundRecord>) -> Option<Resolution> {
    if records.is_empty() {
        return None;
    }
    Some(Resolution {
        records: records.iter().map(CompoundRecord::to_properties).collect(),
        source: SourceTag::Offline,
    })
}
