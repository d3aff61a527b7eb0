use std::sync::Arc;

use log::{info, warn};

use super::error::{validate_name, Error, Result};
use super::locks::KeyedLocks;
use super::manifest::Manifest;
use super::model::{AppTemplate, Listing};
use super::port::RecordStore;
use super::translator;

const NAMESPACE: &str = "templates";

/// Keyed AppTemplate records. Writes to one id never wait on another.
pub struct TemplateStore {
    records: Arc<dyn RecordStore>,
    locks: KeyedLocks,
}

impl TemplateStore {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            locks: KeyedLocks::new(),
        }
    }

    /// Every readable template sorted by id. Unreadable records are skipped
    /// and reported in the listing's warnings.
    pub async fn list(&self) -> Result<Listing<AppTemplate>> {
        let mut items = Vec::new();
        let mut warnings = Vec::new();
        for (key, data) in self.records.list(NAMESPACE).await? {
            match decode(&key, &data) {
                Ok(template) => items.push(template),
                Err(reason) => {
                    warn!("Skipping template record {}: {}", key, reason);
                    warnings.push(format!("template {key}: {reason}"));
                }
            }
        }
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Listing { items, warnings })
    }

    pub async fn get(&self, id: &str) -> Result<AppTemplate> {
        let data = self
            .records
            .load(NAMESPACE, id)
            .await?
            .ok_or_else(|| Error::not_found(format!("template {id}")))?;
        decode(id, &data).map_err(|reason| Error::storage(format!("template {id}: {reason}")))
    }

    /// Upsert. The derived views are recomputed from the manifest first.
    pub async fn put(&self, template: AppTemplate) -> Result<AppTemplate> {
        if template.id.trim().is_empty() {
            return Err(Error::MissingId);
        }
        validate_name(&template.id)?;
        let template = translator::reconcile(template)?;
        let data = serde_json::to_vec_pretty(&template)
            .map_err(|e| Error::storage(format!("cannot encode template {}: {e}", template.id)))?;

        let _guard = self.locks.lock(&template.id).await;
        self.records.save(NAMESPACE, &template.id, &data).await?;
        info!("Template {} stored", template.id);
        Ok(template)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        if self.records.delete(NAMESPACE, id).await? {
            info!("Template {} deleted", id);
            Ok(())
        } else {
            Err(Error::not_found(format!("template {id}")))
        }
    }

    /// Translates a raw manifest and stores the resulting template. Nothing
    /// is written when translation fails.
    pub async fn ingest(&self, raw: &[u8], id_hint: Option<&str>) -> Result<AppTemplate> {
        let manifest = Manifest::from_slice(raw)?;
        let template = translator::to_template(&manifest, id_hint)?;
        self.put(template).await
    }
}

fn decode(key: &str, data: &[u8]) -> std::result::Result<AppTemplate, String> {
    let template: AppTemplate = serde_json::from_slice(data).map_err(|e| e.to_string())?;
    if template.id != key {
        return Err(format!("record claims id {:?}", template.id));
    }
    Ok(template)
}
