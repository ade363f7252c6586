//! Admin-side creation and editing of events, parties and associations.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::blob_store::BlobStore;
use crate::document_store::{DocumentStore, Fields, Query, StoreError};
use crate::model::{Association, DatedItem, ItemKind, ASSOCIATIONS, ASSOCIATION_LOGOS};
use crate::session::{Forbidden, Session};
use crate::upload::{UploadError, UploadJob, UploadPipeline};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error(transparent)]
    Forbidden(#[from] Forbidden),
    #[error("{0}")]
    Invalid(String),
    #[error("Image upload failed: {0}")]
    Upload(#[from] UploadError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub title: String,
    /// Local reference to the header image.
    pub header_image: String,
    pub date: DateTime<Utc>,
    /// Required for events, ignored for parties.
    pub association_id: Option<String>,
}

/// Fields to change on an existing item; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ItemEdit {
    pub title: Option<String>,
    pub header_image: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

pub struct Catalog {
    store: Arc<dyn DocumentStore>,
    uploads: UploadPipeline,
    session: Session,
}

impl Catalog {
    pub fn new(store: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>, session: Session) -> Self {
        Self {
            store,
            uploads: UploadPipeline::new(blobs),
            session,
        }
    }

    pub async fn add_item(&self, kind: ItemKind, item: NewItem) -> Result<String, CatalogError> {
        self.session.require_admin(match kind {
            ItemKind::Event => "add an event",
            ItemKind::Party => "add a party",
        })?;

        let title = required_title(&item.title)?;
        if item.header_image.trim().is_empty() {
            return Err(CatalogError::Invalid("An image is required".to_string()));
        }
        let association_id = match kind {
            ItemKind::Event => Some(
                item.association_id
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| CatalogError::Invalid("An association is required".to_string()))?,
            ),
            ItemKind::Party => None,
        };

        let image_url = self.upload_image(&item.header_image, kind.header_namespace()).await?;

        let doc = DatedItem {
            id: String::new(),
            title,
            image_url,
            date: item.date,
            photos: vec![],
            association_id,
            created_by: Some(self.session.uid().to_string()),
        };
        let id = self.store.add(kind.collection(), to_fields(&doc)?).await?;

        info!("Created {}/{} ({})", kind.collection(), id, doc.title);
        Ok(id)
    }

    /// Merge-update only the fields `edit` sets. The album is never touched.
    pub async fn edit_item(
        &self,
        kind: ItemKind,
        id: &str,
        edit: ItemEdit,
    ) -> Result<(), CatalogError> {
        self.session.require_admin(match kind {
            ItemKind::Event => "edit an event",
            ItemKind::Party => "edit a party",
        })?;

        let mut fields = Fields::new();
        if let Some(title) = &edit.title {
            fields.insert("title".into(), Value::String(required_title(title)?));
        }
        if let Some(date) = &edit.date {
            fields.insert("date".into(), serde_json::to_value(date)?);
        }
        if fields.is_empty() && edit.header_image.is_none() {
            return Ok(());
        }

        // Check the item exists before uploading anything for it.
        if self.store.get(kind.collection(), id).await?.is_none() {
            return Err(StoreError::NotFound {
                collection: kind.collection().to_string(),
                id: id.to_string(),
            }
            .into());
        }

        if let Some(image) = &edit.header_image {
            let url = self.upload_image(image, kind.header_namespace()).await?;
            fields.insert("imageUrl".into(), Value::String(url));
        }

        let version = self
            .store
            .merge_fields(kind.collection(), id, fields, None)
            .await?;
        info!("Edited {}/{} (v{})", kind.collection(), id, version);
        Ok(())
    }

    /// Every association, sorted by name. Malformed documents are skipped.
    pub async fn list_associations(&self) -> Result<Vec<Association>, CatalogError> {
        let docs = self.store.list(&Query::collection(ASSOCIATIONS)).await?;
        let mut associations: Vec<Association> = docs
            .iter()
            .filter_map(|doc| match Association::from_document(doc) {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!("Skipping malformed association {}: {}", doc.id, e);
                    None
                }
            })
            .collect();
        associations.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(associations)
    }

    pub async fn add_association(&self, name: &str, logo: &str) -> Result<String, CatalogError> {
        self.session.require_admin("add an association")?;

        let name = name.trim();
        if name.is_empty() {
            return Err(CatalogError::Invalid("A name is required".to_string()));
        }
        if logo.trim().is_empty() {
            return Err(CatalogError::Invalid("A logo is required".to_string()));
        }

        let logo = self.upload_image(logo, ASSOCIATION_LOGOS).await?;
        let association = Association {
            id: String::new(),
            name: name.to_string(),
            logo,
        };
        let id = self
            .store
            .add(ASSOCIATIONS, to_fields(&association)?)
            .await?;

        info!("Created association {} ({})", id, name);
        Ok(id)
    }

    async fn upload_image(&self, local_ref: &str, namespace: &str) -> Result<String, CatalogError> {
        let urls = self
            .uploads
            .run(&UploadJob::new(vec![local_ref.to_string()], namespace))
            .await?;
        urls.into_iter()
            .next()
            .ok_or(CatalogError::Upload(UploadError::Empty))
    }
}

fn required_title(title: &str) -> Result<String, CatalogError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(CatalogError::Invalid("A title is required".to_string()));
    }
    Ok(title.to_string())
}

fn to_fields<T: serde::Serialize>(value: &T) -> Result<Fields, CatalogError> {
    match serde_json::to_value(value)? {
        Value::Object(fields) => Ok(fields),
        other => Err(CatalogError::Invalid(format!("expected an object, got {other}"))),
    }
}
