//! Documents the app reads from the document store.
//!
//! Field names on the wire are camelCase; the document id is not a field,
//! it is the document key, so `id` is filled in from the store on read.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document_store::Document;

pub const USERS: &str = "users";
pub const ASSOCIATIONS: &str = "associations";
pub const ASSOCIATION_LOGOS: &str = "associationLogos";
pub const ADMIN_ROLE: &str = "admin";

/// The two kinds of dated items shown on a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    /// An association's event.
    Event,
    /// A club-wide party.
    Party,
}

impl ItemKind {
    pub fn collection(self) -> &'static str {
        match self {
            ItemKind::Event => "events",
            ItemKind::Party => "parties",
        }
    }

    /// Blob namespace for album photos; the parent id is appended per job.
    pub fn album_namespace(self) -> &'static str {
        match self {
            ItemKind::Event => "EventPictures",
            ItemKind::Party => "partyPhotos",
        }
    }

    /// Blob namespace for the header image shown on the timeline card.
    pub fn header_namespace(self) -> &'static str {
        match self {
            ItemKind::Event => "eventHeader",
            ItemKind::Party => "partyHeader",
        }
    }
}

/// An event or party: something with a date and a photo album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatedItem {
    #[serde(default, skip_serializing)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub image_url: String,
    pub date: DateTime<Utc>,
    /// Append-only. Order is upload completion order, batches in arrival order.
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl DatedItem {
    pub fn from_document(doc: &Document) -> Result<Self, serde_json::Error> {
        let mut item: DatedItem = serde_json::from_value(Value::Object(doc.fields.clone()))?;
        item.id = doc.id.clone();
        Ok(item)
    }
}

/// A member's profile as stored in `users/{uid}`.
///
/// Unknown fields survive a read/write round trip through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    #[serde(default, skip_serializing)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub logo: String,
}

impl Association {
    pub fn from_document(doc: &Document) -> Result<Self, serde_json::Error> {
        let mut association: Association =
            serde_json::from_value(Value::Object(doc.fields.clone()))?;
        association.id = doc.id.clone();
        Ok(association)
    }
}
