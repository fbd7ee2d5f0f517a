// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity data model.
//!
//! Five entity kinds flow through the client. Backends only ever see JSON
//! ([`serde_json::Value`]); the typed structs here exist for callers and for
//! validation before anything touches the network.
//!
//! # Example
//!
//! ```
//! use site_sync::entity::{Entity, Product, EntityKind};
//!
//! let product = Product::new("Indoor P2.5", "indoor");
//! assert_eq!(Product::KIND, EntityKind::Products);
//! assert!(product.validate().is_ok());
//! assert!(product.record_id().is_none()); // not yet persisted
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// The fixed set of entities the client can read and mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Products,
    News,
    Inquiries,
    PageContent,
    SiteSettings,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        Self::Products,
        Self::News,
        Self::Inquiries,
        Self::PageContent,
        Self::SiteSettings,
    ];

    /// Remote table / collection name.
    #[must_use]
    pub fn table(&self) -> &'static str {
        match self {
            Self::Products => "products",
            Self::News => "news",
            Self::Inquiries => "inquiries",
            Self::PageContent => "page_content",
            Self::SiteSettings => "site_settings",
        }
    }

    /// Identity of a raw record of this kind, if it carries one.
    #[must_use]
    pub fn record_id_of(&self, record: &Value) -> Option<RecordId> {
        match self {
            Self::PageContent => {
                let page_name = record.get("page_name").and_then(scalar_to_string)?;
                let content_key = record.get("content_key").and_then(scalar_to_string)?;
                Some(RecordId::composite(page_name, content_key))
            }
            _ => record.get("id").and_then(scalar_to_string).map(RecordId::Id),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.table() == s)
            .ok_or_else(|| format!("unknown entity '{}'", s))
    }
}

/// How a content value is applied to a page region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Html,
    Image,
    Url,
}

/// Record identity: a plain id, or the `page_name + content_key` pair used
/// by page content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Id(String),
    Composite { page_name: String, content_key: String },
}

impl RecordId {
    pub fn composite(page_name: impl Into<String>, content_key: impl Into<String>) -> Self {
        Self::Composite {
            page_name: page_name.into(),
            content_key: content_key.into(),
        }
    }

    /// Column/value pairs that select exactly this record.
    #[must_use]
    pub fn match_fields(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Id(id) => vec![("id", id.clone())],
            Self::Composite { page_name, content_key } => vec![
                ("page_name", page_name.clone()),
                ("content_key", content_key.clone()),
            ],
        }
    }

    /// Whether a raw record carries this identity.
    #[must_use]
    pub fn matches(&self, record: &Value) -> bool {
        self.match_fields().iter().all(|(column, expected)| {
            record
                .get(*column)
                .and_then(scalar_to_string)
                .is_some_and(|actual| &actual == expected)
        })
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => f.write_str(id),
            Self::Composite { page_name, content_key } => write!(f, "{}/{}", page_name, content_key),
        }
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self::Id(id.to_string())
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::Id(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self::Id(id)
    }
}

/// String form of a scalar JSON value (strings unquoted).
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A typed entity that can be sent through the client.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Identity once persisted.
    fn record_id(&self) -> Option<RecordId>;

    /// Required-field checks, run before any network call.
    fn validate(&self) -> Result<(), ValidationError>;
}

fn require(kind: EntityKind, field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::new(kind, field, "is required"))
    } else {
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specifications: Option<Value>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Product {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            category: category.into(),
            description: None,
            image_url: None,
            specifications: None,
            is_active: true,
            sort_order: 0,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for Product {
    const KIND: EntityKind = EntityKind::Products;

    fn record_id(&self) -> Option<RecordId> {
        self.id.map(RecordId::from)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require(Self::KIND, "name", &self.name)?;
        require(Self::KIND, "category", &self.category)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub published: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for NewsArticle {
    const KIND: EntityKind = EntityKind::News;

    fn record_id(&self) -> Option<RecordId> {
        self.id.map(RecordId::from)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require(Self::KIND, "title", &self.title)?;
        require(Self::KIND, "content", &self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inquiry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_interest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for Inquiry {
    const KIND: EntityKind = EntityKind::Inquiries;

    fn record_id(&self) -> Option<RecordId> {
        self.id.map(RecordId::from)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require(Self::KIND, "name", &self.name)?;
        require(Self::KIND, "email", &self.email)?;
        if !self.email.contains('@') {
            return Err(ValidationError::new(Self::KIND, "email", "is not an email address"));
        }
        require(Self::KIND, "message", &self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub page_name: String,
    pub content_key: String,
    pub content_value: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PageContent {
    pub fn new(
        page_name: impl Into<String>,
        content_key: impl Into<String>,
        content_value: impl Into<String>,
        content_type: ContentType,
    ) -> Self {
        Self {
            id: None,
            page_name: page_name.into(),
            content_key: content_key.into(),
            content_value: content_value.into(),
            content_type,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for PageContent {
    const KIND: EntityKind = EntityKind::PageContent;

    fn record_id(&self) -> Option<RecordId> {
        Some(RecordId::composite(&self.page_name, &self.content_key))
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require(Self::KIND, "page_name", &self.page_name)?;
        require(Self::KIND, "content_key", &self.content_key)?;
        require(Self::KIND, "content_value", &self.content_value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSetting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub setting_key: String,
    pub setting_value: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for SiteSetting {
    const KIND: EntityKind = EntityKind::SiteSettings;

    fn record_id(&self) -> Option<RecordId> {
        self.id.map(RecordId::from)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require(Self::KIND, "setting_key", &self.setting_key)?;
        require(Self::KIND, "setting_value", &self.setting_value)
    }
}

/// Ordering for list reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// The small, fixed filter vocabulary supported by `get_all`.
///
/// Equality on named fields, one ordering, one limit. Nothing else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub equals: BTreeMap<String, String>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListFilter {
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl ToString) -> Self {
        self.equals.insert(field.into(), value.to_string());
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy { field: field.into(), descending: false });
        self
    }

    #[must_use]
    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy { field: field.into(), descending: true });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.equals.is_empty() && self.order_by.is_none() && self.limit.is_none()
    }

    /// Canonical form used inside cache keys.
    #[must_use]
    pub fn cache_fragment(&self) -> String {
        if self.is_empty() {
            return "*".to_string();
        }
        let mut parts: Vec<String> = self
            .equals
            .iter()
            .map(|(field, value)| format!("{}={}", field, value))
            .collect();
        if let Some(order) = &self.order_by {
            let sign = if order.descending { "-" } else { "+" };
            parts.push(format!("order:{}{}", sign, order.field));
        }
        if let Some(limit) = self.limit {
            parts.push(format!("limit:{}", limit));
        }
        parts.join(";")
    }

    /// Whether a raw record passes the equality constraints.
    #[must_use]
    pub fn matches(&self, record: &Value) -> bool {
        self.equals.iter().all(|(field, expected)| {
            record
                .get(field)
                .and_then(scalar_to_string)
                .is_some_and(|actual| &actual == expected)
        })
    }

    /// Filter, order and limit a set of raw records in memory.
    #[must_use]
    pub fn apply(&self, records: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut rows: Vec<Value> = records.into_iter().filter(|r| self.matches(r)).collect();
        if let Some(order) = &self.order_by {
            rows.sort_by(|a, b| {
                let ordering = compare_json(a.get(&order.field), b.get(&order.field));
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows
    }
}

fn compare_json(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => scalar_to_string(x).cmp(&scalar_to_string(y)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// Remote change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
    #[serde(alias = "DELETE")]
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => f.write_str("insert"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// A normalized remote insert/update/delete notification.
///
/// Ephemeral: created by the change subscriber, dropped after dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: EntityKind,
    pub operation: ChangeOp,
    pub record: Value,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Build an event, taking the timestamp from the record's `updated_at`
    /// when present (deletes and unstamped records use the receipt time).
    pub fn new(entity: EntityKind, operation: ChangeOp, record: Value) -> Self {
        let stamped = match operation {
            ChangeOp::Delete => None,
            _ => record
                .get("updated_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        };
        Self {
            entity,
            operation,
            record,
            timestamp: stamped.unwrap_or_else(Utc::now),
        }
    }

    #[must_use]
    pub fn record_id(&self) -> Option<RecordId> {
        self.entity.record_id_of(&self.record)
    }
}
