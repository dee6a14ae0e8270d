//! # Synced Documents
//!
//! The [`SyncDocument`] trait every cached document type implements, and the
//! two document types the quotation editor caches.
//!
//! ## Document Types
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ENTITY_TYPE        TYPE              CONFLICT FIELDS                   │
//! │  ─────────────────  ────────────────  ──────────────────────────────    │
//! │  "quotation"        Quotation         title, customerName, currency,    │
//! │                                       status, lineItems, discountBps,   │
//! │                                       notes, validUntil                 │
//! │  "snapshot_list"    SnapshotList      snapshots                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The entity type doubles as the cache key prefix and as the path segment
//! of the server's document endpoint.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validation::{
    validate_currency, validate_discount_bps, validate_entity_id, validate_price_cents,
    validate_quantity, validate_required, ValidationResult,
};

// =============================================================================
// SyncDocument Trait
// =============================================================================

/// A document that can be cached locally and synced with the server.
///
/// Implementors are full snapshots: every write replaces the whole value.
pub trait SyncDocument:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
    /// Entity type name; used as cache key prefix and URL segment.
    const ENTITY_TYPE: &'static str;

    /// Top-level JSON fields compared when reporting a conflict.
    const CONFLICT_FIELDS: &'static [&'static str];

    /// Stable id of this document.
    fn id(&self) -> &str;

    /// Checks the document before it is written.
    fn validate(&self) -> ValidationResult<()> {
        validate_entity_id(self.id())
    }
}

// =============================================================================
// Quotation
// =============================================================================

/// Lifecycle of a quotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotationStatus {
    #[default]
    Draft,
    Sent,
    Accepted,
    Rejected,
}

/// One priced line of a quotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub id: String,
    pub description: String,
    pub quantity: i64,
    /// Unit price in minor currency units.
    pub unit_price_cents: i64,
}

impl LineItem {
    /// Creates a line item with a fresh id.
    pub fn new(description: impl Into<String>, quantity: i64, unit_price_cents: i64) -> Self {
        LineItem {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            quantity,
            unit_price_cents,
        }
    }

    /// Quantity times unit price.
    pub fn line_total_cents(&self) -> i64 {
        self.quantity.saturating_mul(self.unit_price_cents)
    }
}

/// A price quotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quotation {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Human-readable number, e.g. "Q-2024-0042".
    pub number: String,

    pub title: String,

    pub customer_name: String,

    /// ISO 4217 code.
    pub currency: String,

    #[serde(default)]
    pub status: QuotationStatus,

    #[serde(default)]
    pub line_items: Vec<LineItem>,

    /// Discount over the subtotal in basis points (100 = 1%).
    #[serde(default)]
    pub discount_bps: u32,

    #[serde(default)]
    pub notes: Option<String>,

    /// Last day the offer holds (YYYY-MM-DD).
    #[serde(default)]
    pub valid_until: Option<String>,
}

impl Quotation {
    /// Creates an empty draft with a fresh id.
    pub fn new(
        number: impl Into<String>,
        title: impl Into<String>,
        customer_name: impl Into<String>,
    ) -> Self {
        Quotation {
            id: Uuid::new_v4().to_string(),
            number: number.into(),
            title: title.into(),
            customer_name: customer_name.into(),
            currency: "USD".to_string(),
            status: QuotationStatus::Draft,
            line_items: Vec::new(),
            discount_bps: 0,
            notes: None,
            valid_until: None,
        }
    }

    /// Sum of all line totals.
    pub fn subtotal_cents(&self) -> i64 {
        self.line_items
            .iter()
            .map(LineItem::line_total_cents)
            .fold(0i64, i64::saturating_add)
    }

    /// Subtotal minus discount, rounded half away from zero.
    pub fn total_cents(&self) -> i64 {
        let subtotal = self.subtotal_cents() as i128;
        let discount = (subtotal * self.discount_bps as i128 + 5_000) / 10_000;
        (subtotal - discount) as i64
    }
}

impl SyncDocument for Quotation {
    const ENTITY_TYPE: &'static str = "quotation";

    const CONFLICT_FIELDS: &'static [&'static str] = &[
        "title",
        "customerName",
        "currency",
        "status",
        "lineItems",
        "discountBps",
        "notes",
        "validUntil",
    ];

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> ValidationResult<()> {
        validate_entity_id(&self.id)?;
        validate_required("number", &self.number)?;
        validate_currency(&self.currency)?;
        validate_discount_bps(self.discount_bps)?;
        for item in &self.line_items {
            validate_quantity(item.quantity)?;
            validate_price_cents(item.unit_price_cents)?;
        }
        Ok(())
    }
}

// =============================================================================
// Snapshot List
// =============================================================================

/// A named point-in-time copy of a quotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotationSnapshot {
    pub id: String,
    pub label: String,
    pub taken_at: DateTime<Utc>,
    pub quotation: Quotation,
}

/// All snapshots of one quotation; keyed by the quotation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotList {
    /// Id of the quotation these snapshots belong to.
    pub id: String,

    #[serde(default)]
    pub snapshots: Vec<QuotationSnapshot>,
}

impl SnapshotList {
    pub fn new(quotation_id: impl Into<String>) -> Self {
        SnapshotList {
            id: quotation_id.into(),
            snapshots: Vec::new(),
        }
    }

    /// Appends a snapshot of `quotation` taken at `now`.
    pub fn capture(&mut self, label: impl Into<String>, quotation: &Quotation, now: DateTime<Utc>) {
        self.snapshots.push(QuotationSnapshot {
            id: Uuid::new_v4().to_string(),
            label: label.into(),
            taken_at: now,
            quotation: quotation.clone(),
        });
    }
}

impl SyncDocument for SnapshotList {
    const ENTITY_TYPE: &'static str = "snapshot_list";

    const CONFLICT_FIELDS: &'static [&'static str] = &["snapshots"];

    fn id(&self) -> &str {
        &self.id
    }
}
