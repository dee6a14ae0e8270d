//! # Conflict Detection
//!
//! Pure rules for deciding whether a push would overwrite a newer server
//! version, and which top-level fields differ.
//!
//! ## Rule
//! ```text
//! conflict  ⇔  server.versionNumber > cache.metadata.serverVersion
//! ```
//! Field differences are informational only. They are reported to the
//! resolver and the UI but never drive an automatic merge.

use serde_json::Value;

use crate::document::SyncDocument;
use crate::types::{CachedDocument, ConflictInfo, ServerDocument};

/// Returns the allow-listed top-level fields whose values differ.
///
/// A field missing from one side compares as `null`. Non-object values
/// yield no fields.
pub fn conflicting_fields(local: &Value, server: &Value, allow_list: &[&str]) -> Vec<String> {
    let (Some(local), Some(server)) = (local.as_object(), server.as_object()) else {
        return Vec::new();
    };

    allow_list
        .iter()
        .filter(|field| {
            let l = local.get(**field).unwrap_or(&Value::Null);
            let s = server.get(**field).unwrap_or(&Value::Null);
            l != s
        })
        .map(|field| field.to_string())
        .collect()
}

/// Builds a [`ConflictInfo`] if the server has moved past the version the
/// cached copy was based on.
pub fn detect_conflict<T: SyncDocument>(
    local: &CachedDocument<T>,
    server: &ServerDocument<T>,
) -> Option<ConflictInfo> {
    if server.version_number <= local.metadata.server_version {
        return None;
    }

    let fields = match (
        serde_json::to_value(&local.data),
        serde_json::to_value(&server.data),
    ) {
        (Ok(l), Ok(s)) => conflicting_fields(&l, &s, T::CONFLICT_FIELDS),
        _ => Vec::new(),
    };

    Some(ConflictInfo {
        entity_id: local.data.id().to_string(),
        local_version: local.metadata.server_version,
        server_version: server.version_number,
        local_updated_at: local.metadata.cached_at,
        server_updated_at: server.updated_at,
        conflicting_fields: fields,
    })
}
