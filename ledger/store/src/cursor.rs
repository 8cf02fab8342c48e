use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 100;

/// Opaque pagination cursor: base64 over `{sort_value, id}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub sort_value: i64,
    pub id: String,
}

impl Cursor {
    pub fn encode(&self) -> String {
        // Serializing a two-field struct cannot fail.
        STANDARD.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn decode(raw: &str) -> Result<Cursor, StoreError> {
        let bytes = STANDARD
            .decode(raw)
            .map_err(|_| StoreError::InvalidCursor)?;
        serde_json::from_slice(&bytes).map_err(|_| StoreError::InvalidCursor)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub limit: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_cursor: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

/// Limits outside `[1, 100]` are clamped rather than rejected; a missing
/// limit defaults to 20.
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

/// Builds one newest-first page from an iterator already ordered newest
/// first. `items` yields `(sort_value, id, value)`.
pub fn paginate<T>(
    items: impl Iterator<Item = (i64, String, T)>,
    cursor: Option<&Cursor>,
    limit: usize,
) -> Page<T> {
    let mut data = Vec::with_capacity(limit);
    let mut first: Option<Cursor> = None;
    let mut last: Option<Cursor> = None;
    let mut has_more = false;

    for (sort_value, id, value) in items {
        if let Some(cursor) = cursor {
            // Strictly after the cursor position in newest-first order.
            if (sort_value, id.as_str()) >= (cursor.sort_value, cursor.id.as_str()) {
                continue;
            }
        }
        if data.len() == limit {
            has_more = true;
            break;
        }
        let position = Cursor {
            sort_value,
            id: id.clone(),
        };
        if first.is_none() {
            first = Some(position.clone());
        }
        last = Some(position);
        data.push(value);
    }

    Page {
        data,
        pagination: Pagination {
            limit,
            has_more,
            next_cursor: if has_more {
                last.as_ref().map(Cursor::encode)
            } else {
                None
            },
            prev_cursor: cursor.and(first.as_ref().map(Cursor::encode)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor {
            sort_value: 1_700_000_000_000,
            id: "abc123".to_string(),
        };
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
        assert!(Cursor::decode("not base64 at all!").is_err());
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(None), 20);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(500)), 100);
        assert_eq!(clamp_limit(Some(42)), 42);
    }

    #[test]
    fn pages_walk_newest_first() {
        let items: Vec<(i64, String, i64)> =
            (0..5).rev().map(|i| (i, format!("id{i}"), i)).collect();

        let first = paginate(items.clone().into_iter(), None, 2);
        assert_eq!(first.data, vec![4, 3]);
        assert!(first.pagination.has_more);
        assert!(first.pagination.prev_cursor.is_none());

        let cursor = Cursor::decode(first.pagination.next_cursor.as_ref().unwrap()).unwrap();
        let second = paginate(items.into_iter(), Some(&cursor), 2);
        assert_eq!(second.data, vec![2, 1]);
        assert!(second.pagination.has_more);
        assert!(second.pagination.prev_cursor.is_some());
    }
}
