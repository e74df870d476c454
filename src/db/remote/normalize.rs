//! Remote-to-embedded row normalization.
//!
//! The remote store returns native JSON: timestamps with whatever fractional
//! width the server kept, arrays and objects as structures, booleans as
//! booleans. The embedded engine returns text-encoded JSON columns, integer
//! booleans and fixed-width timestamps. Everything leaving the translator
//! passes through here so callers cannot tell the backends apart.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::db::libsql::TS_FORMAT;
use crate::db::{Attachment, MemberRecord, MessageRecord, ResultRow};
use crate::error::DatabaseError;

pub(super) fn parse_flexible(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    None
}

/// Rewrite a remote timestamp (zero to six fractional digits, `Z` or offset
/// suffix) into the embedded fixed-width form. Unparseable input passes
/// through unchanged rather than failing the whole row.
pub(crate) fn normalize_timestamp(raw: &str) -> String {
    match parse_flexible(raw) {
        Some(ts) => ts.format(TS_FORMAT).to_string(),
        None => raw.to_string(),
    }
}

/// One value the way the embedded engine would have returned it: structures
/// become encoded text, booleans become integers, scalars pass through.
pub(crate) fn to_embedded_value(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        Value::Bool(b) => Value::from(i64::from(*b)),
        other => other.clone(),
    }
}

fn normalize_field(key: &str, value: &Value) -> Value {
    if (key.ends_with("_at") || key.ends_with("_date"))
        && let Some(text) = value.as_str()
    {
        return Value::String(normalize_timestamp(text));
    }
    to_embedded_value(value)
}

/// Distinct-reactor count: length of the reactors collection whether it
/// arrives native or text-encoded; zero when absent or undecodable.
pub(crate) fn reactor_count(reactors: Option<&Value>) -> i64 {
    match reactors {
        Some(Value::Array(items)) => items.len() as i64,
        Some(Value::String(text)) => serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|v| v.as_array().map(|a| a.len() as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Normalize one message row and attach its `unique_reactor_count`, which
/// several callers sort and threshold on.
pub(crate) fn normalize_message_row(raw: &Value) -> ResultRow {
    let mut row = ResultRow::new();
    if let Some(map) = raw.as_object() {
        let reactors = reactor_count(map.get("reactors"));
        for (key, value) in map {
            row.insert(key.clone(), normalize_field(key, value));
        }
        row.insert("unique_reactor_count".to_string(), Value::from(reactors));
    }
    row
}

/// Normalize a non-message row (channels, members).
pub(crate) fn normalize_plain_row(raw: &Value) -> ResultRow {
    let mut row = ResultRow::new();
    if let Some(map) = raw.as_object() {
        for (key, value) in map {
            row.insert(key.clone(), normalize_field(key, value));
        }
    }
    row
}

/// Display-name precedence for the denormalized author column. Empty strings
/// count as absent, matching how the ingestion side treats them.
pub(crate) fn display_name_of(member: &Value) -> String {
    ["server_nick", "global_name", "username"]
        .iter()
        .find_map(|key| {
            member
                .get(*key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        })
        .unwrap_or("Unknown")
        .to_string()
}

// ---------------------------------------------------------------------------
// Record decoding for the typed accessors
// ---------------------------------------------------------------------------

/// Identity columns may arrive as JSON numbers or as strings depending on
/// how the remote column was declared.
pub(crate) fn value_as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn field_i64(obj: &serde_json::Map<String, Value>, key: &str) -> Result<i64, DatabaseError> {
    obj.get(key)
        .and_then(value_as_i64)
        .ok_or_else(|| DatabaseError::Serialization(format!("missing numeric field '{key}'")))
}

fn field_opt_i64(obj: &serde_json::Map<String, Value>, key: &str) -> Option<i64> {
    obj.get(key).and_then(value_as_i64)
}

fn field_string(obj: &serde_json::Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn field_opt_string(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn field_bool(obj: &serde_json::Map<String, Value>, key: &str) -> bool {
    match obj.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

fn field_ts(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<DateTime<Utc>, DatabaseError> {
    let raw = obj
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("missing timestamp '{key}'")))?;
    parse_flexible(raw)
        .ok_or_else(|| DatabaseError::Serialization(format!("invalid timestamp '{raw}' in '{key}'")))
}

fn field_opt_ts(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    match obj.get(key).and_then(Value::as_str) {
        Some(raw) => parse_flexible(raw)
            .map(Some)
            .ok_or_else(|| {
                DatabaseError::Serialization(format!("invalid timestamp '{raw}' in '{key}'"))
            }),
        None => Ok(None),
    }
}

fn attachments_from(value: Option<&Value>) -> Result<Vec<Attachment>, DatabaseError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(Vec::new()),
        Some(Value::String(text)) => {
            serde_json::from_str(text).map_err(|e| DatabaseError::Serialization(e.to_string()))
        }
        Some(native) => serde_json::from_value(native.clone())
            .map_err(|e| DatabaseError::Serialization(e.to_string())),
    }
}

fn ids_from(value: Option<&Value>) -> Vec<i64> {
    let native;
    let items = match value {
        Some(Value::Array(items)) => items,
        Some(Value::String(text)) => {
            native = serde_json::from_str::<Value>(text).unwrap_or(Value::Null);
            match native.as_array() {
                Some(items) => items,
                None => return Vec::new(),
            }
        }
        _ => return Vec::new(),
    };
    items.iter().filter_map(value_as_i64).collect()
}

pub(crate) fn message_record_from_remote(raw: &Value) -> Result<MessageRecord, DatabaseError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| DatabaseError::Serialization("message row is not an object".to_string()))?;
    let reactors = ids_from(obj.get("reactors"));
    let reaction_count = match obj.get("reaction_count").and_then(value_as_i64) {
        Some(count) if reactors.is_empty() => count,
        _ => reactors.len() as i64,
    };
    Ok(MessageRecord {
        message_id: field_i64(obj, "message_id")?,
        channel_id: field_i64(obj, "channel_id")?,
        author_id: field_i64(obj, "author_id")?,
        // The remote table has no denormalized author column; the caller
        // fills this from a member lookup when it needs one.
        author_name: field_opt_string(obj, "author_name"),
        content: field_string(obj, "content"),
        created_at: field_ts(obj, "created_at")?,
        edited_at: field_opt_ts(obj, "edited_at")?,
        attachments: attachments_from(obj.get("attachments"))?,
        embeds: obj
            .get("embeds")
            .cloned()
            .unwrap_or_else(|| serde_json::json!([])),
        reaction_count,
        reactors,
        reference_id: field_opt_i64(obj, "reference_id"),
        thread_id: field_opt_i64(obj, "thread_id"),
        is_pinned: field_bool(obj, "is_pinned"),
        message_type: field_opt_string(obj, "message_type"),
        flags: field_opt_i64(obj, "flags").unwrap_or(0),
        is_deleted: field_bool(obj, "is_deleted"),
    })
}

pub(crate) fn member_record_from_remote(raw: &Value) -> Result<MemberRecord, DatabaseError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| DatabaseError::Serialization("member row is not an object".to_string()))?;
    let role_ids = match obj.get("role_ids") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    Ok(MemberRecord {
        member_id: field_i64(obj, "member_id")?,
        username: field_string(obj, "username"),
        global_name: field_opt_string(obj, "global_name"),
        server_nick: field_opt_string(obj, "server_nick"),
        avatar_url: field_opt_string(obj, "avatar_url"),
        bot: field_bool(obj, "bot"),
        role_ids,
        twitter_handle: field_opt_string(obj, "twitter_handle"),
        instagram_handle: field_opt_string(obj, "instagram_handle"),
        youtube_handle: field_opt_string(obj, "youtube_handle"),
        website: field_opt_string(obj, "website"),
        sharing_consent: field_bool(obj, "sharing_consent"),
        dm_preference: field_bool(obj, "dm_preference"),
        guild_join_date: field_opt_ts(obj, "guild_join_date")?,
        created_at: field_opt_ts(obj, "created_at")?,
        updated_at: field_opt_ts(obj, "updated_at")?,
    })
}

pub(crate) fn channel_record_from_remote(
    raw: &Value,
) -> Result<crate::db::ChannelRecord, DatabaseError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| DatabaseError::Serialization("channel row is not an object".to_string()))?;
    Ok(crate::db::ChannelRecord {
        channel_id: field_i64(obj, "channel_id")?,
        channel_name: field_string(obj, "channel_name"),
        category_id: field_opt_i64(obj, "category_id"),
        description: field_opt_string(obj, "description"),
        nsfw: field_bool(obj, "nsfw"),
        enriched: field_bool(obj, "enriched"),
        setup_complete: field_bool(obj, "setup_complete"),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn timestamps_widen_to_six_digit_fraction() {
        assert_eq!(
            normalize_timestamp("2024-03-05T17:04:09+00:00"),
            "2024-03-05T17:04:09.000000+00:00"
        );
        assert_eq!(
            normalize_timestamp("2024-03-05T17:04:09.5Z"),
            "2024-03-05T17:04:09.500000+00:00"
        );
        assert_eq!(
            normalize_timestamp("2024-03-05T17:04:09.123Z"),
            "2024-03-05T17:04:09.123000+00:00"
        );
        assert_eq!(
            normalize_timestamp("2024-03-05T17:04:09.123456+00:00"),
            "2024-03-05T17:04:09.123456+00:00"
        );
        // Bare and space-separated forms are read as UTC.
        assert_eq!(
            normalize_timestamp("2024-03-05 17:04:09"),
            "2024-03-05T17:04:09.000000+00:00"
        );
        // Unparseable input passes through.
        assert_eq!(normalize_timestamp("yesterday"), "yesterday");
    }

    #[test]
    fn structures_become_text_and_booleans_become_integers() {
        assert_eq!(
            to_embedded_value(&json!([1, 2])),
            json!("[1,2]")
        );
        assert_eq!(
            to_embedded_value(&json!({"a": 1})),
            json!("{\"a\":1}")
        );
        assert_eq!(to_embedded_value(&json!(true)), json!(1));
        assert_eq!(to_embedded_value(&json!(false)), json!(0));
        assert_eq!(to_embedded_value(&json!(7)), json!(7));
        assert_eq!(to_embedded_value(&json!("text")), json!("text"));
        assert_eq!(to_embedded_value(&Value::Null), Value::Null);
    }

    #[test]
    fn reactor_count_handles_native_text_and_garbage() {
        assert_eq!(reactor_count(Some(&json!([1, 2, 3]))), 3);
        assert_eq!(reactor_count(Some(&json!("[4,5]"))), 2);
        assert_eq!(reactor_count(Some(&json!("[]"))), 0);
        assert_eq!(reactor_count(Some(&json!("not json"))), 0);
        assert_eq!(reactor_count(Some(&Value::Null)), 0);
        assert_eq!(reactor_count(None), 0);
    }

    #[test]
    fn message_row_normalizes_and_counts_reactors() {
        let raw = json!({
            "message_id": 111,
            "channel_id": 7,
            "created_at": "2024-03-05T17:04:09.12Z",
            "attachments": [{"url": "https://cdn.example/a.png", "filename": "a.png"}],
            "reactors": [10, 11],
            "is_pinned": false,
        });
        let row = normalize_message_row(&raw);
        assert_eq!(row.get("message_id"), Some(&json!(111)));
        assert_eq!(
            row.get("created_at"),
            Some(&json!("2024-03-05T17:04:09.120000+00:00"))
        );
        assert_eq!(
            row.get("attachments"),
            Some(&json!(
                "[{\"url\":\"https://cdn.example/a.png\",\"filename\":\"a.png\"}]"
            ))
        );
        assert_eq!(row.get("reactors"), Some(&json!("[10,11]")));
        assert_eq!(row.get("is_pinned"), Some(&json!(0)));
        assert_eq!(row.get("unique_reactor_count"), Some(&json!(2)));
    }

    #[test]
    fn display_name_precedence_skips_empty_strings() {
        let full = json!({"server_nick": "Nick", "global_name": "Global", "username": "user"});
        assert_eq!(display_name_of(&full), "Nick");

        let empty_nick = json!({"server_nick": "", "global_name": "Global", "username": "user"});
        assert_eq!(display_name_of(&empty_nick), "Global");

        let username_only = json!({"server_nick": null, "username": "user"});
        assert_eq!(display_name_of(&username_only), "user");

        assert_eq!(display_name_of(&json!({})), "Unknown");
    }

    #[test]
    fn message_record_decodes_with_string_identities() {
        let raw = json!({
            "message_id": "111222333444555666",
            "channel_id": 7,
            "author_id": 9001,
            "content": "hello",
            "created_at": "2024-03-05T17:04:09Z",
            "attachments": [],
            "embeds": [],
            "reactors": ["10", 11],
            "is_pinned": true,
            "flags": 0,
            "is_deleted": false,
        });
        let record = message_record_from_remote(&raw).expect("decodes");
        assert_eq!(record.message_id, 111_222_333_444_555_666);
        assert_eq!(record.reactors, vec![10, 11]);
        assert_eq!(record.reaction_count, 2);
        assert!(record.is_pinned);
        assert_eq!(record.author_name, None);
    }

    #[test]
    fn message_record_requires_identity_and_timestamp() {
        let missing_id = json!({"channel_id": 7, "author_id": 1, "created_at": "2024-03-05T17:04:09Z"});
        assert!(message_record_from_remote(&missing_id).is_err());

        let bad_ts = json!({"message_id": 1, "channel_id": 7, "author_id": 1, "created_at": "not a time"});
        assert!(message_record_from_remote(&bad_ts).is_err());
    }

    #[test]
    fn stale_reaction_count_defers_to_reactor_list() {
        let raw = json!({
            "message_id": 1,
            "channel_id": 7,
            "author_id": 1,
            "created_at": "2024-03-05T17:04:09Z",
            "reaction_count": 9,
            "reactors": [1, 2],
        });
        let record = message_record_from_remote(&raw).expect("decodes");
        assert_eq!(record.reaction_count, 2);

        let no_list = json!({
            "message_id": 1,
            "channel_id": 7,
            "author_id": 1,
            "created_at": "2024-03-05T17:04:09Z",
            "reaction_count": 9,
        });
        let record = message_record_from_remote(&no_list).expect("decodes");
        assert_eq!(record.reaction_count, 9);
    }
}
