//! Marshalling of enablement tables and legacy enable lists.
//!
//! Two storage eras coexist in the settings backend. The old era stored
//! flat identity lists, one document per key, keyed by user id:
//! `{"enableImeList": {"100": ["com.a.ime", ...]}}`. The new era stores a
//! versioned table per user plus one global mirror document that embeds the
//! user it reflects. Presence of a top-level `"version"` field is the sole
//! discriminator selecting the new-format decoder; everything else goes to
//! the legacy decoder. There is no third probe.

use crate::error::EnableError;
use crate::types::{EnabledEntry, TABLE_VERSION, UserEnabledTable, UserId};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Field names of the legacy flat documents.
pub const LEGACY_ENABLE_IME_FIELD: &str = "enableImeList";
pub const LEGACY_ENABLE_KEYBOARD_FIELD: &str = "enableKeyboardList";
pub const LEGACY_TEMP_IME_FIELD: &str = "tempImeList";
pub const LEGACY_FULL_EXPERIENCE_FIELD: &str = "fullExperienceList";

/// Subnode of the global mirror document naming its owning user.
const GLOBAL_OWNER_FIELD: &str = "userEnabledInfos";

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed enable data: {0}")]
    Malformed(String),

    /// An entry with an empty bundle name cannot be marshalled.
    #[error("entry with empty bundle name")]
    BlankIdentity,

    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}

impl From<CodecError> for EnableError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Malformed(msg) => EnableError::CorruptData(msg),
            CodecError::BlankIdentity => EnableError::Serialization("entry with empty bundle name".into()),
            CodecError::Encode(e) => EnableError::Serialization(e.to_string()),
        }
    }
}

/// Decoded content of a per-user settings slot.
#[derive(Debug, Clone, PartialEq)]
pub enum UserSlot {
    /// The distinct, valid "no data" case (empty stored string).
    Empty,
    /// Old flat identity lists, keyed by user id.
    Legacy(BTreeMap<UserId, Vec<String>>),
    /// A current-format table.
    Table(UserEnabledTable),
}

/// Decoded content of the global enable slot.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalSlot {
    Empty,
    /// Old flat identity lists, keyed by user id.
    Legacy(BTreeMap<UserId, Vec<String>>),
    /// The foreground-user mirror. `owner` is `None` when the document does
    /// not name exactly one user.
    Mirror {
        owner: Option<UserId>,
        entries: Vec<EnabledEntry>,
    },
}

#[derive(Serialize)]
struct GlobalDoc {
    version: u32,
    #[serde(rename = "userEnabledInfos", default)]
    user_enabled_infos: BTreeMap<String, Vec<EnabledEntry>>,
}

/// Marshal a per-user table. Aborts on any blank identity so a broken
/// in-memory table can never clobber a valid stored one.
pub fn encode_user_table(table: &UserEnabledTable) -> Result<String, CodecError> {
    ensure_identities(&table.entries)?;
    serde_json::to_string(table).map_err(CodecError::Encode)
}

/// Marshal the global mirror document on behalf of `user_id`.
pub fn encode_global_table(user_id: UserId, entries: &[EnabledEntry]) -> Result<String, CodecError> {
    ensure_identities(entries)?;
    let doc = GlobalDoc {
        version: TABLE_VERSION,
        user_enabled_infos: BTreeMap::from([(user_id.to_string(), entries.to_vec())]),
    };
    serde_json::to_string(&doc).map_err(CodecError::Encode)
}

fn ensure_identities(entries: &[EnabledEntry]) -> Result<(), CodecError> {
    if entries.iter().any(|e| e.bundle_name.is_empty()) {
        return Err(CodecError::BlankIdentity);
    }
    Ok(())
}

fn has_version_field(value: &Value) -> bool {
    value.as_object().is_some_and(|o| o.contains_key("version"))
}

/// Decode a per-user slot, sniffing the format.
pub fn decode_user_slot(raw: &str) -> Result<UserSlot, CodecError> {
    if raw.is_empty() {
        return Ok(UserSlot::Empty);
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|e| CodecError::Malformed(e.to_string()))?;
    if has_version_field(&value) {
        let table: UserEnabledTable =
            serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))?;
        return Ok(UserSlot::Table(table));
    }
    decode_legacy_value(&value, LEGACY_ENABLE_IME_FIELD).map(UserSlot::Legacy)
}

/// Decode the global slot, sniffing the format.
///
/// Ownership of a mirror document is determined by walking the generic JSON
/// value: the single key under `userEnabledInfos` names the owner; absence
/// or ambiguity means ownerless.
pub fn decode_global_slot(raw: &str) -> Result<GlobalSlot, CodecError> {
    if raw.is_empty() {
        return Ok(GlobalSlot::Empty);
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|e| CodecError::Malformed(e.to_string()))?;
    if !has_version_field(&value) {
        return decode_legacy_value(&value, LEGACY_ENABLE_IME_FIELD).map(GlobalSlot::Legacy);
    }

    let Some(sub) = value.get(GLOBAL_OWNER_FIELD).and_then(Value::as_object) else {
        return Ok(GlobalSlot::Mirror { owner: None, entries: Vec::new() });
    };
    let owner = if sub.len() == 1 {
        sub.keys().next().and_then(|k| k.parse::<UserId>().ok())
    } else {
        None
    };
    let entries = match sub.values().next() {
        Some(list) => serde_json::from_value(list.clone())
            .map_err(|e| CodecError::Malformed(e.to_string()))?,
        None => Vec::new(),
    };
    Ok(GlobalSlot::Mirror { owner, entries })
}

/// Decode one legacy flat document (`enable_keyboard`, `temp_ime`,
/// `security_mode`, or an old-era `enable_ime`).
///
/// Returns `Ok(None)` for the empty "no data" case. A present document with
/// the expected field missing, or any non-string member, is malformed.
pub fn decode_legacy_list(
    raw: &str,
    field: &str,
) -> Result<Option<BTreeMap<UserId, Vec<String>>>, CodecError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|e| CodecError::Malformed(e.to_string()))?;
    decode_legacy_value(&value, field).map(Some)
}

fn decode_legacy_value(
    value: &Value,
    field: &str,
) -> Result<BTreeMap<UserId, Vec<String>>, CodecError> {
    let lists = value
        .get(field)
        .ok_or_else(|| CodecError::Malformed(format!("missing field: {field}")))?
        .as_object()
        .ok_or_else(|| CodecError::Malformed(format!("{field} is not an object")))?;

    let mut out = BTreeMap::new();
    for (user, names) in lists {
        let user_id: UserId = user
            .parse()
            .map_err(|_| CodecError::Malformed(format!("bad user id: {user}")))?;
        let names = names
            .as_array()
            .ok_or_else(|| CodecError::Malformed(format!("{field}[{user}] is not a list")))?
            .iter()
            .map(|n| {
                n.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| CodecError::Malformed(format!("{field}[{user}] has a non-string member")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        out.insert(user_id, names);
    }
    Ok(out)
}
