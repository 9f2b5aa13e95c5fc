// Inbound envelope normalization.
//
// The transport may surface the same contact as either a phone-form address
// or a linked-id form. Downstream replies must land in the same
// conversation, so 1:1 chats commit to the phone form when one is available
// and groups/broadcasts keep their chat id untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STATUS_BROADCAST_JID: &str = "status@broadcast";

// --- Raw envelope ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub id: String,
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_pn: Option<String>,
}

/// A raw inbound message envelope as the transport hands it over.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawEnvelope {
    #[serde(default)]
    pub key: Option<MessageKey>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub message_stub_type: Option<Value>,
    #[serde(default)]
    pub message_stub_parameters: Option<Vec<Value>>,
    #[serde(default)]
    pub message_timestamp: Option<Value>,
}

// --- Normalized output ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Media,
    Stub,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_length: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedContent {
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub text: Option<String>,
    pub media: Option<MediaInfo>,
}

/// Stable inbound representation consumed by the pipeline and shipped to
/// webhook receivers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedInbound {
    pub kind: String,
    pub message_id: String,
    /// Canonical reply address.
    pub from: String,
    /// Same as `from`, kept explicit for receivers and test vectors.
    pub reply_to_jid: String,
    /// Original chat id.
    pub remote_jid: String,
    pub sender_pn: Option<String>,
    /// This device's own address, when known.
    pub to: Option<String>,
    /// Seconds since epoch.
    pub timestamp: Option<i64>,
    pub content: NormalizedContent,
}

// --- Address helpers ---

pub fn is_group_or_broadcast(jid: &str) -> bool {
    jid.ends_with("@g.us") || jid.ends_with("@broadcast")
}

/// Strip device/resource suffixes from the local part of a user address:
/// `549112222:17@s.whatsapp.net` and `549112222.0@s.whatsapp.net` both
/// normalize to `549112222@s.whatsapp.net`.
pub fn normalize_user_jid(jid: &str) -> String {
    match jid.split_once('@') {
        Some((local, domain)) => {
            let bare = local
                .split(|c: char| c == ':' || c == '.')
                .next()
                .unwrap_or(local);
            format!("{bare}@{domain}")
        }
        None => jid.to_string(),
    }
}

/// The local part of an address: everything before `@`.
pub fn user_part(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

fn resolve_reply_jid(remote_jid: &str, sender_pn: Option<&str>) -> String {
    if is_group_or_broadcast(remote_jid) {
        return remote_jid.to_string();
    }
    match sender_pn {
        Some(pn) if !pn.is_empty() => normalize_user_jid(pn),
        _ => normalize_user_jid(remote_jid),
    }
}

// --- Content extraction ---

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Text field priority: conversation, extended text, image caption, video
/// caption.
fn extract_text(message: &Value) -> Option<String> {
    non_empty_str(message.get("conversation"))
        .or_else(|| non_empty_str(message.pointer("/extendedTextMessage/text")))
        .or_else(|| non_empty_str(message.pointer("/imageMessage/caption")))
        .or_else(|| non_empty_str(message.pointer("/videoMessage/caption")))
}

fn stringify_file_length(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_media(message: &Value) -> Option<MediaInfo> {
    for (field, kind) in [
        ("imageMessage", "image"),
        ("videoMessage", "video"),
        ("audioMessage", "audio"),
        ("documentMessage", "document"),
    ] {
        if let Some(descriptor) = message.get(field).filter(|v| v.is_object()) {
            return Some(MediaInfo {
                kind: kind.to_string(),
                mimetype: non_empty_str(descriptor.get("mimetype")),
                file_length: stringify_file_length(descriptor.get("fileLength")),
                file_name: non_empty_str(descriptor.get("fileName")),
            });
        }
    }
    None
}

fn extract_timestamp(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn stub_text(parameters: Option<&Vec<Value>>) -> Option<String> {
    let joined = parameters?
        .iter()
        .filter_map(Value::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// --- Normalization ---

/// Pure conversion of a raw envelope into the stable inbound shape.
///
/// Returns `None` when the envelope has no key; the pipeline filters those
/// out before normalizing, so this is a belt-and-braces check.
pub fn normalize(envelope: &RawEnvelope, own_jid: Option<&str>) -> Option<NormalizedInbound> {
    let key = envelope.key.as_ref()?;

    let text = envelope.message.as_ref().and_then(extract_text);
    let media = envelope.message.as_ref().and_then(extract_media);

    let has_stub_marker =
        envelope.message_stub_type.is_some() || envelope.message_stub_parameters.is_some();

    let content = if has_stub_marker && text.is_none() && media.is_none() {
        NormalizedContent {
            content_type: ContentType::Stub,
            text: stub_text(envelope.message_stub_parameters.as_ref()),
            media: None,
        }
    } else if let Some(text) = text {
        NormalizedContent {
            content_type: ContentType::Text,
            text: Some(text),
            media: None,
        }
    } else if let Some(media) = media {
        NormalizedContent {
            content_type: ContentType::Media,
            text: None,
            media: Some(media),
        }
    } else {
        NormalizedContent {
            content_type: ContentType::Unknown,
            text: None,
            media: None,
        }
    };

    let from = resolve_reply_jid(&key.remote_jid, key.sender_pn.as_deref());

    Some(NormalizedInbound {
        kind: "inbound_message".to_string(),
        message_id: key.id.clone(),
        reply_to_jid: from.clone(),
        from,
        remote_jid: key.remote_jid.clone(),
        sender_pn: key.sender_pn.clone(),
        to: own_jid.map(normalize_user_jid),
        timestamp: extract_timestamp(envelope.message_timestamp.as_ref()),
        content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(raw: Value) -> RawEnvelope {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn plain_conversation_text() {
        let env = envelope(json!({
            "key": {"id": "MSG1", "remoteJid": "5491122223333@s.whatsapp.net", "fromMe": false},
            "message": {"conversation": "hola"},
            "messageTimestamp": 1736900000u64,
        }));
        let n = normalize(&env, Some("999@s.whatsapp.net")).unwrap();

        assert_eq!(n.kind, "inbound_message");
        assert_eq!(n.content.content_type, ContentType::Text);
        assert_eq!(n.content.text.as_deref(), Some("hola"));
        assert_eq!(n.content.media, None);
        assert_eq!(n.from, "5491122223333@s.whatsapp.net");
        assert_eq!(n.reply_to_jid, n.from);
        assert_eq!(n.timestamp, Some(1736900000));
        assert_eq!(n.to.as_deref(), Some("999@s.whatsapp.net"));
    }

    #[test]
    fn extended_text_and_captions() {
        let env = envelope(json!({
            "key": {"id": "M", "remoteJid": "1@s.whatsapp.net"},
            "message": {"extendedTextMessage": {"text": "quoted reply"}},
        }));
        let n = normalize(&env, None).unwrap();
        assert_eq!(n.content.text.as_deref(), Some("quoted reply"));

        let env = envelope(json!({
            "key": {"id": "M", "remoteJid": "1@s.whatsapp.net"},
            "message": {"imageMessage": {"caption": "look", "mimetype": "image/jpeg"}},
        }));
        let n = normalize(&env, None).unwrap();
        // Caption wins: classified as text, not media.
        assert_eq!(n.content.content_type, ContentType::Text);
        assert_eq!(n.content.text.as_deref(), Some("look"));
    }

    #[test]
    fn media_without_caption() {
        let env = envelope(json!({
            "key": {"id": "M", "remoteJid": "1@s.whatsapp.net"},
            "message": {"documentMessage": {
                "mimetype": "application/pdf",
                "fileLength": 123456,
                "fileName": "invoice.pdf"
            }},
        }));
        let n = normalize(&env, None).unwrap();
        assert_eq!(n.content.content_type, ContentType::Media);
        let media = n.content.media.unwrap();
        assert_eq!(media.kind, "document");
        assert_eq!(media.mimetype.as_deref(), Some("application/pdf"));
        assert_eq!(media.file_length.as_deref(), Some("123456"));
        assert_eq!(media.file_name.as_deref(), Some("invoice.pdf"));
    }

    #[test]
    fn stub_parameters_join_and_trim() {
        let env = envelope(json!({
            "key": {"id": "M", "remoteJid": "67229240574002@lid"},
            "messageStubType": 2,
            "messageStubParameters": ["No matching sessions found for message", " "],
        }));
        let n = normalize(&env, None).unwrap();
        assert_eq!(n.content.content_type, ContentType::Stub);
        assert_eq!(
            n.content.text.as_deref(),
            Some("No matching sessions found for message")
        );
    }

    #[test]
    fn stub_marker_with_decoded_text_is_text() {
        let env = envelope(json!({
            "key": {"id": "M", "remoteJid": "1@s.whatsapp.net"},
            "message": {"conversation": "actual text"},
            "messageStubType": 2,
        }));
        let n = normalize(&env, None).unwrap();
        assert_eq!(n.content.content_type, ContentType::Text);
    }

    #[test]
    fn empty_stub_parameters_give_null_text() {
        let env = envelope(json!({
            "key": {"id": "M", "remoteJid": "1@s.whatsapp.net"},
            "messageStubType": 1,
            "messageStubParameters": [],
        }));
        let n = normalize(&env, None).unwrap();
        assert_eq!(n.content.content_type, ContentType::Stub);
        assert_eq!(n.content.text, None);
    }

    #[test]
    fn unknown_when_nothing_decodable() {
        let env = envelope(json!({
            "key": {"id": "M", "remoteJid": "1@s.whatsapp.net"},
            "message": {"reactionMessage": {"text": ""}},
        }));
        let n = normalize(&env, None).unwrap();
        assert_eq!(n.content.content_type, ContentType::Unknown);
    }

    #[test]
    fn group_id_passes_through() {
        let env = envelope(json!({
            "key": {
                "id": "M",
                "remoteJid": "12036304@g.us",
                "participant": "5491122223333@s.whatsapp.net",
                "senderPn": "5491122223333@s.whatsapp.net"
            },
            "message": {"conversation": "in the group"},
        }));
        let n = normalize(&env, None).unwrap();
        assert_eq!(n.from, "12036304@g.us");
        assert_eq!(n.remote_jid, "12036304@g.us");
    }

    #[test]
    fn lid_prefers_phone_form() {
        let env = envelope(json!({
            "key": {
                "id": "M",
                "remoteJid": "67229240574002@lid",
                "senderPn": "5491122223333@s.whatsapp.net"
            },
            "message": {"conversation": "hi"},
        }));
        let n = normalize(&env, None).unwrap();
        assert_eq!(n.from, "5491122223333@s.whatsapp.net");
        assert_eq!(n.remote_jid, "67229240574002@lid");
        assert_eq!(n.sender_pn.as_deref(), Some("5491122223333@s.whatsapp.net"));
    }

    #[test]
    fn device_suffixes_are_stripped() {
        assert_eq!(
            normalize_user_jid("549112222:17@s.whatsapp.net"),
            "549112222@s.whatsapp.net"
        );
        assert_eq!(
            normalize_user_jid("549112222.0@s.whatsapp.net"),
            "549112222@s.whatsapp.net"
        );
        assert_eq!(
            normalize_user_jid("549112222@s.whatsapp.net"),
            "549112222@s.whatsapp.net"
        );
    }

    #[test]
    fn normalization_is_pure() {
        let env = envelope(json!({
            "key": {"id": "M", "remoteJid": "1@s.whatsapp.net"},
            "message": {"conversation": "same"},
            "messageTimestamp": "1736900000",
        }));
        let a = normalize(&env, Some("9@s.whatsapp.net")).unwrap();
        let b = normalize(&env, Some("9@s.whatsapp.net")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.timestamp, Some(1736900000));
    }

    #[test]
    fn missing_key_yields_none() {
        let env = envelope(json!({"message": {"conversation": "orphan"}}));
        assert!(normalize(&env, None).is_none());
    }

    #[test]
    fn serialized_shape_matches_receiver_contract() {
        let env = envelope(json!({
            "key": {"id": "MSG1", "remoteJid": "5491122223333@s.whatsapp.net"},
            "message": {"conversation": "hola"},
            "messageTimestamp": 1736900000u64,
        }));
        let n = normalize(&env, None).unwrap();
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["kind"], "inbound_message");
        assert_eq!(value["messageId"], "MSG1");
        assert_eq!(value["content"]["type"], "text");
        assert_eq!(value["content"]["text"], "hola");
        assert_eq!(value["content"]["media"], Value::Null);
    }
}
