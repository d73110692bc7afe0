//! Canonicalization of protocol addresses and phone numbers.
//!
//! The wire protocol addresses contacts with JID-like strings
//! (`201001234567@s.whatsapp.net`, sometimes carrying a `:device` suffix),
//! groups (`1234567890-987654@g.us`), linked devices (`...@lid`) and a
//! status broadcast pseudo-chat. Everything that keys a contact or message
//! row goes through this module first.

pub const USER_DOMAIN: &str = "s.whatsapp.net";
pub const GROUP_DOMAIN: &str = "g.us";
pub const LID_DOMAIN: &str = "lid";
pub const STATUS_BROADCAST: &str = "status@broadcast";

pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with(GROUP_DOMAIN)
}

pub fn is_status_broadcast(jid: &str) -> bool {
    jid == STATUS_BROADCAST
}

pub fn is_lid(jid: &str) -> bool {
    jid.split('@').nth(1).map(|d| d == LID_DOMAIN).unwrap_or(false)
}

/// Drops the `:device` suffix from a JID local part.
pub fn strip_device_suffix(local: &str) -> &str {
    match local.split_once(':') {
        Some((user, _)) => user,
        None => local,
    }
}

fn local_part(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

/// Canonical international phone digits for any user-addressed input:
/// raw phone strings with formatting, JIDs with domain and device suffixes.
/// A leading `00` international prefix is dropped, a single leading `0`
/// is treated as a national number and expanded with the default country
/// code.
pub fn canonical_phone(input: &str, default_cc: &str) -> String {
    let local = strip_device_suffix(local_part(input));
    let digits: String = local.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return String::new();
    }
    if let Some(rest) = digits.strip_prefix("00") {
        return rest.to_string();
    }
    if let Some(rest) = digits.strip_prefix('0') {
        return format!("{}{}", default_cc, rest);
    }
    digits
}

/// Canonical message/contact key for a chat address. Group identities keep
/// their group id (digits and dashes), user identities collapse to
/// `<canonical phone>@s.whatsapp.net`.
pub fn canonical_jid(raw: &str, default_cc: &str) -> String {
    if is_status_broadcast(raw) {
        return STATUS_BROADCAST.to_string();
    }
    if is_group_jid(raw) {
        let local: String = local_part(raw)
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '-')
            .collect();
        return format!("{}@{}", local, GROUP_DOMAIN);
    }
    if is_lid(raw) {
        let local = strip_device_suffix(local_part(raw));
        return format!("{}@{}", local, LID_DOMAIN);
    }
    let phone = canonical_phone(raw, default_cc);
    format!("{}@{}", phone, USER_DOMAIN)
}

/// Resolves the conversation identity for an event. Linked-device
/// addresses are mapped back to a phone identity through the participant
/// hint, but only for inbound events: an outgoing message to a linked
/// identity must not be attributed to the local user's own number.
pub fn resolve_chat_jid(
    remote: &str,
    participant: Option<&str>,
    from_me: bool,
    default_cc: &str,
) -> String {
    if is_lid(remote) && !from_me {
        if let Some(hint) = participant {
            if !is_lid(hint) && !is_group_jid(hint) {
                return canonical_jid(hint, default_cc);
            }
        }
    }
    canonical_jid(remote, default_cc)
}

/// Validates and canonicalizes an outbound recipient. Returns `None` when
/// no usable digits remain, which callers surface as a validation error
/// before any network call.
pub fn to_send_jid(to: &str, default_cc: &str) -> Option<String> {
    if is_group_jid(to) {
        let jid = canonical_jid(to, default_cc);
        if local_part(&jid).chars().any(|c| c.is_ascii_digit()) {
            return Some(jid);
        }
        return None;
    }
    let phone = canonical_phone(to, default_cc);
    if phone.is_empty() {
        return None;
    }
    Some(format!("{}@{}", phone, USER_DOMAIN))
}
