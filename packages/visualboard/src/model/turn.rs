use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of UTF-16 code units of trimmed text folded into a content turn id.
const TURN_ID_PREFIX_UNITS: usize = 50;

/// Fingerprint deciding "is this the turn I already processed".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(String);

impl TurnId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stripped alongside Unicode whitespace, as the browser's `trim()` does.
const BYTE_ORDER_MARK: char = '\u{feff}';

/// An explicit message id wins; otherwise `"{len}:{prefix}"` over the trimmed
/// text. Length and prefix are measured in UTF-16 code units so ids match
/// records written by the browser build. A surrogate pair is never split, so
/// an astral character straddling unit 50 is left out of the prefix.
pub fn calculate_turn_id(text: &str, message_id: Option<&str>) -> TurnId {
    if let Some(id) = message_id.filter(|id| !id.is_empty()) {
        return TurnId::new(id);
    }

    let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c == BYTE_ORDER_MARK);
    let length: usize = trimmed.chars().map(char::len_utf16).sum();

    let mut units = 0;
    let prefix: String = trimmed
        .chars()
        .take_while(|c| {
            units += c.len_utf16();
            units <= TURN_ID_PREFIX_UNITS
        })
        .collect();

    TurnId(format!("{}:{}", length, prefix))
}

/// One persisted turn, insertion order = chronological order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnLogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_text: Option<String>,
    pub created_at: i64,
}

impl TurnLogEntry {
    fn has_assistant_text(&self) -> bool {
        self.assistant_text
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Last entry, scanning backwards, with a non-empty assistant text.
pub fn last_assistant_text(entries: &[TurnLogEntry]) -> Option<&TurnLogEntry> {
    entries.iter().rev().find(|e| e.has_assistant_text())
}

/// Who authored a role/content message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// The three upstream turn-log shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum RawTurnLog {
    /// `{ user, bot }` pair in one object
    UserBotPair {
        id: Option<String>,
        user: Option<String>,
        bot: Option<String>,
        created_at: Option<i64>,
    },
    /// Chat-completion style `{ role, content }` message
    RoleContent {
        id: Option<String>,
        role: Role,
        content: String,
        created_at: Option<i64>,
    },
    /// Anything carrying loosely named user/assistant fields
    Generic {
        id: Option<String>,
        user_text: Option<String>,
        assistant_text: Option<String>,
        created_at: Option<i64>,
    },
}

fn string_field(obj: &serde_json::Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match obj.get(*name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    })
}

fn id_field(obj: &serde_json::Map<String, Value>) -> Option<String> {
    ["logId", "log_id", "id", "_id"]
        .iter()
        .find_map(|name| match obj.get(*name) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
}

fn created_at_field(obj: &serde_json::Map<String, Value>) -> Option<i64> {
    ["createdAt", "created_at", "timestamp"]
        .iter()
        .find_map(|name| match obj.get(*name) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis()),
            _ => None,
        })
}

impl RawTurnLog {
    /// Tag an upstream JSON value with its shape. Non-objects and objects
    /// without any text are dropped.
    pub fn classify(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let id = id_field(obj);
        let created_at = created_at_field(obj);

        if let (Some(Value::String(role)), Some(content)) =
            (obj.get("role"), string_field(obj, &["content"]))
        {
            let role = match role.as_str() {
                "user" | "human" => Role::User,
                "assistant" | "bot" | "model" | "ai" | "char" => Role::Assistant,
                _ => return None,
            };
            return Some(RawTurnLog::RoleContent {
                id,
                role,
                content,
                created_at,
            });
        }

        if obj.contains_key("user") || obj.contains_key("bot") {
            let user = string_field(obj, &["user"]);
            let bot = string_field(obj, &["bot"]);
            if user.is_none() && bot.is_none() {
                return None;
            }
            return Some(RawTurnLog::UserBotPair {
                id,
                user,
                bot,
                created_at,
            });
        }

        let user_text = string_field(obj, &["userText", "user_text", "userMessage", "input"]);
        let assistant_text = string_field(
            obj,
            &["assistantText", "assistant_text", "aiText", "botMessage", "output", "message"],
        );
        if user_text.is_none() && assistant_text.is_none() {
            return None;
        }
        Some(RawTurnLog::Generic {
            id,
            user_text,
            assistant_text,
            created_at,
        })
    }
}

/// Collapse upstream logs into canonical entries. Role/content messages are
/// paired: a user message opens an entry, the following assistant message
/// closes it. An assistant message with no open user message stands alone.
pub fn normalize_turn_logs(raw: Vec<RawTurnLog>, now: i64) -> Vec<TurnLogEntry> {
    let mut entries: Vec<TurnLogEntry> = Vec::with_capacity(raw.len());
    let mut open_user: Option<TurnLogEntry> = None;

    for item in raw {
        match item {
            RawTurnLog::RoleContent {
                id,
                role: Role::User,
                content,
                created_at,
            } => {
                if let Some(pending) = open_user.take() {
                    entries.push(pending);
                }
                open_user = Some(TurnLogEntry {
                    log_id: id,
                    user_text: Some(content),
                    assistant_text: None,
                    created_at: created_at.unwrap_or(now),
                });
            }
            RawTurnLog::RoleContent {
                id,
                role: Role::Assistant,
                content,
                created_at,
            } => match open_user.take() {
                Some(mut pending) => {
                    pending.assistant_text = Some(content);
                    if pending.log_id.is_none() {
                        pending.log_id = id;
                    }
                    entries.push(pending);
                }
                None => entries.push(TurnLogEntry {
                    log_id: id,
                    user_text: None,
                    assistant_text: Some(content),
                    created_at: created_at.unwrap_or(now),
                }),
            },
            RawTurnLog::UserBotPair {
                id,
                user,
                bot,
                created_at,
            } => {
                if let Some(pending) = open_user.take() {
                    entries.push(pending);
                }
                entries.push(TurnLogEntry {
                    log_id: id,
                    user_text: user,
                    assistant_text: bot,
                    created_at: created_at.unwrap_or(now),
                });
            }
            RawTurnLog::Generic {
                id,
                user_text,
                assistant_text,
                created_at,
            } => {
                if let Some(pending) = open_user.take() {
                    entries.push(pending);
                }
                entries.push(TurnLogEntry {
                    log_id: id,
                    user_text,
                    assistant_text,
                    created_at: created_at.unwrap_or(now),
                });
            }
        }
    }

    if let Some(pending) = open_user {
        entries.push(pending);
    }
    entries
}

/// Classify and normalize a JSON array in one go.
pub fn normalize_json_logs(values: &[Value], now: i64) -> Vec<TurnLogEntry> {
    normalize_turn_logs(values.iter().filter_map(RawTurnLog::classify).collect(), now)
}

/// Text handed to the analyzer for one turn.
pub fn combined_turn_text(user_text: Option<&str>, ai_text: &str) -> String {
    match user_text.map(str::trim).filter(|t| !t.is_empty()) {
        Some(user) => format!("[USER]\n{}\n\n[AI]\n{}", user, ai_text.trim()),
        None => ai_text.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn turn_id_ignores_surrounding_whitespace() {
        let a = calculate_turn_id("  The knight draws his sword.\n", None);
        let b = calculate_turn_id("The knight draws his sword.", None);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "27:The knight draws his sword.");
    }

    #[test]
    fn explicit_message_id_wins() {
        assert_eq!(
            calculate_turn_id("anything", Some("msg-42")),
            TurnId::new("msg-42")
        );
        assert_eq!(
            calculate_turn_id("other text", Some("msg-42")),
            TurnId::new("msg-42")
        );
        // an empty id is treated as absent
        assert_eq!(calculate_turn_id("x", Some("")), TurnId::new("1:x"));
    }

    #[test]
    fn turn_id_prefix_is_fifty_units() {
        let text = "가".repeat(80);
        let id = calculate_turn_id(&text, None);
        assert_eq!(id.as_str(), format!("80:{}", "가".repeat(50)));

        // same length and prefix collide by construction
        let a = format!("{}{}", "a".repeat(50), "xyz");
        let b = format!("{}{}", "a".repeat(50), "qrs");
        assert_eq!(calculate_turn_id(&a, None), calculate_turn_id(&b, None));
    }

    #[test]
    fn turn_id_strips_byte_order_mark() {
        let id = calculate_turn_id("\u{feff} The knight draws his sword.\u{feff}\n", None);
        assert_eq!(id.as_str(), "27:The knight draws his sword.");
    }

    #[test]
    fn astral_char_straddling_the_prefix_end_is_left_out() {
        let text = format!("{}😀tail", "a".repeat(49));
        let id = calculate_turn_id(&text, None);
        assert_eq!(id.as_str(), format!("55:{}", "a".repeat(49)));
    }

    #[test]
    fn turn_id_counts_astral_chars_as_two_units() {
        let id = calculate_turn_id("😀a", None);
        assert_eq!(id.as_str(), "3:😀a");
    }

    #[test]
    fn normalizes_three_upstream_shapes() {
        let logs = vec![
            json!({"role": "user", "content": "hi", "id": 1, "createdAt": 10}),
            json!({"role": "assistant", "content": "hello there"}),
            json!({"user": "and you?", "bot": "fine", "id": "p2"}),
            json!({"userText": "ok", "assistantText": "bye", "createdAt": "2024-01-01T00:00:00Z"}),
            json!("not an object"),
            json!({"role": "system", "content": "ignored"}),
        ];

        let entries = normalize_json_logs(&logs, 99);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].log_id.as_deref(), Some("1"));
        assert_eq!(entries[0].user_text.as_deref(), Some("hi"));
        assert_eq!(entries[0].assistant_text.as_deref(), Some("hello there"));
        assert_eq!(entries[0].created_at, 10);
        assert_eq!(entries[1].log_id.as_deref(), Some("p2"));
        assert_eq!(entries[1].created_at, 99);
        assert_eq!(entries[2].created_at, 1_704_067_200_000);
    }

    #[test]
    fn dangling_user_message_is_kept() {
        let logs = vec![
            json!({"role": "user", "content": "first"}),
            json!({"role": "user", "content": "second"}),
        ];
        let entries = normalize_json_logs(&logs, 0);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.assistant_text.is_none()));
    }

    #[test]
    fn last_assistant_text_scans_backwards() {
        let entries = vec![
            TurnLogEntry {
                log_id: None,
                user_text: None,
                assistant_text: Some("old".to_string()),
                created_at: 1,
            },
            TurnLogEntry {
                log_id: None,
                user_text: Some("pending".to_string()),
                assistant_text: Some("   ".to_string()),
                created_at: 2,
            },
        ];
        assert_eq!(
            last_assistant_text(&entries).and_then(|e| e.assistant_text.as_deref()),
            Some("old")
        );
        assert!(last_assistant_text(&[]).is_none());
    }

    #[test]
    fn combined_text_uses_role_markers() {
        assert_eq!(
            combined_turn_text(Some("Hello"), "The knight draws his sword."),
            "[USER]\nHello\n\n[AI]\nThe knight draws his sword."
        );
        assert_eq!(combined_turn_text(Some("  "), " ai "), "ai");
    }
}
