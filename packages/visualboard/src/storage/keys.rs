//! Storage key construction. All writers agree on these shapes, which is
//! what makes per-key last-write-wins safe.

use crate::model::{ChatId, ScenarioKey};

pub const LAST_SUCCESS_PREFIX: &str = "rofan-visualboard-last-success";
pub const CAST_PREFIX: &str = "rofan-visualboard-cast";
pub const SERVER_ENV: &str = "server_env";

pub fn chat_logs(chat_id: &ChatId) -> String {
    format!("chat_logs::{}", chat_id)
}

pub fn chat_logs_initialized(chat_id: &ChatId) -> String {
    format!("chat_logs_initialized::{}", chat_id)
}

pub fn first_message(chat_id: &ChatId) -> String {
    format!("first_message::{}", chat_id)
}

pub fn session_map(chat_id: &ChatId) -> String {
    format!("session_map::{}", chat_id)
}

pub fn bot_master(bot_id: &str) -> String {
    format!("bot_master::{}", bot_id)
}

pub fn chat_user(chat_id: &ChatId) -> String {
    format!("chat_user::{}", chat_id)
}

pub fn last_success(scenario_key: &ScenarioKey) -> String {
    format!("{}::{}", LAST_SUCCESS_PREFIX, scenario_key)
}

pub fn cast(scenario_key: &ScenarioKey) -> String {
    format!("{}::{}", CAST_PREFIX, scenario_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let key = ScenarioKey::new("https://rofan.ai/chat/abc");
        assert_eq!(
            last_success(&key),
            "rofan-visualboard-last-success::https://rofan.ai/chat/abc"
        );
        assert_eq!(cast(&key), "rofan-visualboard-cast::https://rofan.ai/chat/abc");
        assert_eq!(chat_logs(&ChatId::new("abc")), "chat_logs::abc");
        assert_eq!(bot_master("b1"), "bot_master::b1");
    }
}
