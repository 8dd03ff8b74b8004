use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    NewBattle(NewBattle),
    ActionCompleted(ActionCompleted),
    ActionsUpdated(ActionsUpdated),
    ChatMessageReceived(ChatMessageReceived),
    InitCharacterData(InitCharacterData),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBattle {
    #[serde(default)]
    pub battle_id: Option<Value>,
    #[serde(default)]
    pub wave: Option<u32>,
    #[serde(default)]
    pub combat_start_time: Option<String>,
}

impl NewBattle {
    pub fn battle_id(&self) -> Option<String> {
        match self.battle_id.as_ref()? {
            Value::Number(number) => Some(number.to_string()),
            Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterAction {
    #[serde(default)]
    pub action_hrid: Option<String>,
    #[serde(default)]
    pub wave: Option<u32>,
    #[serde(default)]
    pub is_done: bool,
    #[serde(default)]
    pub difficulty_tier: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCompleted {
    #[serde(default)]
    pub end_character_action: Option<CharacterAction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionsUpdated {
    #[serde(default)]
    pub end_character_actions: Vec<CharacterAction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitCharacterData {
    #[serde(default)]
    pub character_actions: Vec<CharacterAction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageReceived {
    #[serde(default)]
    pub message: Option<ChatMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub chan: Option<String>,
    #[serde(default)]
    pub is_system_message: bool,
    #[serde(default)]
    pub m: Option<String>,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub system_metadata: Option<Value>,
}

impl ChatMessage {
    /// The metadata arrives either as an embedded JSON string or as an object.
    pub fn metadata(&self) -> Option<Value> {
        match self.system_metadata.as_ref()? {
            Value::String(raw_json) => serde_json::from_str::<Value>(raw_json).ok(),
            Value::Object(_) => self.system_metadata.clone(),
            _ => None,
        }
    }
}

pub fn decode_push_message(raw_json: &str) -> Result<PushMessage, String> {
    serde_json::from_str::<PushMessage>(raw_json.trim())
        .map_err(|error| format!("Failed to decode push message: {error}"))
}
