use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const INTERACTION_TYPE_PING: u8 = 1;

// Non-ping interactions without `data` cannot be routed.
#[derive(Debug, Clone, Deserialize)]
pub struct Interaction {
    #[serde(rename = "type", default)]
    pub kind: Option<u8>,
    #[serde(default)]
    pub id: Option<String>,
    pub data: InteractionData,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub member: Option<Member>,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InteractionData {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<u8>,
    #[serde(default)]
    pub options: Vec<CommandOption>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandOption {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<u8>,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Member {
    pub user: User,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub discriminator: Option<String>,
}

impl User {
    /// `name#1234` for legacy accounts, plain username otherwise.
    pub fn display_name(&self) -> String {
        match self.discriminator.as_deref() {
            Some(d) if !d.is_empty() && d != "0" => format!("{}#{d}", self.username),
            _ => self.username.clone(),
        }
    }
}

impl Interaction {
    pub fn invoker(&self) -> Option<&User> {
        self.member
            .as_ref()
            .map(|m| &m.user)
            .or(self.user.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u8")]
pub enum ResponseKind {
    Pong,
    ChannelMessageWithSource,
}

impl From<ResponseKind> for u8 {
    fn from(kind: ResponseKind) -> Self {
        match kind {
            ResponseKind::Pong => 1,
            ResponseKind::ChannelMessageWithSource => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InteractionResponse {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<MessageContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageContent {
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardStatus {
    #[serde(default)]
    pub last_reward_timestamp: i64,
    #[serde(default)]
    pub current_timestamp: i64,
    #[serde(default)]
    pub last_reward: String,
    #[serde(default)]
    pub current_date: String,
    #[serde(default)]
    pub reward_streak: i64,
    #[serde(default)]
    pub result: bool,
    #[serde(rename = "rewardLeaderboard", default)]
    pub rank: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationCommand {
    pub name: String,
    pub description: String,
    pub options: Vec<Value>,
}
