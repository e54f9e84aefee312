use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use serde_json::{Map, Value};
use streakbot_contracts::{
    ApplicationCommand, CommandOption, Interaction, InteractionResponse, MessageContent,
    ResponseKind, RewardStatus, INTERACTION_TYPE_PING,
};
use thiserror::Error;

pub const STREAK_COMMAND: &str = "streak";

pub const PLACEHOLDER_TEXT: &str = "Please wait while we load the data...";
pub const UNAVAILABLE_TEXT: &str = "Streak data is temporarily unavailable, try again later :(";
pub const UNKNOWN_RANK: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature is not valid hex")]
    InvalidSignatureEncoding,
    #[error("signature must be 64 bytes, got {0}")]
    InvalidSignatureLength(usize),
    #[error("public key is not a valid ed25519 key")]
    InvalidKeyEncoding,
    #[error("signature does not match request")]
    Mismatch,
}

/// Checks a Discord request signature.
///
/// The signed message is the timestamp header followed by the body exactly
/// as received. Length and encoding problems are rejected before any curve
/// arithmetic.
pub fn verify(
    raw_body: &[u8],
    signature_hex: &str,
    timestamp: &str,
    public_key_hex: &str,
) -> Result<(), SignatureError> {
    let sig_bytes =
        hex::decode(signature_hex).map_err(|_| SignatureError::InvalidSignatureEncoding)?;
    let sig_bytes: [u8; SIGNATURE_LENGTH] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidSignatureLength(sig_bytes.len()))?;

    let key_bytes = hex::decode(public_key_hex).map_err(|_| SignatureError::InvalidKeyEncoding)?;
    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidKeyEncoding)?;
    let key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| SignatureError::InvalidKeyEncoding)?;

    let mut message = Vec::with_capacity(timestamp.len() + raw_body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(raw_body);

    key.verify(&message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| SignatureError::Mismatch)
}

pub fn is_authentic(
    raw_body: &[u8],
    signature_hex: &str,
    timestamp: &str,
    public_key_hex: &str,
) -> bool {
    verify(raw_body, signature_hex, timestamp, public_key_hex).is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed interaction: {0}")]
    MalformedInteraction(String),
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),
}

#[derive(Debug, Clone)]
pub enum ClassifiedInteraction {
    Ping,
    Command(CommandInvocation),
}

#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub name: String,
    pub token: String,
    pub interaction_id: Option<String>,
    pub options: Vec<CommandOption>,
    pub invoked_by: Option<String>,
}

impl From<Interaction> for CommandInvocation {
    fn from(interaction: Interaction) -> Self {
        let invoked_by = interaction.invoker().map(|u| u.display_name());
        Self {
            name: interaction.data.name,
            token: interaction.token,
            interaction_id: interaction.id,
            options: interaction.data.options,
            invoked_by,
        }
    }
}

/// Splits a verified body into a ping or the supported command.
///
/// Pings are recognised from the `type` field alone so that their sparse
/// payload is never run through the strict command shape.
pub fn classify(raw_body: &[u8]) -> Result<ClassifiedInteraction, DecodeError> {
    let probe: Map<String, Value> = serde_json::from_slice(raw_body)
        .map_err(|e| DecodeError::MalformedInteraction(e.to_string()))?;

    if probe.get("type").and_then(Value::as_f64) == Some(f64::from(INTERACTION_TYPE_PING)) {
        return Ok(ClassifiedInteraction::Ping);
    }

    let interaction: Interaction = serde_json::from_value(Value::Object(probe))
        .map_err(|e| DecodeError::MalformedInteraction(e.to_string()))?;
    if interaction.data.name != STREAK_COMMAND {
        return Err(DecodeError::UnsupportedCommand(interaction.data.name));
    }
    Ok(ClassifiedInteraction::Command(interaction.into()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamState {
    pub success: bool,
    pub streak_days: i64,
    pub last_reward_epoch_seconds: i64,
    pub rank: Option<i64>,
}

impl UpstreamState {
    pub fn unavailable() -> Self {
        Self::default()
    }
}

impl From<RewardStatus> for UpstreamState {
    fn from(status: RewardStatus) -> Self {
        Self {
            success: status.result,
            streak_days: status.reward_streak,
            last_reward_epoch_seconds: status.last_reward_timestamp,
            rank: status.rank,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub kind: ResponseKind,
    pub content: String,
}

impl OutboundMessage {
    pub fn pong() -> Self {
        Self {
            kind: ResponseKind::Pong,
            content: String::new(),
        }
    }

    pub fn placeholder() -> Self {
        Self::channel_message(PLACEHOLDER_TEXT.to_string())
    }

    fn channel_message(content: String) -> Self {
        Self {
            kind: ResponseKind::ChannelMessageWithSource,
            content,
        }
    }

    pub fn to_response(&self) -> InteractionResponse {
        InteractionResponse {
            kind: self.kind,
            data: match self.kind {
                ResponseKind::Pong => None,
                ResponseKind::ChannelMessageWithSource => Some(self.to_edit()),
            },
        }
    }

    pub fn to_edit(&self) -> MessageContent {
        MessageContent {
            content: self.content.clone(),
        }
    }
}

pub fn compose(state: &UpstreamState) -> OutboundMessage {
    if !state.success {
        return OutboundMessage::channel_message(UNAVAILABLE_TEXT.to_string());
    }
    let rank = match state.rank {
        Some(r) if r >= 0 => r.to_string(),
        _ => UNKNOWN_RANK.to_string(),
    };
    OutboundMessage::channel_message(format!(
        "The current streak is {} days (approximate rank: {rank}), that's {:.2} years. Last reward was {}",
        state.streak_days,
        streak_years(state.streak_days),
        discord_date_token(state.last_reward_epoch_seconds),
    ))
}

pub fn streak_years(days: i64) -> f64 {
    days as f64 / 365.0
}

/// Discord renders `<t:EPOCH:D>` as a long date in the reader's locale.
pub fn discord_date_token(epoch_seconds: i64) -> String {
    format!("<t:{epoch_seconds}:D>")
}

pub fn streak_command(description: &str) -> ApplicationCommand {
    ApplicationCommand {
        name: STREAK_COMMAND.to_string(),
        description: description.to_string(),
        options: vec![],
    }
}
