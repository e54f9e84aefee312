use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use reqwest::Client;
use serde_json::{json, Value};
use streakbot_config::Config;
use streakbot_contracts::{ApplicationCommand, MessageContent, RewardStatus};
use streakbot_kernel::{
    classify, compose, streak_command, verify, ClassifiedInteraction, CommandInvocation,
    DecodeError, OutboundMessage, UpstreamState,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn, Instrument, Span};
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "x-signature-ed25519";
pub const TIMESTAMP_HEADER: &str = "x-signature-timestamp";

const DISCORD_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("DiscordBot (streakbot, ", env!("CARGO_PKG_VERSION"), ")");

type Rejection = (StatusCode, Json<Value>);

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    if cfg.registration.enabled {
        if let Err(e) = register_commands(&cfg).await {
            warn!(error = %e, "command registration skipped");
        }
    }

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "listening for interactions");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg)?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/interactions", post(interactions))
        .route("/api/handle", post(interactions))
        .with_state(state))
}

pub async fn register_commands(cfg: &Config) -> Result<(), DiscordError> {
    let discord = DiscordClient::new(&cfg.discord).map_err(DiscordError::Client)?;
    let command = streak_command(&cfg.registration.description);
    let status = discord.register_command(&command).await?;
    info!(status, command = %command.name, "registered application command");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<Config>,
    upstream: UpstreamClient,
    discord: DiscordClient,
}

impl AppState {
    fn new(cfg: Config) -> Result<Self, String> {
        if cfg.discord.public_key.is_none() {
            warn!("discord public key is not configured; every interaction will be rejected");
        }
        if cfg.discord.application_id.is_none() {
            warn!("discord application id is not configured; follow-ups cannot be delivered");
        }
        Ok(Self {
            upstream: UpstreamClient::new(Duration::from_millis(cfg.upstream.timeout_ms))?,
            discord: DiscordClient::new(&cfg.discord)?,
            cfg: Arc::new(cfg),
        })
    }

    fn handle_interaction(&self, headers: &HeaderMap, body: &[u8]) -> Result<Response, Rejection> {
        let signature = header_str(headers, SIGNATURE_HEADER);
        let timestamp = header_str(headers, TIMESTAMP_HEADER);
        let public_key = self.cfg.discord.public_key.as_deref().unwrap_or_default();
        if let Err(e) = verify(body, signature, timestamp, public_key) {
            warn!(error = %e, "rejected interaction");
            return Err(rejection(
                StatusCode::UNAUTHORIZED,
                "signature_invalid",
                "invalid request signature",
            ));
        }

        let classified = classify(body).map_err(|e| {
            warn!(error = %e, "undecodable interaction");
            match e {
                DecodeError::MalformedInteraction(msg) => {
                    rejection(StatusCode::BAD_REQUEST, "malformed_interaction", &msg)
                }
                DecodeError::UnsupportedCommand(name) => rejection(
                    StatusCode::BAD_REQUEST,
                    "unsupported_command",
                    &format!("invalid command: {name}"),
                ),
            }
        })?;

        match classified {
            ClassifiedInteraction::Ping => {
                debug!("answered ping");
                Ok(Json(OutboundMessage::pong().to_response()).into_response())
            }
            ClassifiedInteraction::Command(cmd) => self.acknowledge(cmd),
        }
    }

    fn acknowledge(&self, cmd: CommandInvocation) -> Result<Response, Rejection> {
        let body = serde_json::to_vec(&OutboundMessage::placeholder().to_response()).map_err(|e| {
            rejection(
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialization_failed",
                &e.to_string(),
            )
        })?;
        let (ack_sent, ack_done) = oneshot::channel();

        info!(
            command = %cmd.name,
            interaction_id = cmd.interaction_id.as_deref().unwrap_or("-"),
            invoked_by = cmd.invoked_by.as_deref().unwrap_or("unknown"),
            options = cmd.options.len(),
            "acknowledged command"
        );
        if cmd.token.is_empty() {
            warn!("interaction carries no token; follow-up skipped");
        } else {
            tokio::spawn(follow_up(self.clone(), cmd.token, ack_done).instrument(Span::current()));
        }

        // A streamed body has no size hint, so HTTP/1.1 frames the ack as
        // chunked instead of sending Content-Length.
        Ok((
            [(header::CONTENT_TYPE, "application/json")],
            Body::from_stream(AckBody::new(Bytes::from(body), ack_sent)),
        )
            .into_response())
    }
}

async fn follow_up(state: AppState, token: String, ack_done: oneshot::Receiver<()>) {
    let upstream = match state.cfg.upstream.url.as_deref() {
        Some(url) => state.upstream.fetch_state(url).await,
        None => {
            warn!("upstream url is not configured");
            UpstreamState::unavailable()
        }
    };
    let message = compose(&upstream);

    // Sender side completes or drops once the ack body has left the handler.
    let _ = ack_done.await;

    match state.discord.edit_original(&token, &message.to_edit()).await {
        Ok(()) => info!(upstream_ok = upstream.success, "follow-up delivered"),
        Err(e) => warn!(error = %e, "follow-up delivery failed"),
    }
}

/// Single-chunk response body that reports when hyper has drained it.
struct AckBody {
    chunk: Option<Bytes>,
    sent: Option<oneshot::Sender<()>>,
}

impl AckBody {
    fn new(chunk: Bytes, sent: oneshot::Sender<()>) -> Self {
        Self {
            chunk: Some(chunk),
            sent: Some(sent),
        }
    }
}

impl Stream for AckBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.chunk.take() {
            Some(chunk) => Poll::Ready(Some(Ok(chunk))),
            None => {
                if let Some(sent) = this.sent.take() {
                    let _ = sent.send(());
                }
                Poll::Ready(None)
            }
        }
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn interactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Rejection> {
    let span = tracing::info_span!("interaction", request_id = %Uuid::new_v4().as_simple());
    span.in_scope(|| state.handle_interaction(&headers, &body))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn rejection(status: StatusCode, code: &str, message: &str) -> Rejection {
    (
        status,
        Json(json!({"error": {"code": code, "message": message}})),
    )
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { client })
    }

    // Transport, status and decode problems all map to unavailable.
    pub async fn fetch_state(&self, url: &str) -> UpstreamState {
        let response = match self.client.get(url).send().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "upstream request failed");
                return UpstreamState::unavailable();
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "upstream returned error status");
            return UpstreamState::unavailable();
        }
        match response.json::<RewardStatus>().await {
            Ok(status) => {
                let state = UpstreamState::from(status);
                if !state.success {
                    warn!("upstream reported an unsuccessful result");
                }
                state
            }
            Err(e) => {
                warn!(error = %e, "upstream body did not decode");
                UpstreamState::unavailable()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscordError {
    #[error("discord application id is not configured")]
    MissingApplicationId,
    #[error("discord bot token is not configured")]
    MissingBotToken,
    #[error("http client setup failed: {0}")]
    Client(String),
    #[error("discord request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("discord returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Clone)]
pub struct DiscordClient {
    client: Client,
    api_base: String,
    application_id: Option<String>,
    bot_token: Option<String>,
}

impl DiscordClient {
    pub fn new(cfg: &streakbot_config::Discord) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(DISCORD_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            application_id: cfg.application_id.clone(),
            bot_token: cfg.bot_token.clone(),
        })
    }

    pub fn follow_up_url(&self, token: &str) -> Result<String, DiscordError> {
        let application_id = self
            .application_id
            .as_deref()
            .ok_or(DiscordError::MissingApplicationId)?;
        Ok(format!(
            "{}/webhooks/{application_id}/{token}/messages/@original",
            self.api_base
        ))
    }

    pub async fn edit_original(
        &self,
        token: &str,
        message: &MessageContent,
    ) -> Result<(), DiscordError> {
        let url = self.follow_up_url(token)?;
        let response = self.client.patch(url).json(message).send().await?;
        check_status(response).await.map(|_| ())
    }

    pub async fn register_command(&self, command: &ApplicationCommand) -> Result<u16, DiscordError> {
        let application_id = self
            .application_id
            .as_deref()
            .ok_or(DiscordError::MissingApplicationId)?;
        let bot_token = self
            .bot_token
            .as_deref()
            .ok_or(DiscordError::MissingBotToken)?;
        let url = format!("{}/applications/{application_id}/commands", self.api_base);
        let response = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, format!("Bot {bot_token}"))
            .json(command)
            .send()
            .await?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<u16, DiscordError> {
    let status = response.status();
    if status.is_success() {
        return Ok(status.as_u16());
    }
    let body = response.text().await.unwrap_or_default();
    Err(DiscordError::Status {
        status: status.as_u16(),
        body,
    })
}
