use super::error::ApiError;
use super::state::ApiState;
use crate::credentials::DefinitionSpec;
use crate::registry::{CloseReason, InstanceStatus};
use crate::store::BotDefinition;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Hard ceiling on how long a synchronous invoke may suspend its
/// caller, whatever deadline the request asks for.
const MAX_SYNC_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
pub(super) struct CreateBotRequest {
    name: String,
    #[serde(default)]
    description: String,
    adapter_type: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    configuration: Option<Value>,
}

#[derive(Serialize)]
pub(super) struct CreateBotResponse {
    bot_id: String,
    one_time_registration_token: String,
    created_at: String,
}

/// Definition as exposed by read APIs. Credentials never appear here.
#[derive(Serialize)]
pub(super) struct BotView {
    bot_id: String,
    name: String,
    description: String,
    adapter_type: String,
    capabilities: Vec<String>,
    configuration: Value,
    created_at: String,
}

impl From<BotDefinition> for BotView {
    fn from(definition: BotDefinition) -> Self {
        Self {
            bot_id: definition.bot_id,
            name: definition.name,
            description: definition.description,
            adapter_type: definition.adapter_type,
            capabilities: definition.declared_capabilities,
            configuration: definition.configuration,
            created_at: definition.created_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub(super) struct BotListResponse {
    bots: Vec<BotView>,
}

#[derive(Deserialize)]
pub(super) struct UpdateBotRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    capabilities: Option<Vec<String>>,
    #[serde(default)]
    configuration: Option<Value>,
}

#[derive(Serialize)]
pub(super) struct InstanceView {
    instance_id: String,
    connected_at: String,
    runtime_capabilities: Vec<String>,
    last_heartbeat_at: String,
}

#[derive(Serialize)]
pub(super) struct InstanceListResponse {
    instances: Vec<InstanceView>,
}

#[derive(Deserialize)]
pub(super) struct InvokeQuery {
    /// Requested dispatch deadline; capped at [`MAX_SYNC_DEADLINE`].
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

#[derive(Serialize)]
pub(super) struct InvokeResponse {
    result: Value,
}

pub(super) async fn create_bot(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateBotRequest>,
) -> Result<(StatusCode, Json<CreateBotResponse>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    if request.adapter_type.trim().is_empty() {
        return Err(ApiError::bad_request("adapter_type must not be empty"));
    }

    let minted = state
        .core
        .credentials
        .create_definition(DefinitionSpec {
            name: request.name,
            description: request.description,
            adapter_type: request.adapter_type,
            capabilities: request.capabilities,
            configuration: request.configuration.unwrap_or_else(|| Value::Object(Default::default())),
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateBotResponse {
            bot_id: minted.definition.bot_id,
            one_time_registration_token: minted.one_time_token,
            created_at: minted.definition.created_at.to_rfc3339(),
        }),
    ))
}

pub(super) async fn list_bots(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<BotListResponse>, ApiError> {
    let definitions = state.core.credentials.list_definitions().await?;
    Ok(Json(BotListResponse {
        bots: definitions.into_iter().map(BotView::from).collect(),
    }))
}

pub(super) async fn get_bot(
    State(state): State<Arc<ApiState>>,
    Path(bot_id): Path<String>,
) -> Result<Json<BotView>, ApiError> {
    let definition = state
        .core
        .credentials
        .get_definition(&bot_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("bot not found: {bot_id}")))?;
    Ok(Json(definition.into()))
}

pub(super) async fn update_bot(
    State(state): State<Arc<ApiState>>,
    Path(bot_id): Path<String>,
    Json(request): Json<UpdateBotRequest>,
) -> Result<Json<BotView>, ApiError> {
    let mut definition = state
        .core
        .credentials
        .get_definition(&bot_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("bot not found: {bot_id}")))?;

    if let Some(name) = request.name {
        if name.trim().is_empty() {
            return Err(ApiError::bad_request("name must not be empty"));
        }
        definition.name = name;
    }
    if let Some(description) = request.description {
        definition.description = description;
    }
    if let Some(capabilities) = request.capabilities {
        definition.declared_capabilities = capabilities;
    }
    if let Some(configuration) = request.configuration {
        definition.configuration = configuration;
    }

    state.core.credentials.update_definition(&definition).await?;
    Ok(Json(definition.into()))
}

pub(super) async fn delete_bot(
    State(state): State<Arc<ApiState>>,
    Path(bot_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let deleted = state.core.credentials.delete_definition(&bot_id).await?;
    if !deleted {
        return Err(ApiError::not_found(format!("bot not found: {bot_id}")));
    }

    // Credentials are gone; force down anything still connected.
    state.core.teardown_bot(&bot_id, CloseReason::BotDeleted);
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn list_instances(
    State(state): State<Arc<ApiState>>,
    Path(bot_id): Path<String>,
) -> Result<Json<InstanceListResponse>, ApiError> {
    if state.core.credentials.get_definition(&bot_id).await?.is_none() {
        return Err(ApiError::not_found(format!("bot not found: {bot_id}")));
    }

    let instances = state
        .core
        .registry
        .list_by_bot(&bot_id)
        .into_iter()
        .filter(|handle| handle.status() == InstanceStatus::Active)
        .map(|handle| InstanceView {
            instance_id: handle.instance_id.to_string(),
            connected_at: handle.connected_at.to_rfc3339(),
            runtime_capabilities: handle.capabilities.clone(),
            last_heartbeat_at: handle.last_heartbeat_at().to_rfc3339(),
        })
        .collect();

    Ok(Json(InstanceListResponse { instances }))
}

pub(super) async fn close_instance(
    State(state): State<Arc<ApiState>>,
    Path((bot_id, instance_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let handle = state
        .core
        .registry
        .get(&instance_id)
        .filter(|handle| handle.bot_id.as_ref() == bot_id)
        .ok_or_else(|| ApiError::not_found(format!("instance not found: {instance_id}")))?;

    handle.begin_drain(CloseReason::AdminClose);
    Ok(StatusCode::NO_CONTENT)
}

/// Synchronous dispatch: suspends the caller for up to
/// min(`timeout_seconds`, 30s) (the configured default when the query
/// parameter is omitted) and returns the command result inline.
pub(super) async fn invoke_command(
    State(state): State<Arc<ApiState>>,
    Path((bot_id, command_name)): Path<(String, String)>,
    Query(query): Query<InvokeQuery>,
    Json(arguments): Json<Value>,
) -> Result<Json<InvokeResponse>, ApiError> {
    if state.core.credentials.get_definition(&bot_id).await?.is_none() {
        return Err(ApiError::not_found(format!("bot not found: {bot_id}")));
    }
    if query.timeout_seconds == Some(0) {
        return Err(ApiError::bad_request("timeout_seconds must be at least 1"));
    }

    let deadline = query
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(state.core.config.dispatch_default_deadline)
        .min(MAX_SYNC_DEADLINE);

    let trace_id = uuid::Uuid::new_v4();
    let response = state
        .core
        .dispatcher
        .dispatch(
            &bot_id,
            &command_name,
            &command_name,
            &arguments,
            trace_id,
            deadline,
        )
        .await?;

    let result = response
        .result
        .as_deref()
        .and_then(|raw| serde_json::from_slice(raw).ok())
        .unwrap_or(Value::Null);
    Ok(Json(InvokeResponse { result }))
}
