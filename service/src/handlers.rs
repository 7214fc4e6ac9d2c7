//! Route handlers.
//!
//! Every mutating handler follows the same sequence: authenticate the
//! principal, enforce the route's role, claim the idempotency key, validate
//! the strict JSON body, then run the domain flow through the Kernel
//! orchestrator. Responses are canonical JSON either way.

use {
    crate::{
        auth::{authenticate, require_role, Principal, Role},
        reply::{error_reply, json_reply},
        AppState,
    },
    chrono::Utc,
    kernel_sdk::{
        audit::AppendOutcome,
        entity::EntityKind,
        error::KernelError,
        upgrade::UpgradeRequest,
    },
    serde::Deserialize,
    serde_json::{json, Map, Value},
    std::sync::Arc,
    uuid::Uuid,
    warp::{http::StatusCode, hyper::body::Bytes, reply::Response},
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SignBody {
    manifest: Value,
    #[serde(default)]
    #[allow(dead_code)] // accepted for wire compatibility; the signer id is authoritative
    signer_id: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AuditBody {
    event_type: String,
    payload: Value,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AgentBody {
    profile: Map<String, Value>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UpgradeSubmitBody {
    manifest: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ApproveBody {
    approver_id: String,
    signature: String,
}

fn parse_value(bytes: &Bytes) -> Result<Value, KernelError> {
    if bytes.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(bytes)
        .map_err(|e| KernelError::invalid_input("invalid_json", e.to_string()))
}

fn parse_body<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, KernelError> {
    serde_json::from_value(value.clone())
        .map_err(|e| KernelError::invalid_input("invalid_request", e.to_string()))
}

fn authed(
    state: &AppState,
    principal: Option<&str>,
    role: Role,
) -> Result<Principal, KernelError> {
    let principal = authenticate(&state.config, principal)?;
    require_role(&principal, role)?;
    Ok(principal)
}

pub async fn health() -> Response {
    json_reply(
        StatusCode::OK,
        &json!({"status": "ok", "ts": Utc::now()}),
    )
}

pub async fn ready(state: Arc<AppState>) -> Response {
    let (published, failed) = state.stream_stats.snapshot();
    match state.kernel.ready().await {
        Ok(()) => json_reply(
            StatusCode::OK,
            &json!({
                "status": "ready",
                "streaming": {"published": published, "failed": failed},
            }),
        ),
        Err(err) => {
            log::warn!("readiness probe failed: {err}");
            json_reply(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({"error": "store_unavailable"}),
            )
        }
    }
}

pub async fn sign(
    state: Arc<AppState>,
    idem_key: Option<String>,
    principal: Option<String>,
    bytes: Bytes,
) -> Response {
    let _principal = match authed(&state, principal.as_deref(), Role::Operator) {
        Ok(p) => p,
        Err(err) => return error_reply(&err),
    };
    let raw = match parse_value(&bytes) {
        Ok(v) => v,
        Err(err) => return error_reply(&err),
    };
    let body: SignBody = match parse_body(&raw) {
        Ok(b) => b,
        Err(err) => return error_reply(&err),
    };

    let run_state = state.clone();
    state
        .idempotency
        .run(idem_key, "POST", "/kernel/sign", &raw, || async move {
            let result = run_state
                .kernel
                .sign_manifest(&body.manifest, body.version)
                .await;
            if let Err(KernelError::SignerUnavailable(cause)) = &result {
                run_state
                    .kernel
                    .note_signer_error("/kernel/sign", &cause.to_string())
                    .await;
            }
            let signature = result?;
            Ok((
                StatusCode::OK,
                json!({"manifest": body.manifest, "manifestSignature": signature}),
            ))
        })
        .await
}

pub async fn audit_append(
    state: Arc<AppState>,
    idem_key: Option<String>,
    principal: Option<String>,
    bytes: Bytes,
) -> Response {
    if let Err(err) = authed(&state, principal.as_deref(), Role::Operator) {
        return error_reply(&err);
    }
    let raw = match parse_value(&bytes) {
        Ok(v) => v,
        Err(err) => return error_reply(&err),
    };
    let body: AuditBody = match parse_body(&raw) {
        Ok(b) => b,
        Err(err) => return error_reply(&err),
    };

    let run_state = state.clone();
    state
        .idempotency
        .run(idem_key, "POST", "/kernel/audit", &raw, || async move {
            let outcome = run_state
                .kernel
                .record_audit(&body.event_type, body.payload, body.metadata)
                .await;
            if let Err(KernelError::SignerUnavailable(cause)) = &outcome {
                run_state
                    .kernel
                    .note_signer_error("/kernel/audit", &cause.to_string())
                    .await;
            }
            let body = match outcome? {
                AppendOutcome::Sampled => json!({"id": "sampled"}),
                AppendOutcome::Appended(event) | AppendOutcome::Unchanged(event) => {
                    serde_json::to_value(event)
                        .map_err(|e| KernelError::Internal(anyhow::anyhow!(e)))?
                }
            };
            Ok((StatusCode::ACCEPTED, body))
        })
        .await
}

pub async fn audit_get(
    state: Arc<AppState>,
    principal: Option<String>,
    id: String,
) -> Response {
    // Reads require authentication but no specific role.
    if let Err(err) = authenticate(&state.config, principal.as_deref()) {
        return error_reply(&err);
    }

    let Ok(id) = Uuid::parse_str(&id) else {
        return error_reply(&KernelError::NotFound("audit event"));
    };
    match state.kernel.get_audit(id).await {
        Ok(Some(event)) => json_reply(StatusCode::OK, &json!(event)),
        Ok(None) => error_reply(&KernelError::NotFound("audit event")),
        Err(err) => error_reply(&err),
    }
}

pub async fn create_entity(
    state: Arc<AppState>,
    kind: EntityKind,
    idem_key: Option<String>,
    principal: Option<String>,
    bytes: Bytes,
) -> Response {
    let principal = match authed(&state, principal.as_deref(), Role::Operator) {
        Ok(p) => p,
        Err(err) => return error_reply(&err),
    };
    let raw = match parse_value(&bytes) {
        Ok(v) => v,
        Err(err) => return error_reply(&err),
    };

    // Agents use the profile-as-map form; the other kinds take the domain
    // manifest as the body itself.
    let payload = if kind == EntityKind::Agent {
        match parse_body::<AgentBody>(&raw) {
            Ok(body) => {
                let mut profile = body.profile;
                if let Some(id) = body.id {
                    profile.insert("id".to_string(), Value::String(id));
                }
                Value::Object(profile)
            }
            Err(err) => return error_reply(&err),
        }
    } else {
        raw.clone()
    };

    let path = format!("/kernel/{}", route_segment(kind));
    let audit_path = path.clone();
    let run_state = state.clone();
    let subject = principal.subject.clone();
    state
        .idempotency
        .run(idem_key, "POST", &path, &raw, || async move {
            let result = run_state.kernel.create_entity(kind, payload, &subject).await;
            if let Err(KernelError::SignerUnavailable(cause)) = &result {
                run_state
                    .kernel
                    .note_signer_error(&audit_path, &cause.to_string())
                    .await;
            }
            let (entity, signature) = result?;
            Ok((
                StatusCode::CREATED,
                json!({
                    "id": entity.id,
                    "manifest": entity.payload,
                    "manifestSignature": signature,
                }),
            ))
        })
        .await
}

fn route_segment(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Division => "division",
        EntityKind::Agent => "agent",
        EntityKind::Allocation => "allocate",
        EntityKind::Eval => "eval",
    }
}

pub async fn upgrade_submit(
    state: Arc<AppState>,
    idem_key: Option<String>,
    principal: Option<String>,
    bytes: Bytes,
) -> Response {
    let principal = match authed(&state, principal.as_deref(), Role::Admin) {
        Ok(p) => p,
        Err(err) => return error_reply(&err),
    };
    let raw = match parse_value(&bytes) {
        Ok(v) => v,
        Err(err) => return error_reply(&err),
    };
    let body: UpgradeSubmitBody = match parse_body(&raw) {
        Ok(b) => b,
        Err(err) => return error_reply(&err),
    };

    let run_state = state.clone();
    let subject = principal.subject.clone();
    state
        .idempotency
        .run(idem_key, "POST", "/kernel/upgrade", &raw, || async move {
            let upgrade = run_state
                .kernel
                .upgrades()
                .submit(body.manifest, &subject)
                .await?;
            Ok((StatusCode::CREATED, upgrade_json(&upgrade)?))
        })
        .await
}

pub async fn upgrade_approve(
    state: Arc<AppState>,
    id: String,
    idem_key: Option<String>,
    principal: Option<String>,
    bytes: Bytes,
) -> Response {
    if let Err(err) = authed(&state, principal.as_deref(), Role::Admin) {
        return error_reply(&err);
    }
    let Ok(upgrade_id) = Uuid::parse_str(&id) else {
        return error_reply(&KernelError::NotFound("upgrade"));
    };
    let raw = match parse_value(&bytes) {
        Ok(v) => v,
        Err(err) => return error_reply(&err),
    };
    let body: ApproveBody = match parse_body(&raw) {
        Ok(b) => b,
        Err(err) => return error_reply(&err),
    };

    let path = format!("/kernel/upgrade/{id}/approve");
    let run_state = state.clone();
    state
        .idempotency
        .run(idem_key, "POST", &path, &raw, || async move {
            let upgrade = run_state
                .kernel
                .upgrades()
                .approve(upgrade_id, &body.approver_id, &body.signature)
                .await?;
            Ok((StatusCode::OK, upgrade_json(&upgrade)?))
        })
        .await
}

pub async fn upgrade_apply(
    state: Arc<AppState>,
    id: String,
    idem_key: Option<String>,
    principal: Option<String>,
    bytes: Bytes,
) -> Response {
    let principal = match authed(&state, principal.as_deref(), Role::Admin) {
        Ok(p) => p,
        Err(err) => return error_reply(&err),
    };
    let Ok(upgrade_id) = Uuid::parse_str(&id) else {
        return error_reply(&KernelError::NotFound("upgrade"));
    };
    let raw = match parse_value(&bytes) {
        Ok(v) => v,
        Err(err) => return error_reply(&err),
    };

    let path = format!("/kernel/upgrade/{id}/apply");
    let audit_path = path.clone();
    let run_state = state.clone();
    let subject = principal.subject.clone();
    state
        .idempotency
        .run(idem_key, "POST", &path, &raw, || async move {
            let result = run_state.kernel.upgrades().apply(upgrade_id, &subject).await;
            if let Err(KernelError::SignerUnavailable(cause)) = &result {
                run_state
                    .kernel
                    .note_signer_error(&audit_path, &cause.to_string())
                    .await;
            }
            let (upgrade, signature) = result?;
            Ok((
                StatusCode::OK,
                json!({
                    "status": "applied",
                    "upgradeId": upgrade.upgrade_id,
                    "quorum": upgrade.quorum(),
                    "appliedAt": upgrade.applied_at,
                    "manifestSignature": signature,
                }),
            ))
        })
        .await
}

pub async fn upgrade_get(
    state: Arc<AppState>,
    principal: Option<String>,
    id: String,
) -> Response {
    if let Err(err) = authenticate(&state.config, principal.as_deref()) {
        return error_reply(&err);
    }
    let Ok(upgrade_id) = Uuid::parse_str(&id) else {
        return error_reply(&KernelError::NotFound("upgrade"));
    };
    match state.kernel.upgrades().get(upgrade_id).await {
        Ok(Some(upgrade)) => match upgrade_json(&upgrade) {
            Ok(body) => json_reply(StatusCode::OK, &body),
            Err(err) => error_reply(&err),
        },
        Ok(None) => error_reply(&KernelError::NotFound("upgrade")),
        Err(err) => error_reply(&err),
    }
}

pub async fn reason_passthrough(
    state: Arc<AppState>,
    principal: Option<String>,
    node: String,
) -> Response {
    if let Err(err) = authenticate(&state.config, principal.as_deref()) {
        return error_reply(&err);
    }

    let Some(base) = state.config.reason_graph_url.as_deref() else {
        return json_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({"error": "reason_graph_unconfigured"}),
        );
    };

    let url = format!("{}/{}", base.trim_end_matches('/'), node);
    match state.http.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
            Ok(body) => json_reply(StatusCode::OK, &body),
            Err(err) => {
                log::warn!("reason graph returned malformed json: {err}");
                json_reply(
                    StatusCode::BAD_GATEWAY,
                    &json!({"error": "reason_graph_unavailable"}),
                )
            }
        },
        Ok(resp) => {
            log::warn!("reason graph returned status {}", resp.status());
            json_reply(
                StatusCode::BAD_GATEWAY,
                &json!({"error": "reason_graph_unavailable"}),
            )
        }
        Err(err) => {
            log::warn!("reason graph unreachable: {err}");
            json_reply(
                StatusCode::BAD_GATEWAY,
                &json!({"error": "reason_graph_unavailable"}),
            )
        }
    }
}

fn upgrade_json(upgrade: &UpgradeRequest) -> Result<Value, KernelError> {
    serde_json::to_value(upgrade).map_err(|e| KernelError::Internal(anyhow::anyhow!(e)))
}
