//! Route composition for the Kernel HTTP surface.
//!
//! Request bodies are capped at 1 MiB via `warp::body::content_length_limit`,
//! which also rejects requests without a `Content-Length` header. All
//! handlers produce their own responses; the final `recover` only translates
//! warp-level rejections into canonical JSON errors.

use {
    crate::{
        auth::PRINCIPAL_HEADER,
        handlers,
        idempotency::IDEMPOTENCY_HEADER,
        reply::handle_rejection,
        AppState,
    },
    kernel_sdk::entity::EntityKind,
    std::{convert::Infallible, sync::Arc},
    warp::{hyper::body::Bytes, Filter, Reply},
};

/// Strict request body cap.
pub const MAX_BODY_BYTES: u64 = 1024 * 1024;

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let with_state = {
        let state = state.clone();
        warp::any().map(move || state.clone())
    };
    let idem_key = warp::header::optional::<String>(IDEMPOTENCY_HEADER);
    let principal = warp::header::optional::<String>(PRINCIPAL_HEADER);
    let json_body = warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::bytes());

    let health = warp::get()
        .and(warp::path!("health"))
        .then(handlers::health);

    let ready = warp::get()
        .and(warp::path!("ready"))
        .and(with_state.clone())
        .then(handlers::ready);

    let sign = warp::post()
        .and(warp::path!("kernel" / "sign"))
        .and(with_state.clone())
        .and(idem_key.clone())
        .and(principal.clone())
        .and(json_body.clone())
        .then(
            |state, key, principal, bytes| handlers::sign(state, key, principal, bytes),
        );

    let audit_append = warp::post()
        .and(warp::path!("kernel" / "audit"))
        .and(with_state.clone())
        .and(idem_key.clone())
        .and(principal.clone())
        .and(json_body.clone())
        .then(|state, key, principal, bytes| {
            handlers::audit_append(state, key, principal, bytes)
        });

    let audit_get = warp::get()
        .and(warp::path!("kernel" / "audit" / String))
        .and(with_state.clone())
        .and(principal.clone())
        .then(|id, state, principal| handlers::audit_get(state, principal, id));

    let entity = |segment: &'static str, kind: EntityKind| {
        warp::post()
            .and(warp::path("kernel"))
            .and(warp::path(segment))
            .and(warp::path::end())
            .and(with_state.clone())
            .and(idem_key.clone())
            .and(principal.clone())
            .and(json_body.clone())
            .then(
                move |state, key, principal, bytes: Bytes| {
                    handlers::create_entity(state, kind, key, principal, bytes)
                },
            )
    };

    let division = entity("division", EntityKind::Division);
    let agent = entity("agent", EntityKind::Agent);
    let allocate = entity("allocate", EntityKind::Allocation);
    let eval = entity("eval", EntityKind::Eval);

    let upgrade_submit = warp::post()
        .and(warp::path!("kernel" / "upgrade"))
        .and(with_state.clone())
        .and(idem_key.clone())
        .and(principal.clone())
        .and(json_body.clone())
        .then(|state, key, principal, bytes| {
            handlers::upgrade_submit(state, key, principal, bytes)
        });

    let upgrade_approve = warp::post()
        .and(warp::path!("kernel" / "upgrade" / String / "approve"))
        .and(with_state.clone())
        .and(idem_key.clone())
        .and(principal.clone())
        .and(json_body.clone())
        .then(|id, state, key, principal, bytes| {
            handlers::upgrade_approve(state, id, key, principal, bytes)
        });

    let upgrade_apply = warp::post()
        .and(warp::path!("kernel" / "upgrade" / String / "apply"))
        .and(with_state.clone())
        .and(idem_key.clone())
        .and(principal.clone())
        .and(json_body.clone())
        .then(|id, state, key, principal, bytes| {
            handlers::upgrade_apply(state, id, key, principal, bytes)
        });

    let upgrade_get = warp::get()
        .and(warp::path!("kernel" / "upgrade" / String))
        .and(with_state.clone())
        .and(principal.clone())
        .then(|id, state, principal| handlers::upgrade_get(state, principal, id));

    let reason = warp::get()
        .and(warp::path!("kernel" / "reason" / String))
        .and(with_state.clone())
        .and(principal.clone())
        .then(|node, state, principal| handlers::reason_passthrough(state, principal, node));

    health
        .or(ready)
        .or(sign)
        .or(audit_append)
        .or(audit_get)
        .or(division)
        .or(agent)
        .or(allocate)
        .or(eval)
        .or(upgrade_submit)
        .or(upgrade_approve)
        .or(upgrade_apply)
        .or(upgrade_get)
        .or(reason)
        .recover(handle_rejection)
}
