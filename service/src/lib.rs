//! Kernel HTTP runtime.
//!
//! Binds the sdk core to a warp server: principal extraction, idempotency,
//! strict request bodies, the documented route set, and the background
//! streaming worker.

pub mod auth;
pub mod handlers;
pub mod idempotency;
pub mod reply;
pub mod routes;
pub mod stream;

use {
    crate::{idempotency::IdempotencyLayer, stream::StreamStats},
    kernel_sdk::{config::KernelConfig, kernel::Kernel},
    std::sync::Arc,
};

pub use routes::routes;

/// Shared state for every route.
pub struct AppState {
    pub kernel: Kernel,
    pub idempotency: IdempotencyLayer,
    pub config: KernelConfig,
    pub stream_stats: Arc<StreamStats>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(
        kernel: Kernel,
        idempotency: IdempotencyLayer,
        config: KernelConfig,
        stream_stats: Arc<StreamStats>,
    ) -> Self {
        Self {
            kernel,
            idempotency,
            config,
            stream_stats,
            http: reqwest::Client::new(),
        }
    }
}
