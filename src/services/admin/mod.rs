//! Local admin/log HTTP service: story management, asset status, access logs,
//! answers and view statistics over SQLite.

pub mod db;
mod routes;

use crate::core::catalog::Catalog;
use crate::core::config::Config;
use crate::services::assets::PregeneratedAssets;
use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use db::Database;
use log::{error, info};
use std::path::Path;
use std::sync::Arc;

pub use routes::router;

#[derive(Clone)]
pub struct AdminState {
    pub db: Arc<Database>,
    pub assets: Arc<PregeneratedAssets>,
}

impl AdminState {
    pub fn new(db: Database, assets: PregeneratedAssets) -> Self {
        Self {
            db: Arc::new(db),
            assets: Arc::new(assets),
        }
    }
}

/// An error rendered as `{ "error": message }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!("Admin request failed: {:#}", e);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

/// Opens the database, seeds it from the catalog and serves until the process is stopped.
pub async fn serve(config: &Config, catalog: &Catalog) -> Result<()> {
    let db = Database::open(Path::new(&config.server.database))?;
    db.seed(catalog)?;
    let state = AdminState::new(db, PregeneratedAssets::new(config.public_path()));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("📊 Admin API listening on http://{}", listener.local_addr()?);
    info!("📁 Database: {}", config.server.database);

    axum::serve(listener, router(state))
        .await
        .context("Admin server stopped unexpectedly")
}
