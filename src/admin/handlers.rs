use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::admin::store::RawData;
use crate::admin::AdminState;
use crate::dynamic::Configuration;

#[derive(Serialize)]
pub struct VersionInfo {
    pub version: &'static str,
    pub providers: Vec<String>,
}

pub async fn get_version(State(state): State<AdminState>) -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        providers: state.store.raw().providers.keys().cloned().collect(),
    })
}

pub async fn get_rawdata(State(state): State<AdminState>) -> Json<Arc<RawData>> {
    Json(state.store.raw())
}

pub async fn get_provider(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<Arc<Configuration>>, StatusCode> {
    state
        .store
        .provider(&name)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
