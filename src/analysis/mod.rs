//! Plate analysis: model answer parsing, percentage normalization, image
//! annotation, the record store and the HTTP surface over them.

pub mod annotate;
mod dto;
pub mod handlers;
pub mod model;
pub mod normalize;
pub mod parse;
pub mod repo;
pub mod sanitize;
pub mod services;

use crate::state::AppState;
use axum::Router;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::read_routes())
        .merge(handlers::write_routes())
}
