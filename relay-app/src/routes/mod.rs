pub mod health;
pub mod streams;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(streams::router())
}
