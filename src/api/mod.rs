//! Transport adapter: routing, shared state, and domain-to-HTTP mapping.

pub mod auth;
pub mod handlers;

use crate::cache::CacheFabric;
use crate::character::CharacterService;
use crate::config::Config;
use crate::error::{BusinessError, Error};
use crate::esi::{TokenBucket, UpstreamApi};
use crate::market::{MarketOrderStore, MarketRefresher};
use crate::navigation::Navigation;
use crate::sde::SdeCatalog;
use crate::trading::{InventorySellOrchestrator, RouteEngine};
use axum::{
    http::StatusCode,
    middleware as axum_mw,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

/// Shared application state, cloned per request. Everything inside is an
/// `Arc`, so the clone is cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sde: Arc<SdeCatalog>,
    pub store: Arc<MarketOrderStore>,
    pub cache: Arc<CacheFabric>,
    pub esi: Arc<dyn UpstreamApi>,
    pub character: Arc<CharacterService>,
    pub navigation: Arc<Navigation>,
    pub engine: Arc<RouteEngine>,
    pub inventory: Arc<InventorySellOrchestrator>,
    pub refresher: Arc<MarketRefresher>,
    pub bucket: Arc<TokenBucket>,
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/trading/routes/calculate", post(handlers::calculate_routes))
        .route("/trading/inventory-sell", post(handlers::inventory_sell))
        .route("/character/location", get(handlers::character_location))
        .route("/character/ship", get(handlers::character_ship))
        .route("/character/ships", get(handlers::character_ships))
        .route("/characters/:id/skills", get(handlers::character_skills))
        .route(
            "/characters/:id/fitting/:ship_type",
            get(handlers::character_fitting),
        )
        .route("/esi/ui/autopilot/waypoint", post(handlers::set_waypoint))
        .layer(axum_mw::from_fn(auth::require_principal));

    let public = Router::new()
        .route("/health", get(handlers::health))
        .route("/market/:region/:type", get(handlers::market_orders))
        .route("/market/staleness/:region", get(handlers::market_staleness))
        .route("/items/search", get(handlers::search_items))
        .route("/regions", get(handlers::regions));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(axum_mw::from_fn(crate::middleware::request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Domain errors carried across the transport boundary. The mapping to
/// status codes lives here and nowhere else.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::UpstreamTransport(_) | Error::UpstreamClient(_) => StatusCode::BAD_GATEWAY,
            Error::Business(b) => business_status(b),
            Error::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            Error::Validation(_) => "validation",
            Error::Unauthorized => "unauthorized",
            Error::Forbidden => "forbidden",
            Error::NotFound(_) => "not-found",
            Error::RateLimited { .. } => "rate-limited",
            Error::UpstreamUnavailable(_) => "upstream-unavailable",
            Error::UpstreamTransport(_) => "upstream-transport",
            Error::UpstreamClient(_) => "upstream-client",
            Error::Business(b) => b.code(),
            Error::DeadlineExceeded => "deadline-exceeded",
            Error::Internal(_) => "internal",
        }
    }
}

fn business_status(err: &BusinessError) -> StatusCode {
    StatusCode::from_u16(err.suggested_status()).unwrap_or(StatusCode::BAD_REQUEST)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal detail stays in the logs; callers get a stable shape.
        let message = match &self.0 {
            Error::Internal(detail) => {
                error!(%detail, "Internal error surfaced to transport");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": message,
        }));

        if let Error::RateLimited { retry_after_secs } = &self.0 {
            return (
                status,
                [("Retry-After", retry_after_secs.to_string())],
                body,
            )
                .into_response();
        }

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        let cases = [
            (Error::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (Error::Unauthorized, StatusCode::UNAUTHORIZED),
            (Error::Forbidden, StatusCode::FORBIDDEN),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                Error::RateLimited { retry_after_secs: 2 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                Error::UpstreamUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::Business(BusinessError::NotDocked),
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::Business(BusinessError::NoRoute),
                StatusCode::NOT_FOUND,
            ),
            (Error::DeadlineExceeded, StatusCode::GATEWAY_TIMEOUT),
            (
                Error::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }

    #[test]
    fn business_codes_survive_the_mapping() {
        let err = ApiError(Error::Business(BusinessError::NotDocked));
        assert_eq!(err.code(), "not-docked");
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let response =
            ApiError(Error::RateLimited { retry_after_secs: 3 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get("Retry-After")
                .unwrap()
                .to_str()
                .unwrap(),
            "3"
        );
    }
}
