use crate::{
    auth::jwt::{JwtAccessTokenService, Principal},
    error::{ApiError, ErrorCode},
};
use axum::{
    extract::{Query, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

/// Validates the bearer token and stores the [`Principal`] as a request extension.
///
/// Browsers cannot set headers on a websocket handshake, so the token may
/// also arrive as an `access_token` query parameter.
pub async fn require_bearer_auth(
    State(jwt_service): State<Arc<JwtAccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let header_token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(ToOwned::to_owned);
    let token = match header_token.or_else(|| query_token(&request)) {
        Some(token) => token,
        None => return unauthorized_response("missing bearer token"),
    };

    let principal = match jwt_service.validate_token(&token) {
        Ok(principal) => principal,
        Err(_) => return unauthorized_response("invalid bearer token"),
    };

    request.extensions_mut().insert(principal);

    next.run(request).await
}

/// Rejects callers whose token lacks the `admin` claim. Runs after [`require_bearer_auth`].
pub async fn require_admin(request: Request, next: Next) -> Response {
    match request.extensions().get::<Principal>() {
        Some(principal) if principal.admin => next.run(request).await,
        Some(_) => ApiError::from_code(ErrorCode::AuthForbidden).into_response(),
        None => unauthorized_response("missing bearer token"),
    }
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn query_token(request: &Request) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(query)| query.access_token)
        .filter(|token| !token.trim().is_empty())
}

fn unauthorized_response(message: &'static str) -> Response {
    ApiError::new(ErrorCode::AuthInvalidToken, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::{require_admin, require_bearer_auth};
    use crate::auth::jwt::{JwtAccessTokenService, Principal};
    use axum::{
        body::Body,
        extract::Extension,
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    const TEST_SECRET: &str = "wsbroker_test_secret_that_is_definitely_long_enough";

    fn service() -> Arc<JwtAccessTokenService> {
        Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize"))
    }

    fn protected_app(jwt_service: Arc<JwtAccessTokenService>) -> Router {
        Router::new()
            .route(
                "/protected",
                get(|Extension(principal): Extension<Principal>| async move {
                    principal.user_id.to_string()
                }),
            )
            .route_layer(middleware::from_fn(require_admin))
            .layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
    }

    fn user_app(jwt_service: Arc<JwtAccessTokenService>) -> Router {
        Router::new()
            .route(
                "/me",
                get(|Extension(principal): Extension<Principal>| async move {
                    principal.user_id.to_string()
                }),
            )
            .layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
    }

    async fn status(app: Router, request: Request<Body>) -> StatusCode {
        app.oneshot(request).await.expect("request should return a response").status()
    }

    #[tokio::test]
    async fn rejects_requests_without_bearer_token() {
        let request = Request::builder().uri("/me").body(Body::empty()).expect("request should build");
        assert_eq!(status(user_app(service()), request).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_requests_with_invalid_bearer_token() {
        let request = Request::builder()
            .uri("/me")
            .header(AUTHORIZATION, "Bearer invalid-token")
            .body(Body::empty())
            .expect("request should build");
        assert_eq!(status(user_app(service()), request).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepts_token_from_query_parameter() {
        let service = service();
        let token =
            service.issue_token(Principal { user_id: 77, admin: false }).expect("token should be issued");

        let response = user_app(service)
            .oneshot(
                Request::builder()
                    .uri(format!("/me?access_token={token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn non_admin_is_forbidden_on_admin_routes() {
        let service = service();
        let token =
            service.issue_token(Principal { user_id: 5, admin: false }).expect("token should be issued");
        let request = Request::builder()
            .uri("/protected")
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request should build");

        assert_eq!(status(protected_app(service), request).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_passes_admin_routes() {
        let service = service();
        let token =
            service.issue_token(Principal { user_id: 5, admin: true }).expect("token should be issued");
        let request = Request::builder()
            .uri("/protected")
            .header(AUTHORIZATION, format!("bearer {token}"))
            .body(Body::empty())
            .expect("request should build");

        assert_eq!(status(protected_app(service), request).await, StatusCode::OK);
    }
}
