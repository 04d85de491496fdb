//! axum adapters for the output cache.
//!
//! [`output_cache_layer`] wraps a read route: it serves hits and 304s and
//! captures successful GET responses. [`invalidate_layer`] wraps a mutating
//! route and runs the post-mutation sweep once the handler has succeeded.
//!
//! Both read path parameters, so install them with `route_layer` or on the
//! `MethodRouter` itself.

use axum::{
    body::{Body, Bytes},
    extract::{RawPathParams, Request, State, rejection::RawPathParamsRejection},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header, response::Parts},
    middleware::Next,
    response::Response,
};
use http_body_util::BodyExt;
use tracing::{instrument, warn};

use super::engine::{CachePolicy, CachedResponse, Lookup, OutputCache, Outcome, RequestContext};
use super::fingerprint;
use super::freshness::Freshness;
use super::keys::{ArgumentMap, ResourceIdentity};

/// State for [`output_cache_layer`]: which read operation a route serves and
/// how to cache it.
#[derive(Clone)]
pub struct CacheRoute {
    pub cache: OutputCache,
    pub identity: ResourceIdentity,
    pub policy: CachePolicy,
}

impl CacheRoute {
    pub fn new(cache: OutputCache, identity: ResourceIdentity, policy: CachePolicy) -> Self {
        Self {
            cache,
            identity,
            policy,
        }
    }
}

/// State for [`invalidate_layer`].
#[derive(Clone)]
pub struct MutationRoute {
    pub cache: OutputCache,
    pub identity: ResourceIdentity,
}

impl MutationRoute {
    pub fn new(cache: OutputCache, identity: ResourceIdentity) -> Self {
        Self { cache, identity }
    }
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn output_cache_layer(
    State(route): State<CacheRoute>,
    params: Result<RawPathParams, RawPathParamsRejection>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let context = request_context(&route.identity, params.ok().as_ref(), &request);
    match route.cache.before_handle(&context, &route.policy) {
        Ok(Lookup::Hit(cached)) => return hit_response(cached),
        Ok(Lookup::NotModified { etag, freshness }) => return not_modified(&etag, &freshness),
        Ok(Lookup::Miss) => {}
        Err(err) => {
            warn!(cache = "output", error = %err, "cache lookup skipped");
            return next.run(request).await;
        }
    }

    let response = next.run(request).await;
    if !should_store_response(&response) {
        return response;
    }

    let (mut parts, bytes) = match buffer_response(response).await {
        Ok(buffered) => buffered,
        Err(rebuilt) => return rebuilt,
    };

    let outcome = Outcome {
        succeeded: true,
        payload: Some(bytes.clone()),
        content_type: parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    };
    match route.cache.after_handle(&context, &route.policy, &outcome) {
        Ok(Some(directives)) => {
            apply_directives(&mut parts.headers, &directives.etag, &directives.freshness)
        }
        Ok(None) => {}
        Err(err) => warn!(cache = "output", error = %err, "response not cached"),
    }

    Response::from_parts(parts, Body::from(bytes))
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn invalidate_layer(
    State(route): State<MutationRoute>,
    params: Result<RawPathParams, RawPathParamsRejection>,
    request: Request,
    next: Next,
) -> Response {
    let mutating = matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if !mutating {
        return next.run(request).await;
    }

    let mut arguments = path_arguments(params.ok().as_ref());
    for (name, value) in query_pairs(&request) {
        if arguments.get(&name).is_none() {
            arguments.insert(name, value);
        }
    }

    let response = next.run(request).await;
    route
        .cache
        .after_mutation(&route.identity, &arguments, response.status().is_success());
    response
}

fn request_context(
    identity: &ResourceIdentity,
    params: Option<&RawPathParams>,
    request: &Request,
) -> RequestContext {
    let headers = request.headers();
    let mut context = RequestContext::new(identity.clone())
        .with_arguments(path_arguments(params))
        .with_query(query_pairs(request))
        .with_authenticated(headers.contains_key(header::AUTHORIZATION))
        .with_if_none_match(if_none_match(headers))
        .with_cacheable(!requests_no_store(headers));
    if let Some(representation) = negotiate(headers) {
        context = context.with_representation(representation);
    }
    context
}

fn path_arguments(params: Option<&RawPathParams>) -> ArgumentMap {
    params
        .map(|params| params.iter().collect())
        .unwrap_or_default()
}

fn query_pairs(request: &Request) -> Vec<(String, String)> {
    axum::extract::Query::<Vec<(String, String)>>::try_from_uri(request.uri())
        .map(|query| query.0)
        .unwrap_or_default()
}

/// First concrete media type in `Accept`, parameters stripped.
fn negotiate(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::ACCEPT)?
        .to_str()
        .ok()?
        .split(',')
        .filter_map(|entry| entry.split(';').next())
        .map(str::trim)
        .find(|media| !media.is_empty() && !media.ends_with("/*") && *media != "*/*")
        .map(str::to_ascii_lowercase)
}

fn requests_no_store(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|directive| directive.trim().eq_ignore_ascii_case("no-store"))
}

fn if_none_match(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

fn should_store_response(response: &Response) -> bool {
    if !response.status().is_success() {
        return false;
    }
    if response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }
    !response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

/// Collect the body for capture. On failure the original status and headers
/// come back with an empty body and nothing is cached.
async fn buffer_response(response: Response) -> Result<(Parts, Bytes), Response> {
    let (parts, body) = response.into_parts();
    match BodyExt::collect(body).await {
        Ok(collected) => Ok((parts, collected.to_bytes())),
        Err(err) => {
            warn!(cache = "output", error = %err, "failed to buffer response body");
            Err(Response::from_parts(parts, Body::empty()))
        }
    }
}

fn apply_directives(headers: &mut HeaderMap, etag: &str, freshness: &Freshness) {
    if let Ok(value) = HeaderValue::from_str(&fingerprint::quoted(etag)) {
        headers.insert(header::ETAG, value);
    }
    if let Some(value) = freshness
        .directive
        .cache_control()
        .and_then(|directive| HeaderValue::from_str(&directive).ok())
    {
        headers.insert(header::CACHE_CONTROL, value);
    }
    if let Some(pragma) = freshness.directive.pragma() {
        headers.insert(header::PRAGMA, HeaderValue::from_static(pragma));
    }
}

fn hit_response(cached: CachedResponse) -> Response {
    let mut response = Response::new(Body::from(cached.payload));
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&cached.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    apply_directives(headers, &cached.etag, &cached.freshness);
    response
}

fn not_modified(etag: &str, freshness: &Freshness) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_MODIFIED;
    apply_directives(response.headers_mut(), etag, freshness);
    response
}
