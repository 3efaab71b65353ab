//! HTTP routes of the webserver.

use crate::{
    error::Error,
    mime::OCTET_STREAM,
    rpc::StoreError,
    units::{parse_duration, pretty_duration},
    webserver::adapter::{Adapter, MAX_MIME_LENGTH},
    Config,
};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use privpaste_log::{debug, warn};
use serde_derive::Deserialize;
use std::{sync::Arc, time::SystemTime};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Content type that curl sends for `--data-binary` unless told otherwise.
const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone)]
pub struct AppState {
    adapter: Arc<Adapter>,
    prefix: Arc<str>,
    index: Arc<str>,
}

impl AppState {
    pub fn new(adapter: Arc<Adapter>, config: &Config) -> Self {
        let index = index_page(config);
        Self {
            adapter,
            prefix: config.url_prefix.as_str().into(),
            index: index.into(),
        }
    }
}

/// Build the router, nested below the URL prefix if there is one.
pub fn router(state: AppState) -> Router {
    let prefix = state.prefix.clone();
    let routes = Router::new()
        .route("/", get(index).post(upload))
        .route("/{id}", get(download).delete(delete))
        .layer(DefaultBodyLimit::disable())
        .with_state(state);

    if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(&prefix, routes)
    }
}

fn index_page(config: &Config) -> String {
    let prefix = if config.url_prefix.is_empty() {
        "/"
    } else {
        config.url_prefix.as_str()
    };
    format!(
        "privpasted - ephemeral file sharing\n\
         \n\
         Upload:   curl --data-binary @FILE 'http://HOST{prefix}?lifetime=1h&filename=FILE'\n\
         Download: curl 'http://HOST{prefix}{sep}ID'\n\
         Delete:   curl -X DELETE 'http://HOST{prefix}{sep}ID?secret=SECRET'\n\
         \n\
         Maximum size:     {size} bytes\n\
         Maximum lifetime: {lifetime}\n\
         \n\
         Report abuse to {contact}\n",
        prefix = prefix,
        sep = if prefix.ends_with('/') { "" } else { "/" },
        size = config.max_size,
        lifetime = pretty_duration(config.max_lifetime),
        contact = config.contact,
    )
}

async fn index(State(state): State<AppState>) -> Response {
    ([(header::CONTENT_TYPE, TEXT_PLAIN)], state.index.to_string()).into_response()
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    lifetime: Option<String>,
    filename: Option<String>,
}

async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let size = match headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
    {
        Some(size) => size,
        None => return failure(StatusCode::LENGTH_REQUIRED, "Content-Length is required"),
    };

    let limits = state.adapter.limits();
    let lifetime = match query.lifetime.as_deref() {
        None | Some("") => limits.max_lifetime,
        Some(value) => match parse_duration(value) {
            Ok(lifetime) => lifetime,
            Err(err) => return failure(StatusCode::BAD_REQUEST, &err),
        },
    };

    let mime = declared_mime(&headers, query.filename.as_deref());
    let created = match state
        .adapter
        .upload(size, &mime, lifetime, body.into_data_stream())
        .await
    {
        Ok(created) => created,
        Err(err) => return error_response(&err),
    };

    let url = format!("{}/{}", base_url(&headers, &state.prefix), created.id);
    let expires = created
        .expires_at
        .duration_since(SystemTime::now())
        .unwrap_or_default();
    let text = format!(
        "{url}\n\
         \n\
         Expires in {expires}.\n\
         Delete: curl -X DELETE '{url}?secret={secret}'\n",
        url = url,
        expires = pretty_duration(expires),
        secret = created.owner,
    );
    debug!("item uploaded"; "id" => &created.id, "size" => size, "mime" => &mime);

    (
        StatusCode::CREATED,
        [
            (header::LOCATION, url),
            (header::CONTENT_TYPE, TEXT_PLAIN.to_string()),
        ],
        text,
    )
        .into_response()
}

async fn download(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let (info, content) = match state.adapter.download(&id).await {
        Ok(item) => item,
        Err(err) => return error_response(&err),
    };

    Response::builder()
        .header(header::CONTENT_TYPE, info.mime)
        .header(header::CONTENT_LENGTH, info.size)
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .body(Body::from_stream(content))
        .unwrap_or_else(|err| {
            warn!("invalid response"; "id" => &id, "error" => %err);
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Invalid item")
        })
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    secret: Option<String>,
}

async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Response {
    let secret = match query.secret {
        Some(secret) => secret,
        None => return failure(StatusCode::BAD_REQUEST, "secret is required"),
    };

    match state.adapter.delete(&id, &secret).await {
        Ok(()) => ([(header::CONTENT_TYPE, TEXT_PLAIN)], "Deleted\n").into_response(),
        Err(err) => error_response(&err),
    }
}

/// The MIME type of an upload.
///
/// An explicit Content-Type wins, then a guess from the file name.
fn declared_mime(headers: &HeaderMap, filename: Option<&str>) -> String {
    let declared = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| {
            !value.is_empty() && value.len() <= MAX_MIME_LENGTH && !value.starts_with(FORM_URLENCODED)
        });
    if let Some(mime) = declared {
        return mime.to_string();
    }

    filename
        .and_then(|name| mime_guess::from_path(name).first_raw())
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

/// The public URL below which the items are served.
fn base_url(headers: &HeaderMap, prefix: &str) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .filter(|value| *value == "https")
        .unwrap_or("http");
    format!("{}://{}{}", scheme, host, prefix)
}

fn status_code(err: &Error) -> StatusCode {
    match err {
        Error::Store(StoreError::SizeExceeded) => StatusCode::PAYLOAD_TOO_LARGE,
        Error::Store(StoreError::InvalidLifetime) => StatusCode::BAD_REQUEST,
        Error::Store(StoreError::QuotaExceeded) => StatusCode::INSUFFICIENT_STORAGE,
        Error::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
        Error::Store(StoreError::Forbidden) => StatusCode::FORBIDDEN,
        Error::Store(StoreError::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(err: &Error) -> Response {
    let status = status_code(err);
    if status.is_server_error() {
        warn!("request failed"; "error" => %err);
    }
    failure(status, &err.to_string())
}

fn failure(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, TEXT_PLAIN)],
        format!("{}\n", message),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use clap::Parser;

    #[test]
    fn test_status_codes() {
        let cases = [
            (StoreError::SizeExceeded.into(), StatusCode::PAYLOAD_TOO_LARGE),
            (StoreError::InvalidLifetime.into(), StatusCode::BAD_REQUEST),
            (StoreError::QuotaExceeded.into(), StatusCode::INSUFFICIENT_STORAGE),
            (StoreError::NotFound.into(), StatusCode::NOT_FOUND),
            (StoreError::Forbidden.into(), StatusCode::FORBIDDEN),
            (Error::Timeout, StatusCode::SERVICE_UNAVAILABLE),
            (Error::Protocol("bad"), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Config("long".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(status_code(&err), status, "{}", err);
        }
    }

    #[test]
    fn test_declared_mime() {
        let mut headers = HeaderMap::new();
        assert_eq!(declared_mime(&headers, None), OCTET_STREAM);
        assert_eq!(declared_mime(&headers, Some("photo.png")), "image/png");

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(FORM_URLENCODED));
        assert_eq!(declared_mime(&headers, Some("notes.txt")), "text/plain");

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        assert_eq!(
            declared_mime(&headers, Some("photo.png")),
            "text/html; charset=utf-8"
        );

        let long = format!("text/{}", "x".repeat(MAX_MIME_LENGTH));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(&long).unwrap());
        assert_eq!(declared_mime(&headers, None), OCTET_STREAM);
    }

    #[test]
    fn test_base_url() {
        let mut headers = HeaderMap::new();
        assert_eq!(base_url(&headers, ""), "http://localhost");

        headers.insert(header::HOST, HeaderValue::from_static("paste.example.org"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(
            base_url(&headers, "/paste"),
            "https://paste.example.org/paste"
        );
    }

    #[test]
    fn test_index_page() {
        let config = Config::try_parse_from([
            "privpasted",
            "--store",
            "/tmp",
            "--contact",
            "abuse@example.org",
            "--url-prefix",
            "/paste",
        ])
        .unwrap();
        let page = index_page(&config);
        assert!(page.contains("abuse@example.org"));
        assert!(page.contains("1 day"));
        assert!(page.contains("http://HOST/paste/ID"));
        assert!(page.contains("10485760 bytes"));
    }
}
