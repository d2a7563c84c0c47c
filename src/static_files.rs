use axum::{
    body::Body,
    http::{header, Response, StatusCode, Uri},
    response::IntoResponse,
};
use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/web/"]
struct WebAssets;

/// Serves the embedded single-page UI. `GET /` and `GET /<mac>` (any path
/// without a registered API route) resolve to `index.html`; `GET /static/*`
/// resolves to the matching embedded file.
pub async fn serve_static_asset(uri: Uri) -> impl IntoResponse {
    let path = uri.path().trim_start_matches('/');

    let lookup_path = if path.is_empty() || !path.starts_with("static/") {
        "index.html"
    } else {
        path
    };

    match WebAssets::get(lookup_path) {
        Some(file) => {
            let mime = mime_guess::from_path(lookup_path).first_or_octet_stream();
            Response::builder()
                .header(header::CONTENT_TYPE, mime.as_ref())
                .body(Body::from(file.data.into_owned()))
                .unwrap()
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
