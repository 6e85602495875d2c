use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::{
    error::{bad, AppErr, AppResult},
    hub::Hub,
    state::UploadedFile,
};

pub fn router() -> Router {
    Router::new()
        .route("/download/:file_id", get(download_file))
        .route("/api/uploaded-files", get(list_files))
}

/// Stored type, or a guess from the file name when the uploader sent none.
fn content_type(file: &UploadedFile) -> String {
    if file.mime.is_empty() || file.mime == "application/octet-stream" {
        mime_guess::from_path(&file.name).first_or_octet_stream().to_string()
    } else {
        file.mime.clone()
    }
}

fn attachment(name: &str) -> String {
    let safe: String = name.chars().filter(|c| !matches!(c, '"' | '\\' | '\r' | '\n')).collect();
    format!("attachment; filename=\"{safe}\"")
}

pub async fn download_file(
    Extension(hub): Extension<Arc<Hub>>,
    Path(file_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let file = hub.file(&file_id).await.ok_or(AppErr::NotFound("File"))?;
    let body: Bytes = BASE64.decode(&file.data).map_err(bad)?.into();
    info!(file = %file.id, name = %file.name, bytes = body.len(), "file download");
    Ok((
        [
            (header::CONTENT_TYPE, content_type(&file)),
            (header::CONTENT_DISPOSITION, attachment(&file.name)),
        ],
        body,
    ))
}

/// Every upload keyed by id, for session export.
pub async fn list_files(Extension(hub): Extension<Arc<Hub>>) -> AppResult<Json<Value>> {
    let mut files = Map::new();
    for f in hub.files().await {
        files.insert(f.id.clone(), serde_json::to_value(&f).map_err(bad)?);
    }
    Ok(Json(json!({ "files": files })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn file(name: &str, mime: &str) -> UploadedFile {
        UploadedFile {
            id: "f1".into(),
            name: name.into(),
            mime: mime.into(),
            data: "aGVsbG8=".into(),
            uploaded_by: "u1".into(),
            uploaded_at: Utc::now(),
            room_id: "R1".into(),
        }
    }

    #[test]
    fn missing_type_is_guessed_from_name() {
        assert_eq!(content_type(&file("notes.pdf", "")), "application/pdf");
        assert_eq!(content_type(&file("pic.png", "image/webp")), "image/webp");
        assert_eq!(content_type(&file("blob", "application/octet-stream")), "application/octet-stream");
    }

    #[test]
    fn disposition_strips_quotes() {
        assert_eq!(attachment("a\"b.txt"), "attachment; filename=\"ab.txt\"");
    }
}
