use std::io;

use axum::{
    body::Body,
    extract::{
        Path,
        Query,
        State,
    },
    response::{
        IntoResponse,
        Response,
    },
    routing::{
        delete,
        get,
        post,
        put,
    },
    Json,
    Router,
};
use common::{
    runtime::UnixTimestamp,
    stream::FileStream,
    types::{
        FileId,
        SessionId,
        UserId,
    },
};
use errors::{
    report_error,
    ErrorMetadataAnyhowExt,
};
use file_storage::{
    CompletedPartInput,
    FileListing,
    MultipartInitRequest,
    MultipartInitiated,
    UploadRequest,
};
use futures::{
    StreamExt,
    TryStreamExt,
};
use http::{
    header,
    HeaderMap,
    StatusCode,
};
use model::types::{
    FileNode,
    ListFilter,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    auth::bearer_token,
    LocalAppState,
};

/// Converts `anyhow::Error` chains carrying `ErrorMetadata` into HTTP
/// responses: the stable short message becomes a machine-readable code, the
/// human-readable reason becomes the message, everything else stays in the
/// server logs.
pub struct HttpResponseError(anyhow::Error);

impl From<anyhow::Error> for HttpResponseError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpResponseError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        if status.is_server_error() {
            report_error(&self.0);
        }
        let body = serde_json::json!({
            "code": self.0.short_msg().unwrap_or("InternalServerError"),
            "message": self.0.user_facing_message(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, HttpResponseError>;

pub fn router(state: LocalAppState) -> Router {
    Router::new()
        .route("/files", get(list_folder).put(upload))
        .route("/files/all", get(list_all))
        .route("/files/recent", get(list_recent))
        .route("/files/favorites", get(list_favorites))
        .route("/files/shared", get(list_shared))
        .route("/files/trash", get(list_trash))
        .route("/files/create-directory", post(create_directory))
        .route("/files/move-file", post(move_file))
        .route(
            "/files/{id}",
            get(show).put(update_content).patch(rename).delete(soft_delete),
        )
        .route("/files/{id}/favorite", post(favorite))
        .route("/files/{id}/download", get(download))
        .route("/files/{id}/restore", post(restore))
        .route("/files/{id}/permanent-delete", delete(hard_delete))
        .route("/files/multipart/initiate", post(multipart_initiate))
        .route(
            "/files/multipart/{session_id}/part/{part_number}",
            put(multipart_part),
        )
        .route(
            "/files/multipart/{session_id}/complete",
            post(multipart_complete),
        )
        .route("/files/multipart/{session_id}/abort", delete(multipart_abort))
        .with_state(state)
}

impl LocalAppState {
    async fn owner(&self, headers: &HeaderMap) -> anyhow::Result<UserId> {
        let token = bearer_token(headers)?;
        self.authenticator.authenticate(token).await
    }
}

fn body_stream(body: Body) -> FileStream {
    body.into_data_stream().map_err(io::Error::other).boxed()
}

fn content_length(headers: &HeaderMap) -> anyhow::Result<u64> {
    let value = headers
        .get(header::CONTENT_LENGTH)
        .ok_or_else(|| {
            errors::ErrorMetadata::bad_request(
                "MissingContentLength",
                "uploads must declare a Content-Length",
            )
        })?
        .to_str()
        .ok()
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| {
            errors::ErrorMetadata::bad_request("InvalidContentLength", "bad Content-Length header")
        })?;
    Ok(value)
}

#[derive(Deserialize)]
struct FolderQuery {
    #[serde(rename = "parentID")]
    parent_id: Option<FileId>,
}

#[derive(Deserialize)]
struct UploadQuery {
    filename: String,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    #[serde(rename = "parentID")]
    parent_id: Option<FileId>,
    #[serde(rename = "lastModified")]
    last_modified: Option<u64>,
}

#[derive(Deserialize)]
struct UpdateQuery {
    size: u64,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    #[serde(rename = "lastModified")]
    last_modified: Option<u64>,
}

#[derive(Deserialize)]
struct CreateDirectoryBody {
    name: String,
    #[serde(rename = "parentID")]
    parent_id: Option<FileId>,
}

#[derive(Deserialize)]
struct RenameBody {
    name: String,
}

#[derive(Deserialize)]
struct MoveBody {
    #[serde(rename = "fileID")]
    file_id: FileId,
    #[serde(rename = "parentID")]
    parent_id: Option<FileId>,
}

#[derive(Deserialize)]
struct FavoriteBody {
    #[serde(rename = "isFavorite")]
    is_favorite: Option<bool>,
}

#[derive(Deserialize)]
struct MultipartInitiateBody {
    filename: String,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    #[serde(rename = "totalSize")]
    total_size: u64,
    #[serde(rename = "parentID")]
    parent_id: Option<FileId>,
    #[serde(rename = "lastModified")]
    last_modified: Option<u64>,
}

#[derive(Deserialize)]
struct CompleteBody {
    parts: Vec<CompletedPartInput>,
}

#[derive(Serialize)]
struct PartResponse {
    #[serde(rename = "partNumber")]
    part_number: u16,
    etag: String,
    size: u64,
}

const OCTET_STREAM: &str = "application/octet-stream";

async fn list_folder(
    State(st): State<LocalAppState>,
    Query(query): Query<FolderQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<FileListing>> {
    let owner = st.owner(&headers).await?;
    let listing = st
        .file_storage
        .list(owner, ListFilter::Folder(query.parent_id))
        .await?;
    Ok(Json(listing))
}

async fn list_view(
    st: &LocalAppState,
    headers: &HeaderMap,
    filter: ListFilter,
) -> ApiResult<Json<FileListing>> {
    let owner = st.owner(headers).await?;
    Ok(Json(st.file_storage.list(owner, filter).await?))
}

async fn list_all(
    State(st): State<LocalAppState>,
    headers: HeaderMap,
) -> ApiResult<Json<FileListing>> {
    list_view(&st, &headers, ListFilter::All).await
}

async fn list_recent(
    State(st): State<LocalAppState>,
    headers: HeaderMap,
) -> ApiResult<Json<FileListing>> {
    list_view(&st, &headers, ListFilter::Recent).await
}

async fn list_favorites(
    State(st): State<LocalAppState>,
    headers: HeaderMap,
) -> ApiResult<Json<FileListing>> {
    list_view(&st, &headers, ListFilter::Favorites).await
}

async fn list_shared(
    State(st): State<LocalAppState>,
    headers: HeaderMap,
) -> ApiResult<Json<FileListing>> {
    list_view(&st, &headers, ListFilter::Shared).await
}

async fn list_trash(
    State(st): State<LocalAppState>,
    headers: HeaderMap,
) -> ApiResult<Json<FileListing>> {
    list_view(&st, &headers, ListFilter::Trash).await
}

async fn show(
    State(st): State<LocalAppState>,
    Path(file_id): Path<FileId>,
    headers: HeaderMap,
) -> ApiResult<Json<FileNode>> {
    let owner = st.owner(&headers).await?;
    Ok(Json(st.file_storage.get_node(owner, file_id).await?))
}

async fn upload(
    State(st): State<LocalAppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Json<FileNode>> {
    let owner = st.owner(&headers).await?;
    let claimed_size = content_length(&headers)?;
    let request = UploadRequest {
        filename: query.filename,
        parent_id: query.parent_id,
        content_type: query.content_type.unwrap_or_else(|| OCTET_STREAM.to_string()),
        claimed_size,
        last_modified: query.last_modified.map(UnixTimestamp::from_millis),
    };
    let node = st
        .file_storage
        .upload(owner, request, body_stream(body))
        .await?;
    Ok(Json(node))
}

async fn update_content(
    State(st): State<LocalAppState>,
    Path(file_id): Path<FileId>,
    Query(query): Query<UpdateQuery>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Json<FileNode>> {
    let owner = st.owner(&headers).await?;
    let node = st
        .file_storage
        .update_content(
            owner,
            file_id,
            query.size,
            query.content_type.unwrap_or_else(|| OCTET_STREAM.to_string()),
            query.last_modified.map(UnixTimestamp::from_millis),
            body_stream(body),
        )
        .await?;
    Ok(Json(node))
}

async fn create_directory(
    State(st): State<LocalAppState>,
    headers: HeaderMap,
    Json(body): Json<CreateDirectoryBody>,
) -> ApiResult<Json<FileNode>> {
    let owner = st.owner(&headers).await?;
    let node = st
        .file_storage
        .create_directory(owner, body.name, body.parent_id)
        .await?;
    Ok(Json(node))
}

async fn rename(
    State(st): State<LocalAppState>,
    Path(file_id): Path<FileId>,
    headers: HeaderMap,
    Json(body): Json<RenameBody>,
) -> ApiResult<Json<FileNode>> {
    let owner = st.owner(&headers).await?;
    Ok(Json(st.file_storage.rename(owner, file_id, body.name).await?))
}

async fn move_file(
    State(st): State<LocalAppState>,
    headers: HeaderMap,
    Json(body): Json<MoveBody>,
) -> ApiResult<Json<FileNode>> {
    let owner = st.owner(&headers).await?;
    Ok(Json(
        st.file_storage
            .move_node(owner, body.file_id, body.parent_id)
            .await?,
    ))
}

async fn favorite(
    State(st): State<LocalAppState>,
    Path(file_id): Path<FileId>,
    headers: HeaderMap,
    Json(body): Json<FavoriteBody>,
) -> ApiResult<Json<FileNode>> {
    let owner = st.owner(&headers).await?;
    Ok(Json(
        st.file_storage
            .set_favorite(owner, file_id, body.is_favorite)
            .await?,
    ))
}

async fn download(
    State(st): State<LocalAppState>,
    Path(file_id): Path<FileId>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let owner = st.owner(&headers).await?;
    let download = st.file_storage.download(owner, file_id, None).await?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        download.node.filename.replace('"', "")
    );
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &download.node.content_type)
        .header(header::CONTENT_LENGTH, download.content_length.0)
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from_stream(download.stream.stream))
        .map_err(anyhow::Error::from)?;
    Ok(response)
}

async fn soft_delete(
    State(st): State<LocalAppState>,
    Path(file_id): Path<FileId>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let owner = st.owner(&headers).await?;
    st.file_storage.soft_delete(owner, file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restore(
    State(st): State<LocalAppState>,
    Path(file_id): Path<FileId>,
    headers: HeaderMap,
) -> ApiResult<Json<FileNode>> {
    let owner = st.owner(&headers).await?;
    Ok(Json(st.file_storage.restore(owner, file_id).await?))
}

async fn hard_delete(
    State(st): State<LocalAppState>,
    Path(file_id): Path<FileId>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let owner = st.owner(&headers).await?;
    st.file_storage.hard_delete(owner, file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn multipart_initiate(
    State(st): State<LocalAppState>,
    headers: HeaderMap,
    Json(body): Json<MultipartInitiateBody>,
) -> ApiResult<Json<MultipartInitiated>> {
    let owner = st.owner(&headers).await?;
    let request = MultipartInitRequest {
        filename: body.filename,
        content_type: body.content_type.unwrap_or_else(|| OCTET_STREAM.to_string()),
        total_size: body.total_size,
        parent_id: body.parent_id,
        last_modified: body.last_modified.map(UnixTimestamp::from_millis),
    };
    Ok(Json(st.file_storage.initiate_multipart(owner, request).await?))
}

/// The hot path: authorization is the signed upload token, not a session.
async fn multipart_part(
    State(st): State<LocalAppState>,
    Path((session_id, part_number)): Path<(SessionId, u16)>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Json<PartResponse>> {
    let token = bearer_token(&headers)?;
    let declared = content_length(&headers)?;
    let part = st
        .file_storage
        .upload_part(token, session_id, part_number, declared, body_stream(body))
        .await?;
    Ok(Json(PartResponse {
        part_number: part.part_number.as_u16(),
        etag: part.etag,
        size: part.size,
    }))
}

async fn multipart_complete(
    State(st): State<LocalAppState>,
    Path(session_id): Path<SessionId>,
    headers: HeaderMap,
    Json(body): Json<CompleteBody>,
) -> ApiResult<Json<FileNode>> {
    let token = bearer_token(&headers)?;
    Ok(Json(
        st.file_storage
            .complete_multipart(token, session_id, body.parts)
            .await?,
    ))
}

async fn multipart_abort(
    State(st): State<LocalAppState>,
    Path(session_id): Path<SessionId>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let token = bearer_token(&headers)?;
    st.file_storage.abort_multipart(token, session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
