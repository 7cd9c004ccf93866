use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{delete, post};
use axum::{Json, Router};
use http::StatusCode;

use crate::auth::Auth;
use crate::dto::{
    RenegotiateRequest, RenegotiateResponse, UploadVideoRequest, UploadVideoResponse,
};
use crate::error::AppError;
use crate::model::{self, FileChannel, FileDescriptor};
use crate::result::Result;
use crate::route::AppState;

pub fn route() -> Router<AppState> {
    Router::new()
        .route("/api/p2p/video", post(upload))
        .route("/api/p2p/video/:id/sdp", post(renegotiate))
        .route("/api/p2p/video/:id", delete(close))
}

async fn upload(
    State(state): State<AppState>,
    Auth(session): Auth,
    Json(request): Json<UploadVideoRequest>,
) -> Result<impl IntoResponse> {
    if request.sdp_offer.trim().is_empty() {
        return Err(AppError::invalid_argument("sdp_offer is required"));
    }

    let file = FileDescriptor {
        name: request.name,
        uuid: request.uuid,
        domain_id: session.domain_id,
        uploaded_by: session.user_id,
        created_at: model::now_millis(),
        channel: FileChannel::from(request.channel),
        ..Default::default()
    };
    let ice_servers = request.ice_servers.into_iter().map(Into::into).collect();

    let (id, sdp_answer) = state
        .recorder
        .upload_p2p_video(request.sdp_offer, file, ice_servers)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(UploadVideoResponse { id, sdp_answer }),
    ))
}

async fn renegotiate(
    State(state): State<AppState>,
    Auth(_session): Auth,
    Path(id): Path<String>,
    Json(request): Json<RenegotiateRequest>,
) -> Result<Json<RenegotiateResponse>> {
    let sdp_answer = state
        .recorder
        .renegotiate_p2p(&id, request.sdp_offer)
        .await?;
    Ok(Json(RenegotiateResponse { sdp_answer }))
}

async fn close(
    State(state): State<AppState>,
    Auth(_session): Auth,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.recorder.close_p2p(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
