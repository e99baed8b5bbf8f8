//! HTTP handlers over [`DeletedMessageVault`]: archive, search, fetch and
//! forget deleted messages of one owner.

use super::AppState;
use crate::{
    errors::AppError,
    models::{Criterion, DeletedMessage, DeletedMessageWithStorage, Query},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query as QueryParams, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use serde::Deserialize;
use std::io;

/// `metadata` part of an archive request. The owner comes from the path and
/// the size from the `content` part.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRequest {
    pub message_id: String,
    pub origin_mailbox: String,
    pub sender: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    #[serde(default)]
    pub has_attachment: bool,
    pub internal_date: DateTime<Utc>,
    pub delivery_date: DateTime<Utc>,
    /// Defaults to the time the request is handled.
    pub deletion_date: Option<DateTime<Utc>>,
}

impl ArchiveRequest {
    fn into_message(self, owner: String, size: u64) -> DeletedMessage {
        DeletedMessage {
            owner,
            message_id: self.message_id,
            origin_mailbox: self.origin_mailbox,
            sender: self.sender,
            recipients: self.recipients,
            subject: self.subject,
            size,
            has_attachment: self.has_attachment,
            internal_date: self.internal_date,
            deletion_date: self.deletion_date.unwrap_or_else(Utc::now),
            delivery_date: self.delivery_date,
        }
    }
}

/// Query params accepted by the search endpoint. Present filters are ANDed.
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub limit: Option<usize>,
}

impl From<SearchParams> for Query {
    fn from(params: SearchParams) -> Self {
        let mut query = Query::all();
        if let Some(subject) = params.subject {
            query = query.with_criterion(Criterion::SubjectContains(subject));
        }
        if let Some(sender) = params.sender {
            query = query.with_criterion(Criterion::SenderEquals(sender));
        }
        if let Some(recipient) = params.recipient {
            query = query.with_criterion(Criterion::HasRecipient(recipient));
        }
        if let Some(limit) = params.limit {
            query = query.with_limit(limit);
        }
        query
    }
}

/// `POST /vault/{owner}/messages`: multipart with a JSON `metadata` part and
/// the raw message as `content`.
pub async fn append_message(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<DeletedMessageWithStorage>), AppError> {
    let mut request: Option<ArchiveRequest> = None;
    let mut content: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "metadata" => {
                let raw = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_request(e.to_string()))?;
                let parsed = serde_json::from_slice(&raw)
                    .map_err(|e| AppError::bad_request(format!("invalid metadata: {}", e)))?;
                request = Some(parsed);
            }
            "content" => {
                content = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::bad_request(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let request = request.ok_or_else(|| AppError::bad_request("missing `metadata` part"))?;
    let content = content.ok_or_else(|| AppError::bad_request("missing `content` part"))?;
    let message = request.into_message(owner, content.len() as u64);

    let stored = state
        .vault
        .append(message, stream::iter([Ok::<_, io::Error>(content)]))
        .await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// `GET /vault/{owner}/messages?subject=&sender=&recipient=&limit=`
pub async fn search_messages(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    QueryParams(params): QueryParams<SearchParams>,
) -> Result<Json<Vec<DeletedMessage>>, AppError> {
    let query = Query::from(params);
    Ok(Json(state.vault.search(&owner, &query).await?))
}

/// `GET /vault/{owner}/messages/{message_id}`: raw MIME content.
pub async fn get_message_content(
    State(state): State<AppState>,
    Path((owner, message_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let content = state
        .vault
        .load_mime_message(&owner, &message_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no archived message `{}`", message_id)))?;

    let mut response = Response::new(Body::from(content));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("message/rfc822"),
    );
    Ok(response)
}

/// `DELETE /vault/{owner}/messages/{message_id}`: idempotent.
pub async fn delete_message(
    State(state): State<AppState>,
    Path((owner, message_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    state.vault.delete(&owner, &message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
