use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

use crate::repo::RepoError;
use crate::schema::DecodeError;
use crate::storage::BlobError;
use crate::store::StoreError;

/// Errors surfaced by the feed, engagement and authoring services.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("conflict")]
    Conflict,
    #[error("post {post_id} deleted with {} dependent record(s) left behind", failures.len())]
    PartialDeletion { post_id: String, failures: Vec<String> },
    #[error("validation: {0}")]
    Validation(String),
    #[error("malformed document: {0}")]
    Decode(DecodeError),
    #[error("store: {0}")]
    Store(StoreError),
    #[error("blob store: {0}")]
    Blob(#[from] BlobError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl From<RepoError> for ServiceError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ServiceError::NotFound,
            RepoError::Conflict => ServiceError::Conflict,
            RepoError::Decode(d) => ServiceError::Decode(d),
            RepoError::Store(s) => ServiceError::Store(s),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        RepoError::from(e).into()
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("forbidden")] Forbidden,
    #[error("bad request: {0}")] BadRequest(String),
    #[error("too many requests")] TooManyRequests,
    #[error("payload too large")] PayloadTooLarge,
    #[error("unsupported media type")] UnsupportedMediaType,
    #[error("partial deletion")] PartialDeletion(Vec<String>),
    #[error("internal error")] Internal,
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::NotFound => ApiError::NotFound,
            ServiceError::Conflict => ApiError::Conflict,
            ServiceError::Unauthorized => ApiError::Forbidden,
            ServiceError::Validation(msg) => ApiError::BadRequest(msg),
            ServiceError::PartialDeletion { failures, .. } => ApiError::PartialDeletion(failures),
            ServiceError::Decode(_) | ServiceError::Store(_) | ServiceError::Blob(_) => {
                tracing::error!("request failed: {e}");
                ApiError::Internal
            }
        }
    }
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        ServiceError::from(e).into()
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;
        let status = match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::PartialDeletion(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let failures = match self {
            ApiError::PartialDeletion(f) => f.clone(),
            _ => Vec::new(),
        };
        HttpResponse::build(status).json(ApiErrorBody { error: self.to_string(), failures })
    }
}
