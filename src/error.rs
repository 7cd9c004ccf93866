use axum::response::{IntoResponse, Response};
use http::StatusCode;

#[derive(Debug)]
pub enum AppError {
    ResourceNotFound(String),
    InvalidArgument(String),
    Unauthenticated(String),
    InternalServerError(anyhow::Error),
}

impl AppError {
    pub fn resource_not_found<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::ResourceNotFound(t.to_string())
    }

    pub fn invalid_argument<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::InvalidArgument(t.to_string())
    }

    pub fn unauthenticated<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::Unauthenticated(t.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::ResourceNotFound(err) => write!(f, "{}", err),
            AppError::InvalidArgument(err) => write!(f, "{}", err),
            AppError::Unauthenticated(err) => write!(f, "{}", err),
            AppError::InternalServerError(err) => write!(f, "{}", err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::ResourceNotFound(err) => (StatusCode::NOT_FOUND, err).into_response(),
            AppError::InvalidArgument(err) => (StatusCode::BAD_REQUEST, err).into_response(),
            AppError::Unauthenticated(err) => (StatusCode::UNAUTHORIZED, err).into_response(),
            AppError::InternalServerError(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        AppError::InternalServerError(err.into())
    }
}
