use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    ConfigError(String),
    ValidationError(String),
    InsufficientTokens { required: u64, available: u64 },
    UpstreamError(String),
    StorageError(String),
    SerializationError(String),
    InternalError(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            GatewayError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            GatewayError::InsufficientTokens {
                required,
                available,
            } => write!(
                f,
                "Insufficient tokens: {} required, {} available",
                required, available
            ),
            GatewayError::UpstreamError(msg) => write!(f, "AI server error: {}", msg),
            GatewayError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            GatewayError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            GatewayError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl actix_web::ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ValidationError(_) | GatewayError::InsufficientTokens { .. } => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "detail": self.to_string() }))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
