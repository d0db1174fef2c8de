//! Client-facing error mapping for both dialects.

use serde_json::Value;

use kgate_protocol::error::ErrorBody;

use crate::engine::ApiDialect;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upstream overloaded")]
    Overloaded,
    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl EngineError {
    pub fn status(&self, dialect: ApiDialect) -> u16 {
        match self {
            EngineError::Auth(_) => 401,
            EngineError::RateLimited(_) => 429,
            EngineError::InvalidRequest(_) => 400,
            EngineError::Overloaded => match dialect {
                ApiDialect::Anthropic => 529,
                ApiDialect::OpenAi => 503,
            },
            EngineError::Upstream(_) => 500,
        }
    }

    pub fn error_type(&self, dialect: ApiDialect) -> &'static str {
        match self {
            EngineError::Auth(_) => "authentication_error",
            EngineError::RateLimited(_) => "rate_limit_error",
            EngineError::InvalidRequest(_) => "invalid_request_error",
            EngineError::Overloaded => match dialect {
                ApiDialect::Anthropic => "overloaded_error",
                ApiDialect::OpenAi => "server_error",
            },
            EngineError::Upstream(_) => match dialect {
                ApiDialect::Anthropic => "api_error",
                ApiDialect::OpenAi => "server_error",
            },
        }
    }

    pub fn body(&self, dialect: ApiDialect) -> Value {
        let error = ErrorBody::new(self.error_type(dialect), self.to_string());
        match dialect {
            ApiDialect::Anthropic => error.anthropic_envelope(),
            ApiDialect::OpenAi => error.openai_envelope(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_by_dialect() {
        assert_eq!(EngineError::Overloaded.status(ApiDialect::Anthropic), 529);
        assert_eq!(EngineError::Overloaded.status(ApiDialect::OpenAi), 503);
        assert_eq!(
            EngineError::Auth("no key".to_string()).status(ApiDialect::OpenAi),
            401
        );
    }

    #[test]
    fn anthropic_envelope_shape() {
        let body = EngineError::RateLimited("slow down".to_string()).body(ApiDialect::Anthropic);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");
    }

    #[test]
    fn openai_envelope_shape() {
        let body = EngineError::InvalidRequest("bad json".to_string()).body(ApiDialect::OpenAi);
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }
}
