#![forbid(unsafe_code)]

mod token;

pub use token::{Claims, TokenKeys, DEFAULT_TOKEN_TTL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing authorization token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("token has expired")]
    ExpiredToken,
}
