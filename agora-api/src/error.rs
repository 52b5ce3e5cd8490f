use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Request does not accept json")]
    NotAcceptable,

    #[error("Request didn't include `topicId` parameter")]
    MissingTopicId,

    #[error("Invalid id {0:?}")]
    InvalidId(String),

    #[error("Invalid number {0:?}")]
    InvalidNumber(String),

    #[error("Invalid comment context {0:?}")]
    InvalidContext(String),

    #[error("Malformed request: {0}")]
    MalformedBody(String),

    #[error("Comment text is required")]
    TextRequired,

    #[error("Comment text is too long ({0} characters)")]
    TextTooLong(usize),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Comment not found {0}")]
    CommentNotFound(Uuid),

    #[error("Reply not found {0}")]
    ReplyNotFound(Uuid),

    #[error("That comment is not yours")]
    NotYours,

    #[error("That reply is not yours")]
    ReplyNotYours,

    #[error("Comments with replies cannot be removed")]
    CannotRemove,

    #[error("Authors cannot vote their own comments")]
    VoteNotAllowed,

    #[error("Authors cannot flag their own comments")]
    FlagNotAllowed,
}

impl Error {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::PermissionDenied => StatusCode::UNAUTHORIZED,
            Error::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            Error::VoteNotAllowed => StatusCode::UNAUTHORIZED,
            Error::FlagNotAllowed => StatusCode::UNAUTHORIZED,
            Error::MissingTopicId
            | Error::InvalidId(_)
            | Error::InvalidNumber(_)
            | Error::InvalidContext(_)
            | Error::MalformedBody(_)
            | Error::TextRequired
            | Error::TextTooLong(_)
            | Error::NullByteInString(_)
            | Error::CommentNotFound(_)
            | Error::ReplyNotFound(_)
            | Error::NotYours
            | Error::ReplyNotYours
            | Error::CannotRemove => StatusCode::BAD_REQUEST,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "error": "unknown",
                "message": msg,
            }),
            Error::PermissionDenied => json!({ "error": "permission-denied" }),
            Error::NotAcceptable => json!({ "error": "not-acceptable" }),
            Error::MissingTopicId => json!({ "error": "comments.missing-topic-id" }),
            Error::InvalidId(id) => json!({
                "error": "invalid-id",
                "id": id,
            }),
            Error::InvalidNumber(n) => json!({
                "error": "invalid-number",
                "number": n,
            }),
            Error::InvalidContext(c) => json!({
                "error": "comments.invalid-context",
                "context": c,
            }),
            Error::MalformedBody(msg) => json!({
                "error": "malformed-body",
                "message": msg,
            }),
            Error::TextRequired => json!({ "error": "comments.text-required" }),
            Error::TextTooLong(len) => json!({
                "error": "comments.text-too-long",
                "length": len,
            }),
            Error::NullByteInString(s) => json!({
                "error": "null-byte",
                "string": s,
            }),
            Error::CommentNotFound(id) => json!({
                "error": "comments.not-found",
                "id": id,
            }),
            Error::ReplyNotFound(id) => json!({
                "error": "comments.reply-not-found",
                "id": id,
            }),
            Error::NotYours => json!({ "error": "comments.not-yours" }),
            Error::ReplyNotYours => json!({ "error": "comments.reply-not-yours" }),
            Error::CannotRemove => json!({ "error": "comments.cannot-remove" }),
            Error::VoteNotAllowed => json!({ "error": "comments.score.not-allowed" }),
            Error::FlagNotAllowed => json!({ "error": "comments.flag.not-allowed" }),
        })
        .expect("serializing error")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let field = |name: &str| -> anyhow::Result<String> {
            data.get(name)
                .and_then(|v| v.as_str())
                .map(String::from)
                .ok_or_else(|| anyhow!("error is missing its {name} field"))
        };
        let uuid_field = |name: &str| -> anyhow::Result<Uuid> {
            Uuid::from_str(&field(name)?).with_context(|| format!("parsing {name} field as uuid"))
        };
        Ok(
            match data
                .get("error")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(field("message").unwrap_or_default()),
                "permission-denied" => Error::PermissionDenied,
                "not-acceptable" => Error::NotAcceptable,
                "comments.missing-topic-id" => Error::MissingTopicId,
                "invalid-id" => Error::InvalidId(field("id")?),
                "invalid-number" => Error::InvalidNumber(field("number")?),
                "comments.invalid-context" => Error::InvalidContext(field("context")?),
                "malformed-body" => Error::MalformedBody(field("message")?),
                "comments.text-required" => Error::TextRequired,
                "comments.text-too-long" => Error::TextTooLong(
                    data.get("length")
                        .and_then(|l| l.as_u64())
                        .ok_or_else(|| anyhow!("text-too-long error without a length"))?
                        as usize,
                ),
                "null-byte" => Error::NullByteInString(field("string")?),
                "comments.not-found" => Error::CommentNotFound(uuid_field("id")?),
                "comments.reply-not-found" => Error::ReplyNotFound(uuid_field("id")?),
                "comments.not-yours" => Error::NotYours,
                "comments.reply-not-yours" => Error::ReplyNotYours,
                "comments.cannot-remove" => Error::CannotRemove,
                "comments.score.not-allowed" => Error::VoteNotAllowed,
                "comments.flag.not-allowed" => Error::FlagNotAllowed,
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_refusal_is_unauthorized_with_its_message_key() {
        let err = Error::VoteNotAllowed;
        assert_eq!(err.status_code(), http::StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_slice(&err.contents()).unwrap();
        assert_eq!(body, json!({ "error": "comments.score.not-allowed" }));
    }

    #[test]
    fn ownership_errors_are_bad_requests() {
        for err in [Error::NotYours, Error::ReplyNotYours, Error::CannotRemove] {
            assert_eq!(err.status_code(), http::StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn parse_recovers_payloads() {
        let id = Uuid::new_v4();
        for err in [
            Error::CommentNotFound(id),
            Error::TextTooLong(5000),
            Error::InvalidContext(String::from("sidebar")),
            Error::Unknown(String::from("boom")),
        ] {
            assert_eq!(Error::parse(&err.contents()).unwrap(), err);
        }
    }

    #[test]
    fn parse_rejects_unknown_types() {
        assert!(Error::parse(br#"{"error": "nope"}"#).is_err());
        assert!(Error::parse(b"not json").is_err());
    }
}
