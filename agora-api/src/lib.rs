use chrono::{Timelike, Utc};

mod comment;
mod db;
mod error;
mod notify;
mod query;
mod user;
mod view;

pub use comment::{Comment, Context, Flag, Reply, Vote, VoteValue, SPAM};
pub use db::{CommentStats, Db, DbPool, NewComment};
pub use error::Error;
pub use notify::{Notification, NotificationEvent, Notifier};
pub use query::{AuthorFilter, CommentFilter, Paging, SortOrder};
pub use user::User;
pub use view::{AuthorView, CommentView, EditedReplyView, RepliesView, ReplyCount, ReplyView};

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

/// Longest accepted comment or reply text, in characters
pub const MAX_TEXT_LEN: usize = 4096;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Clone,
            Copy,
            Debug,
            Eq,
            Hash,
            Ord,
            PartialEq,
            PartialOrd,
            serde::Deserialize,
            serde::Serialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn stub() -> $name {
                $name(STUB_UUID)
            }

            pub fn parse(s: &str) -> Result<$name, Error> {
                Uuid::try_parse(s)
                    .map($name)
                    .map_err(|_| Error::InvalidId(String::from(s)))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(UserId);
id_type!(CommentId);
id_type!(ReplyId);
id_type!(TopicId);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AuthToken(pub Uuid);

impl AuthToken {
    pub fn stub() -> AuthToken {
        AuthToken(STUB_UUID)
    }
}

pub fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        Err(Error::NullByteInString(String::from(s)))
    } else {
        Ok(())
    }
}

/// Checks user-provided comment or reply text, returning it if acceptable
pub fn validate_text(text: Option<String>) -> Result<String, Error> {
    let text = text.ok_or(Error::TextRequired)?;
    validate_string(&text)?;
    if text.trim().is_empty() {
        return Err(Error::TextRequired);
    }
    let len = text.chars().count();
    if len > MAX_TEXT_LEN {
        return Err(Error::TextTooLong(len));
    }
    Ok(text)
}

/// Truncates a timestamp to the microsecond precision the database keeps
pub fn now() -> Time {
    let now = Utc::now();
    let micros = now.timestamp_subsec_micros();
    now.with_nanosecond(micros * 1000).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_validation() {
        assert_eq!(validate_text(None), Err(Error::TextRequired));
        assert_eq!(
            validate_text(Some(String::from("  \n "))),
            Err(Error::TextRequired)
        );
        assert_eq!(
            validate_text(Some(String::from("a\0b"))),
            Err(Error::NullByteInString(String::from("a\0b")))
        );
        let long = "é".repeat(MAX_TEXT_LEN + 1);
        assert_eq!(
            validate_text(Some(long)),
            Err(Error::TextTooLong(MAX_TEXT_LEN + 1))
        );
        let max = "é".repeat(MAX_TEXT_LEN);
        assert_eq!(validate_text(Some(max.clone())), Ok(max));
    }

    #[test]
    fn ids_parse_or_report_the_input() {
        let id = Uuid::new_v4();
        assert_eq!(CommentId::parse(&id.to_string()), Ok(CommentId(id)));
        assert_eq!(
            TopicId::parse("not-a-uuid"),
            Err(Error::InvalidId(String::from("not-a-uuid")))
        );
    }

    #[test]
    fn now_has_microsecond_precision() {
        assert_eq!(now().timestamp_subsec_nanos() % 1000, 0);
    }
}
