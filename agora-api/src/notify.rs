use async_trait::async_trait;

use crate::VoteValue;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationEvent {
    CommentReply,
    CommentUpvote,
    CommentDownvote,
}

impl NotificationEvent {
    pub fn for_vote(value: VoteValue) -> NotificationEvent {
        match value {
            VoteValue::Positive => NotificationEvent::CommentUpvote,
            VoteValue::Negative => NotificationEvent::CommentDownvote,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NotificationEvent::CommentReply => "comment-reply",
            NotificationEvent::CommentUpvote => "comment-upvote",
            NotificationEvent::CommentDownvote => "comment-downvote",
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Notification {
    pub event: NotificationEvent,

    /// E-mail address of the recipient
    pub to: String,

    pub data: serde_json::Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, n: Notification) -> anyhow::Result<()>;
}
