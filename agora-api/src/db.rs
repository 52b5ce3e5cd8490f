use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    AuthToken, Comment, CommentFilter, CommentId, Context, Flag, Reply, ReplyId, Time, TopicId,
    User, UserId, Vote,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewComment {
    pub id: CommentId,
    pub topic_id: TopicId,
    pub author: UserId,
    pub text: String,
    pub alias: Option<String>,
    pub context: Context,
    pub reference: String,
    pub created_at: Time,
}

impl NewComment {
    pub fn into_comment(self) -> Comment {
        Comment {
            id: self.id,
            topic_id: self.topic_id,
            author: self.author,
            text: self.text,
            alias: self.alias,
            context: self.context,
            reference: self.reference,
            created_at: self.created_at,
            edited_at: None,
            votes: Vec::new(),
            flags: Vec::new(),
            replies: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentStats {
    /// Number of votes cast on all comments
    pub ratings: u64,

    /// Number of replies to all comments
    pub replies: u64,
}

/// One connection to the comment store.
///
/// Mutations only touch storage: permission checks happen on the loaded
/// `Comment` before they are called.
#[async_trait]
pub trait Db: Send {
    async fn recover_session(&mut self, token: AuthToken) -> anyhow::Result<Option<User>>;
    async fn fetch_users(&mut self, ids: &[UserId]) -> anyhow::Result<HashMap<UserId, User>>;

    /// Name of the forum the topic belongs to, if any
    async fn topic_forum(&mut self, topic: TopicId) -> anyhow::Result<Option<String>>;

    async fn list_comments(&mut self, filter: &CommentFilter) -> anyhow::Result<Vec<Comment>>;

    /// Number of comments `list_comments` would return, paging included
    async fn count_comments(&mut self, filter: &CommentFilter) -> anyhow::Result<u64>;

    async fn fetch_comment(&mut self, id: CommentId) -> anyhow::Result<Option<Comment>>;
    async fn create_comment(&mut self, c: NewComment) -> anyhow::Result<Comment>;
    async fn edit_comment(&mut self, id: CommentId, text: &str, at: Time) -> anyhow::Result<()>;
    async fn remove_comment(&mut self, id: CommentId) -> anyhow::Result<()>;

    /// Replaces `user`'s vote on the comment, removing it if `vote` is `None`.
    ///
    /// Returns `false` if the stored vote already was `vote`.
    async fn set_vote(
        &mut self,
        comment: CommentId,
        user: UserId,
        vote: Option<&Vote>,
    ) -> anyhow::Result<bool>;

    /// Sets or removes `user`'s flag on the comment, returning whether it changed
    async fn set_flag(
        &mut self,
        comment: CommentId,
        user: UserId,
        flag: Option<&Flag>,
    ) -> anyhow::Result<bool>;

    async fn add_reply(&mut self, comment: CommentId, reply: &Reply) -> anyhow::Result<()>;
    async fn edit_reply(
        &mut self,
        comment: CommentId,
        reply: ReplyId,
        text: &str,
        at: Time,
    ) -> anyhow::Result<()>;
    async fn remove_reply(&mut self, comment: CommentId, reply: ReplyId) -> anyhow::Result<()>;

    async fn stats(&mut self) -> anyhow::Result<CommentStats>;
}

#[async_trait]
pub trait DbPool: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<Box<dyn Db>>;
}
