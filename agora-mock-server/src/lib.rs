use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use agora_api::{
    AuthToken, Comment, CommentFilter, CommentId, CommentStats, Db, DbPool, Flag, NewComment,
    Notification, Notifier, Reply, ReplyId, Time, TopicId, User, UserId, Uuid, Vote,
};
use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// In-memory comment store, sharing its state between all its connections
#[derive(Clone, Default)]
pub struct MockServer(Arc<Mutex<State>>);

#[derive(Debug, Default)]
struct State {
    users: HashMap<UserId, User>,
    sessions: HashMap<AuthToken, UserId>,
    topics: HashMap<TopicId, Option<String>>,
    comments: BTreeMap<CommentId, Comment>,
    broken_user_lookups: bool,
}

impl State {
    fn comment_mut(&mut self, id: CommentId) -> anyhow::Result<&mut Comment> {
        self.comments
            .get_mut(&id)
            .ok_or_else(|| anyhow!("comment {id} does not exist"))
    }
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer::default()
    }

    pub async fn test_add_user(&self, u: User) {
        self.0.lock().await.users.insert(u.id, u);
    }

    /// Opens a session for `user`, returning its token
    pub async fn test_add_session(&self, user: UserId) -> AuthToken {
        let tok = AuthToken(Uuid::new_v4());
        self.0.lock().await.sessions.insert(tok, user);
        tok
    }

    pub async fn test_add_topic(&self, topic: TopicId, forum: Option<String>) {
        self.0.lock().await.topics.insert(topic, forum);
    }

    pub async fn test_comment(&self, id: CommentId) -> Option<Comment> {
        self.0.lock().await.comments.get(&id).cloned()
    }

    pub async fn test_num_comments(&self) -> usize {
        self.0.lock().await.comments.len()
    }

    /// Makes every later `fetch_users` call fail
    pub async fn test_break_user_lookups(&self) {
        self.0.lock().await.broken_user_lookups = true;
    }
}

#[async_trait]
impl DbPool for MockServer {
    async fn acquire(&self) -> anyhow::Result<Box<dyn Db>> {
        Ok(Box::new(MockConn(self.0.clone())))
    }
}

struct MockConn(Arc<Mutex<State>>);

#[async_trait]
impl Db for MockConn {
    async fn recover_session(&mut self, token: AuthToken) -> anyhow::Result<Option<User>> {
        let state = self.0.lock().await;
        Ok(state
            .sessions
            .get(&token)
            .and_then(|u| state.users.get(u))
            .cloned())
    }

    async fn fetch_users(&mut self, ids: &[UserId]) -> anyhow::Result<HashMap<UserId, User>> {
        let state = self.0.lock().await;
        if state.broken_user_lookups {
            return Err(anyhow!("user lookups are broken"));
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.users.get(id).map(|u| (*id, u.clone())))
            .collect())
    }

    async fn topic_forum(&mut self, topic: TopicId) -> anyhow::Result<Option<String>> {
        Ok(self.0.lock().await.topics.get(&topic).cloned().flatten())
    }

    async fn list_comments(&mut self, filter: &CommentFilter) -> anyhow::Result<Vec<Comment>> {
        let state = self.0.lock().await;
        Ok(filter
            .apply(state.comments.values())
            .into_iter()
            .cloned()
            .collect())
    }

    async fn count_comments(&mut self, filter: &CommentFilter) -> anyhow::Result<u64> {
        let state = self.0.lock().await;
        Ok(filter.apply(state.comments.values()).len() as u64)
    }

    async fn fetch_comment(&mut self, id: CommentId) -> anyhow::Result<Option<Comment>> {
        Ok(self.0.lock().await.comments.get(&id).cloned())
    }

    async fn create_comment(&mut self, c: NewComment) -> anyhow::Result<Comment> {
        let mut state = self.0.lock().await;
        if !state.users.contains_key(&c.author) {
            return Err(anyhow!("author {} does not exist", c.author));
        }
        if state.comments.contains_key(&c.id) {
            return Err(anyhow!("comment {} already exists", c.id));
        }
        let c = c.into_comment();
        state.comments.insert(c.id, c.clone());
        Ok(c)
    }

    async fn edit_comment(&mut self, id: CommentId, text: &str, at: Time) -> anyhow::Result<()> {
        let mut state = self.0.lock().await;
        let c = state.comment_mut(id)?;
        c.text = String::from(text);
        c.edited_at = Some(at);
        Ok(())
    }

    async fn remove_comment(&mut self, id: CommentId) -> anyhow::Result<()> {
        self.0
            .lock()
            .await
            .comments
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("comment {id} does not exist"))
    }

    async fn set_vote(
        &mut self,
        comment: CommentId,
        user: UserId,
        vote: Option<&Vote>,
    ) -> anyhow::Result<bool> {
        let mut state = self.0.lock().await;
        let c = state.comment_mut(comment)?;
        match vote {
            None => Ok(c.unvote(user)),
            Some(v) if c.vote_of(user) == Some(v.value) => Ok(false),
            Some(v) => {
                c.unvote(user);
                c.votes.push(v.clone());
                Ok(true)
            }
        }
    }

    async fn set_flag(
        &mut self,
        comment: CommentId,
        user: UserId,
        flag: Option<&Flag>,
    ) -> anyhow::Result<bool> {
        let mut state = self.0.lock().await;
        let c = state.comment_mut(comment)?;
        match flag {
            None => Ok(c.unflag(user)),
            Some(_) if c.is_flagged_by(user) => Ok(false),
            Some(f) => {
                c.flags.push(f.clone());
                Ok(true)
            }
        }
    }

    async fn add_reply(&mut self, comment: CommentId, reply: &Reply) -> anyhow::Result<()> {
        let mut state = self.0.lock().await;
        if !state.users.contains_key(&reply.author) {
            return Err(anyhow!("reply author {} does not exist", reply.author));
        }
        state.comment_mut(comment)?.replies.push(reply.clone());
        Ok(())
    }

    async fn edit_reply(
        &mut self,
        comment: CommentId,
        reply: ReplyId,
        text: &str,
        at: Time,
    ) -> anyhow::Result<()> {
        let mut state = self.0.lock().await;
        let r = state.comment_mut(comment)?.reply_mut(reply)?;
        r.text = String::from(text);
        r.edited_at = Some(at);
        Ok(())
    }

    async fn remove_reply(&mut self, comment: CommentId, reply: ReplyId) -> anyhow::Result<()> {
        let mut state = self.0.lock().await;
        let c = state.comment_mut(comment)?;
        let before = c.replies.len();
        c.replies.retain(|r| r.id != reply);
        if c.replies.len() == before {
            return Err(anyhow!("reply {reply} does not exist on comment {comment}"));
        }
        Ok(())
    }

    async fn stats(&mut self) -> anyhow::Result<CommentStats> {
        let state = self.0.lock().await;
        Ok(CommentStats {
            ratings: state.comments.values().map(|c| c.votes.len() as u64).sum(),
            replies: state.comments.values().map(|c| c.replies.len() as u64).sum(),
        })
    }
}

/// Notifier keeping every notification it is asked to send
#[derive(Clone, Default)]
pub struct MockNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    failing: bool,
}

impl MockNotifier {
    pub fn new() -> MockNotifier {
        MockNotifier::default()
    }

    /// Notifier that records, then reports a delivery failure
    pub fn failing() -> MockNotifier {
        MockNotifier {
            sent: Arc::new(Mutex::new(Vec::new())),
            failing: true,
        }
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, n: Notification) -> anyhow::Result<()> {
        self.sent.lock().await.push(n);
        if self.failing {
            return Err(anyhow!("mock notifier is failing"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use agora_api::{now, Context, VoteValue};

    use super::*;

    fn user() -> User {
        User {
            id: UserId(Uuid::new_v4()),
            first_name: String::from("Mock"),
            last_name: String::from("User"),
            email: String::from("mock@example.org"),
            staff: false,
            status: None,
            avatar: None,
        }
    }

    #[tokio::test]
    async fn sessions_resolve_to_users() {
        let mock = MockServer::new();
        let u = user();
        mock.test_add_user(u.clone()).await;
        let tok = mock.test_add_session(u.id).await;
        let mut conn = mock.acquire().await.unwrap();
        assert_eq!(conn.recover_session(tok).await.unwrap(), Some(u));
        assert_eq!(conn.recover_session(AuthToken::stub()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn votes_replace_each_other() {
        let mock = MockServer::new();
        let author = user();
        let voter = user();
        mock.test_add_user(author.clone()).await;
        mock.test_add_user(voter.clone()).await;
        let mut conn = mock.acquire().await.unwrap();
        let c = conn
            .create_comment(NewComment {
                id: CommentId(Uuid::new_v4()),
                topic_id: TopicId(Uuid::new_v4()),
                author: author.id,
                text: String::from("hi"),
                alias: None,
                context: Context::Topic,
                reference: String::from("ref"),
                created_at: now(),
            })
            .await
            .unwrap();
        let vote = |value| Vote {
            author: voter.id,
            value,
            created_at: now(),
        };
        let changes = [
            (Some(vote(VoteValue::Positive)), true),
            (Some(vote(VoteValue::Positive)), false),
            (Some(vote(VoteValue::Negative)), true),
        ];
        for (v, changed) in changes {
            assert_eq!(
                conn.set_vote(c.id, voter.id, v.as_ref()).await.unwrap(),
                changed
            );
        }
        let stored = mock.test_comment(c.id).await.unwrap();
        assert_eq!(stored.votes.len(), 1);
        assert_eq!(stored.score(), -1);
        assert_eq!(conn.stats().await.unwrap().ratings, 1);
        assert!(conn.set_vote(c.id, voter.id, None).await.unwrap());
        assert!(!conn.set_vote(c.id, voter.id, None).await.unwrap());
    }

    #[tokio::test]
    async fn flags_report_whether_they_changed() {
        let mock = MockServer::new();
        let author = user();
        let flagger = user();
        mock.test_add_user(author.clone()).await;
        mock.test_add_user(flagger.clone()).await;
        let mut conn = mock.acquire().await.unwrap();
        let c = conn
            .create_comment(NewComment {
                id: CommentId(Uuid::new_v4()),
                topic_id: TopicId(Uuid::new_v4()),
                author: author.id,
                text: String::from("buy now"),
                alias: None,
                context: Context::Topic,
                reference: String::from("ref"),
                created_at: now(),
            })
            .await
            .unwrap();
        let flag = Flag {
            author: flagger.id,
            value: String::from(agora_api::SPAM),
            created_at: now(),
        };
        assert!(conn.set_flag(c.id, flagger.id, Some(&flag)).await.unwrap());
        assert!(!conn.set_flag(c.id, flagger.id, Some(&flag)).await.unwrap());
        assert_eq!(mock.test_comment(c.id).await.unwrap().flags, vec![flag]);
        assert!(conn.set_flag(c.id, flagger.id, None).await.unwrap());
        assert!(!conn.set_flag(c.id, flagger.id, None).await.unwrap());
    }

    #[tokio::test]
    async fn failing_notifier_still_records() {
        let notifier = MockNotifier::failing();
        let n = Notification {
            event: agora_api::NotificationEvent::CommentReply,
            to: String::from("a@example.org"),
            data: serde_json::Value::Null,
        };
        assert!(notifier.notify(n.clone()).await.is_err());
        assert_eq!(notifier.sent().await, vec![n]);
    }
}
