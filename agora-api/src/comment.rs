use std::str::FromStr;

use bolero::generator::TypeGenerator;

use crate::{CommentId, Error, ReplyId, Time, TopicId, User, UserId};

/// Value recorded for every flag, the only kind of flag there is
pub const SPAM: &str = "spam";

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    TypeGenerator,
    serde::Deserialize,
    serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Context {
    Topic,
    Paragraph,
}

impl Default for Context {
    fn default() -> Context {
        Context::Topic
    }
}

impl Context {
    pub fn as_str(&self) -> &'static str {
        match self {
            Context::Topic => "topic",
            Context::Paragraph => "paragraph",
        }
    }
}

impl FromStr for Context {
    type Err = Error;

    fn from_str(s: &str) -> Result<Context, Error> {
        match s {
            "topic" => Ok(Context::Topic),
            "paragraph" => Ok(Context::Paragraph),
            _ => Err(Error::InvalidContext(String::from(s))),
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    TypeGenerator,
    serde::Deserialize,
    serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum VoteValue {
    Positive,
    Negative,
}

impl VoteValue {
    /// Contribution of this vote to a comment's score
    pub fn weight(&self) -> i16 {
        match self {
            VoteValue::Positive => 1,
            VoteValue::Negative => -1,
        }
    }

    pub fn from_weight(w: i16) -> Option<VoteValue> {
        match w {
            1 => Some(VoteValue::Positive),
            -1 => Some(VoteValue::Negative),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub author: UserId,
    pub value: VoteValue,
    pub created_at: Time,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub author: UserId,
    pub value: String,
    pub created_at: Time,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub id: ReplyId,
    pub author: UserId,
    pub text: String,
    pub alias: Option<String>,
    pub created_at: Time,
    pub edited_at: Option<Time>,
}

impl Reply {
    pub fn check_editable_by(&self, user: &User) -> Result<(), Error> {
        if self.author != user.id {
            return Err(Error::ReplyNotYours);
        }
        Ok(())
    }

    pub fn check_removable_by(&self, user: &User) -> Result<(), Error> {
        if self.author != user.id && !user.staff {
            return Err(Error::ReplyNotYours);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub topic_id: TopicId,
    pub author: UserId,
    pub text: String,
    pub alias: Option<String>,
    pub context: Context,

    /// Id of the commented entity, the topic itself or one of its paragraphs
    pub reference: String,

    pub created_at: Time,
    pub edited_at: Option<Time>,

    /// At most one vote per user, in the order they were cast
    pub votes: Vec<Vote>,

    /// At most one flag per user, in the order they were raised
    pub flags: Vec<Flag>,

    /// Replies in chronological order
    pub replies: Vec<Reply>,
}

impl Comment {
    pub fn upvotes(&self) -> usize {
        self.votes
            .iter()
            .filter(|v| v.value == VoteValue::Positive)
            .count()
    }

    pub fn downvotes(&self) -> usize {
        self.votes
            .iter()
            .filter(|v| v.value == VoteValue::Negative)
            .count()
    }

    pub fn score(&self) -> i64 {
        self.votes.iter().map(|v| i64::from(v.value.weight())).sum()
    }

    pub fn vote_of(&self, user: UserId) -> Option<VoteValue> {
        self.votes
            .iter()
            .find(|v| v.author == user)
            .map(|v| v.value)
    }

    pub fn is_flagged_by(&self, user: UserId) -> bool {
        self.flags.iter().any(|f| f.author == user)
    }

    /// Casts `user`'s vote, replacing any previous one.
    ///
    /// Returns whether the set of votes changed: repeating the current vote
    /// is a no-op.
    pub fn vote(&mut self, user: UserId, value: VoteValue, now: Time) -> Result<bool, Error> {
        if user == self.author {
            return Err(Error::VoteNotAllowed);
        }
        if self.vote_of(user) == Some(value) {
            return Ok(false);
        }
        self.unvote(user);
        self.votes.push(Vote {
            author: user,
            value,
            created_at: now,
        });
        Ok(true)
    }

    /// Returns whether `user` had a vote to remove
    pub fn unvote(&mut self, user: UserId) -> bool {
        let before = self.votes.len();
        self.votes.retain(|v| v.author != user);
        self.votes.len() != before
    }

    /// Flags the comment as spam on behalf of `user`, returning whether this is a new flag
    pub fn flag(&mut self, user: UserId, now: Time) -> Result<bool, Error> {
        if user == self.author {
            return Err(Error::FlagNotAllowed);
        }
        if self.is_flagged_by(user) {
            return Ok(false);
        }
        self.flags.push(Flag {
            author: user,
            value: String::from(SPAM),
            created_at: now,
        });
        Ok(true)
    }

    pub fn unflag(&mut self, user: UserId) -> bool {
        let before = self.flags.len();
        self.flags.retain(|f| f.author != user);
        self.flags.len() != before
    }

    pub fn check_editable_by(&self, user: &User) -> Result<(), Error> {
        if self.author != user.id {
            return Err(Error::NotYours);
        }
        Ok(())
    }

    pub fn check_removable_by(&self, user: &User) -> Result<(), Error> {
        if self.author != user.id && !user.staff {
            return Err(Error::NotYours);
        }
        if !self.replies.is_empty() && !user.staff {
            return Err(Error::CannotRemove);
        }
        Ok(())
    }

    pub fn reply(&self, id: ReplyId) -> Result<&Reply, Error> {
        self.replies
            .iter()
            .find(|r| r.id == id)
            .ok_or(Error::ReplyNotFound(id.0))
    }

    pub fn reply_mut(&mut self, id: ReplyId) -> Result<&mut Reply, Error> {
        self.replies
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(Error::ReplyNotFound(id.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{now, Uuid};

    fn user(staff: bool) -> User {
        User {
            id: UserId(Uuid::new_v4()),
            first_name: String::from("Test"),
            last_name: String::from("User"),
            email: String::from("test@example.org"),
            staff,
            status: None,
            avatar: None,
        }
    }

    fn comment_by(author: &User) -> Comment {
        Comment {
            id: CommentId(Uuid::new_v4()),
            topic_id: TopicId(Uuid::new_v4()),
            author: author.id,
            text: String::from("hello"),
            alias: None,
            context: Context::Topic,
            reference: String::new(),
            created_at: now(),
            edited_at: None,
            votes: Vec::new(),
            flags: Vec::new(),
            replies: Vec::new(),
        }
    }

    fn reply_by(author: &User) -> Reply {
        Reply {
            id: ReplyId(Uuid::new_v4()),
            author: author.id,
            text: String::from("reply"),
            alias: None,
            created_at: now(),
            edited_at: None,
        }
    }

    #[test]
    fn voting_is_idempotent_and_exclusive() {
        let author = user(false);
        let voter = user(false);
        let mut c = comment_by(&author);

        assert_eq!(c.vote(voter.id, VoteValue::Positive, now()), Ok(true));
        assert_eq!(c.vote(voter.id, VoteValue::Positive, now()), Ok(false));
        assert_eq!((c.upvotes(), c.downvotes(), c.score()), (1, 0, 1));

        assert_eq!(c.vote(voter.id, VoteValue::Negative, now()), Ok(true));
        assert_eq!((c.upvotes(), c.downvotes(), c.score()), (0, 1, -1));
        assert_eq!(c.votes.len(), 1);

        assert!(c.unvote(voter.id));
        assert!(!c.unvote(voter.id));
        assert_eq!(c.score(), 0);
    }

    #[test]
    fn authors_cannot_vote_or_flag_their_own_comment() {
        let author = user(true);
        let mut c = comment_by(&author);
        assert_eq!(
            c.vote(author.id, VoteValue::Positive, now()),
            Err(Error::VoteNotAllowed)
        );
        assert_eq!(c.flag(author.id, now()), Err(Error::FlagNotAllowed));
        assert!(c.votes.is_empty() && c.flags.is_empty());
    }

    #[test]
    fn flags_are_unique_per_user() {
        let author = user(false);
        let flagger = user(false);
        let mut c = comment_by(&author);
        assert_eq!(c.flag(flagger.id, now()), Ok(true));
        assert_eq!(c.flag(flagger.id, now()), Ok(false));
        assert_eq!(c.flags.len(), 1);
        assert_eq!(c.flags[0].value, SPAM);
        assert!(c.unflag(flagger.id));
        assert!(c.flags.is_empty());
    }

    #[test]
    fn only_the_author_edits() {
        let author = user(false);
        let staff = user(true);
        let c = comment_by(&author);
        assert_eq!(c.check_editable_by(&author), Ok(()));
        assert_eq!(c.check_editable_by(&staff), Err(Error::NotYours));
    }

    #[test]
    fn removal_rules() {
        let author = user(false);
        let other = user(false);
        let staff = user(true);
        let mut c = comment_by(&author);
        assert_eq!(c.check_removable_by(&author), Ok(()));
        assert_eq!(c.check_removable_by(&other), Err(Error::NotYours));
        assert_eq!(c.check_removable_by(&staff), Ok(()));

        c.replies.push(reply_by(&other));
        assert_eq!(c.check_removable_by(&author), Err(Error::CannotRemove));
        assert_eq!(c.check_removable_by(&staff), Ok(()));
    }

    #[test]
    fn reply_permissions() {
        let author = user(false);
        let other = user(false);
        let staff = user(true);
        let r = reply_by(&author);
        assert_eq!(r.check_editable_by(&author), Ok(()));
        assert_eq!(r.check_editable_by(&staff), Err(Error::ReplyNotYours));
        assert_eq!(r.check_removable_by(&other), Err(Error::ReplyNotYours));
        assert_eq!(r.check_removable_by(&staff), Ok(()));
    }

    #[test]
    fn context_parsing() {
        assert_eq!("paragraph".parse::<Context>(), Ok(Context::Paragraph));
        assert_eq!(
            "sidebar".parse::<Context>(),
            Err(Error::InvalidContext(String::from("sidebar")))
        );
        assert_eq!(Context::default(), Context::Topic);
    }
}
