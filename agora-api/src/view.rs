//! Whitelisted JSON projections of comments and replies.
//!
//! Fields that are absent on the underlying record (no alias, never edited,
//! no avatar...) are left out of the output rather than sent as `null`.

use crate::{Comment, CommentId, Context, Flag, Reply, ReplyId, Time, User, UserId, Vote};

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorView {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staff: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl AuthorView {
    fn base(id: UserId, user: Option<&User>) -> AuthorView {
        AuthorView {
            id,
            full_name: user.map(|u| u.full_name()),
            display_name: None,
            avatar: user.and_then(|u| u.avatar.clone()),
            staff: None,
            status: None,
        }
    }

    /// `id fullName displayName avatar staff status`
    pub fn full(id: UserId, user: Option<&User>) -> AuthorView {
        AuthorView {
            display_name: user.map(|u| u.display_name()),
            ..AuthorView::with_badges(id, user)
        }
    }

    /// `id fullName displayName avatar`
    pub fn public(id: UserId, user: Option<&User>) -> AuthorView {
        AuthorView {
            display_name: user.map(|u| u.display_name()),
            ..AuthorView::base(id, user)
        }
    }

    /// `id fullName avatar`
    pub fn brief(id: UserId, user: Option<&User>) -> AuthorView {
        AuthorView::base(id, user)
    }

    /// `id fullName avatar staff status`
    pub fn with_badges(id: UserId, user: Option<&User>) -> AuthorView {
        AuthorView {
            staff: user.map(|u| u.staff),
            status: user.and_then(|u| u.status.clone()),
            ..AuthorView::base(id, user)
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ReplyCount {
    pub length: usize,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum RepliesView {
    Count(ReplyCount),
    List(Vec<Reply>),
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentView {
    pub id: CommentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub text: String,
    pub created_at: Time,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<Time>,
    pub context: Context,
    pub reference: String,
    pub author: AuthorView,
    pub flags: Vec<Flag>,
    pub upvotes: usize,
    pub downvotes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub votes: Option<Vec<Vote>>,
    pub replies: RepliesView,
}

impl CommentView {
    fn project(c: &Comment, author: AuthorView) -> CommentView {
        CommentView {
            id: c.id,
            alias: c.alias.clone(),
            text: c.text.clone(),
            created_at: c.created_at,
            edited_at: c.edited_at,
            context: c.context,
            reference: c.reference.clone(),
            author,
            flags: c.flags.clone(),
            upvotes: c.upvotes(),
            downvotes: c.downvotes(),
            votes: Some(c.votes.clone()),
            replies: RepliesView::Count(ReplyCount {
                length: c.replies.len(),
            }),
        }
    }

    /// Projection used by listings and single-comment fetches
    pub fn listed(c: &Comment, author: Option<&User>) -> CommentView {
        CommentView::project(c, AuthorView::full(c.author, author))
    }

    /// Listing projection without the author's staff and status badges
    pub fn side(c: &Comment, author: Option<&User>) -> CommentView {
        CommentView::project(c, AuthorView::public(c.author, author))
    }

    pub fn created(c: &Comment, author: Option<&User>) -> CommentView {
        CommentView {
            edited_at: None,
            votes: None,
            replies: RepliesView::List(c.replies.clone()),
            ..CommentView::project(c, AuthorView::full(c.author, author))
        }
    }

    pub fn edited(c: &Comment, author: Option<&User>) -> CommentView {
        CommentView {
            votes: None,
            replies: RepliesView::List(c.replies.clone()),
            ..CommentView::project(c, AuthorView::brief(c.author, author))
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyView {
    pub id: ReplyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub created_at: Time,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<Time>,
    pub text: String,
    pub author: AuthorView,
}

impl ReplyView {
    pub fn new(r: &Reply, author: Option<&User>) -> ReplyView {
        ReplyView {
            id: r.id,
            alias: r.alias.clone(),
            created_at: r.created_at,
            edited_at: r.edited_at,
            text: r.text.clone(),
            author: AuthorView::with_badges(r.author, author),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditedReplyView {
    pub id: ReplyId,
    pub text: String,
    pub edited_at: Option<Time>,
}

impl EditedReplyView {
    pub fn new(r: &Reply) -> EditedReplyView {
        EditedReplyView {
            id: r.id,
            text: r.text.clone(),
            edited_at: r.edited_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{now, TopicId, Uuid, VoteValue};

    fn author() -> User {
        User {
            id: UserId(Uuid::new_v4()),
            first_name: String::from("Grace"),
            last_name: String::from("Hopper"),
            email: String::from("grace@example.org"),
            staff: true,
            status: Some(String::from("moderator")),
            avatar: None,
        }
    }

    fn comment(author: &User) -> Comment {
        Comment {
            id: CommentId(Uuid::new_v4()),
            topic_id: TopicId(Uuid::new_v4()),
            author: author.id,
            text: String::from("text"),
            alias: None,
            context: Context::Paragraph,
            reference: String::from("p1"),
            created_at: now(),
            edited_at: None,
            votes: vec![Vote {
                author: UserId(Uuid::new_v4()),
                value: VoteValue::Positive,
                created_at: now(),
            }],
            flags: Vec::new(),
            replies: vec![Reply {
                id: ReplyId(Uuid::new_v4()),
                author: author.id,
                text: String::from("reply"),
                alias: None,
                created_at: now(),
                edited_at: None,
            }],
        }
    }

    fn keys(v: &serde_json::Value) -> Vec<String> {
        let mut keys = v
            .as_object()
            .expect("projection is an object")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    #[test]
    fn listed_projection() {
        let a = author();
        let c = comment(&a);
        let v = serde_json::to_value(CommentView::listed(&c, Some(&a))).unwrap();
        assert_eq!(
            keys(&v),
            vec![
                "author",
                "context",
                "createdAt",
                "downvotes",
                "flags",
                "id",
                "reference",
                "replies",
                "text",
                "upvotes",
                "votes"
            ]
        );
        assert_eq!(v["replies"], json!({ "length": 1 }));
        assert_eq!(v["upvotes"], json!(1));
        assert_eq!(v["context"], json!("paragraph"));
        assert_eq!(
            keys(&v["author"]),
            vec!["displayName", "fullName", "id", "staff", "status"]
        );
    }

    #[test]
    fn side_projection_hides_badges() {
        let a = author();
        let v = serde_json::to_value(CommentView::side(&comment(&a), Some(&a))).unwrap();
        assert_eq!(keys(&v["author"]), vec!["displayName", "fullName", "id"]);
    }

    #[test]
    fn created_and_edited_projections_embed_replies() {
        let a = author();
        let mut c = comment(&a);
        let v = serde_json::to_value(CommentView::created(&c, Some(&a))).unwrap();
        assert!(v.get("votes").is_none());
        assert_eq!(v["replies"].as_array().map(|r| r.len()), Some(1));

        c.edited_at = Some(now());
        let v = serde_json::to_value(CommentView::edited(&c, Some(&a))).unwrap();
        assert!(v.get("editedAt").is_some());
        assert_eq!(keys(&v["author"]), vec!["fullName", "id"]);
    }

    #[test]
    fn reply_projection() {
        let a = author();
        let c = comment(&a);
        let v = serde_json::to_value(ReplyView::new(&c.replies[0], Some(&a))).unwrap();
        assert_eq!(keys(&v), vec!["author", "createdAt", "id", "text"]);
        assert_eq!(v["author"]["staff"], json!(true));
        assert_eq!(v["author"]["status"], json!("moderator"));
    }

    #[test]
    fn unknown_authors_only_expose_their_id() {
        let a = author();
        let v = serde_json::to_value(CommentView::listed(&comment(&a), None)).unwrap();
        assert_eq!(keys(&v["author"]), vec!["id"]);
    }

    #[test]
    fn views_parse_back() {
        let a = author();
        let c = comment(&a);
        let view = CommentView::listed(&c, Some(&a));
        let json = serde_json::to_vec(&view).unwrap();
        assert_eq!(serde_json::from_slice::<CommentView>(&json).unwrap(), view);
    }
}
