use std::collections::HashMap;

use agora_api::{
    now, validate_string, validate_text, AuthorFilter, Comment, CommentFilter, CommentId,
    CommentStats, CommentView, Context as CommentContext, Db, EditedReplyView,
    Error as ApiError, Flag, NewComment, Notification, NotificationEvent, Notifier, Paging, Reply,
    ReplyId, ReplyView, SortOrder, TopicId, User, UserId, Uuid, Vote, VoteValue, SPAM,
};
use anyhow::Context;
use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::json;

use crate::{extractors::*, notify, Error, Links};

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    topic_id: Option<String>,
    sort: Option<String>,
    page: Option<String>,
    limit: Option<String>,
    context: Option<String>,
    exclude_author: Option<String>,
    count: Option<String>,
}

impl ListParams {
    fn topic_id(&self) -> Result<TopicId, Error> {
        let id = self.topic_id.as_deref().ok_or(Error::missing_topic_id())?;
        Ok(TopicId::parse(id)?)
    }

    fn paging(&self) -> Result<Paging, Error> {
        Ok(Paging {
            page: parse_number(self.page.as_deref())?,
            limit: parse_number(self.limit.as_deref())?,
        })
    }

    fn wants_count(&self) -> bool {
        !matches!(self.count.as_deref(), None | Some(""))
    }
}

fn parse_number(n: Option<&str>) -> Result<u64, Error> {
    match n {
        None => Ok(0),
        Some(n) => n
            .parse()
            .map_err(|_| Error::Api(ApiError::InvalidNumber(String::from(n)))),
    }
}

#[derive(serde::Serialize)]
#[serde(untagged)]
pub enum Listing {
    Comments(Vec<CommentView>),
    Count(u64),
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCommentBody {
    text: Option<String>,
    context: Option<String>,
    reference: Option<String>,
    alias: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
pub struct ReplyBody {
    text: Option<String>,
    alias: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
pub struct TextBody {
    text: Option<String>,
}

fn validate_alias(alias: Option<String>) -> Result<Option<String>, Error> {
    if let Some(a) = &alias {
        validate_string(a)?;
    }
    Ok(alias)
}

async fn load_comment(conn: &mut dyn Db, id: &str) -> Result<Comment, Error> {
    let id = CommentId::parse(id)?;
    conn.fetch_comment(id)
        .await
        .with_context(|| format!("fetching comment {id}"))?
        .ok_or(Error::comment_not_found(id))
}

async fn fetch_users(
    conn: &mut dyn Db,
    mut ids: Vec<UserId>,
) -> Result<HashMap<UserId, User>, Error> {
    ids.sort_unstable();
    ids.dedup();
    Ok(conn
        .fetch_users(&ids)
        .await
        .with_context(|| format!("fetching users {ids:?}"))?)
}

async fn authors_of(
    conn: &mut dyn Db,
    comments: &[Comment],
) -> Result<HashMap<UserId, User>, Error> {
    fetch_users(conn, comments.iter().map(|c| c.author).collect()).await
}

async fn list(conn: &mut dyn Db, filter: &CommentFilter) -> Result<Vec<Comment>, Error> {
    Ok(conn
        .list_comments(filter)
        .await
        .with_context(|| format!("listing comments for {filter:?}"))?)
}

pub async fn list_all(
    mut conn: DbConn,
    QueryParams(params): QueryParams<ListParams>,
) -> Result<Json<Listing>, Error> {
    let mut filter = CommentFilter::for_topic(params.topic_id()?);
    filter.sort = SortOrder::from_query(params.sort.as_deref());
    filter.context = Some(match params.context.as_deref() {
        Some(c) => c.parse()?,
        None => CommentContext::Topic,
    });
    if let Some(u) = params.exclude_author.as_deref() {
        filter.author = Some(AuthorFilter::IsNot(UserId::parse(u)?));
    }
    filter.paging = params.paging()?;
    if params.wants_count() {
        let count = conn
            .count_comments(&filter)
            .await
            .with_context(|| format!("counting comments for {filter:?}"))?;
        return Ok(Json(Listing::Count(count)));
    }
    let comments = list(&mut *conn, &filter).await?;
    let users = authors_of(&mut *conn, &comments).await?;
    Ok(Json(Listing::Comments(
        comments
            .iter()
            .map(|c| CommentView::listed(c, users.get(&c.author)))
            .collect(),
    )))
}

pub async fn list_mine(
    Auth(user): Auth,
    mut conn: DbConn,
    QueryParams(params): QueryParams<ListParams>,
) -> Result<Json<Vec<CommentView>>, Error> {
    let mut filter = CommentFilter::for_topic(params.topic_id()?);
    filter.author = Some(AuthorFilter::Is(user.id));
    let comments = list(&mut *conn, &filter).await?;
    Ok(Json(
        comments
            .iter()
            .map(|c| CommentView::listed(c, Some(&user)))
            .collect(),
    ))
}

pub async fn list_side(
    mut conn: DbConn,
    QueryParams(params): QueryParams<ListParams>,
) -> Result<Json<Vec<CommentView>>, Error> {
    let mut filter = CommentFilter::for_topic(params.topic_id()?);
    filter.context = Some(CommentContext::Paragraph);
    let comments = list(&mut *conn, &filter).await?;
    let users = authors_of(&mut *conn, &comments).await?;
    Ok(Json(
        comments
            .iter()
            .map(|c| CommentView::side(c, users.get(&c.author)))
            .collect(),
    ))
}

pub async fn stats(mut conn: DbConn) -> Result<Json<CommentStats>, Error> {
    Ok(Json(conn.stats().await.context("computing comment stats")?))
}

pub async fn fetch(mut conn: DbConn, Path(id): Path<String>) -> Result<Json<CommentView>, Error> {
    let c = load_comment(&mut *conn, &id).await?;
    let users = fetch_users(&mut *conn, vec![c.author]).await?;
    Ok(Json(CommentView::listed(&c, users.get(&c.author))))
}

pub async fn create(
    Auth(user): Auth,
    mut conn: DbConn,
    QueryParams(params): QueryParams<ListParams>,
    JsonBody(body): JsonBody<NewCommentBody>,
) -> Result<Json<CommentView>, Error> {
    let topic_id = params.topic_id()?;
    let text = validate_text(body.text)?;
    let context = match body.context.as_deref() {
        Some(c) => c.parse()?,
        None => CommentContext::Topic,
    };
    let reference = match body.reference {
        Some(r) => {
            validate_string(&r)?;
            r
        }
        None => topic_id.to_string(),
    };
    let new = NewComment {
        id: CommentId(Uuid::new_v4()),
        topic_id,
        author: user.id,
        text,
        alias: validate_alias(body.alias)?,
        context,
        reference,
        created_at: now(),
    };
    let c = conn
        .create_comment(new)
        .await
        .with_context(|| format!("creating comment on topic {topic_id} for {}", user.id))?;
    tracing::info!(comment = %c.id, topic = %topic_id, author = %user.id, "created comment");
    Ok(Json(CommentView::created(&c, Some(&user))))
}

pub async fn reply(
    Auth(user): Auth,
    State(notifier): State<NotifierHandle>,
    State(links): State<Links>,
    mut conn: DbConn,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<ReplyBody>,
) -> Result<Json<ReplyView>, Error> {
    let c = load_comment(&mut *conn, &id).await?;
    let reply = Reply {
        id: ReplyId(Uuid::new_v4()),
        author: user.id,
        text: validate_text(body.text)?,
        alias: validate_alias(body.alias)?,
        created_at: now(),
        edited_at: None,
    };
    conn.add_reply(c.id, &reply)
        .await
        .with_context(|| format!("adding reply to comment {}", c.id))?;
    tracing::info!(comment = %c.id, reply = %reply.id, author = %user.id, "added reply");

    if c.author != user.id {
        let n = reply_notification(&mut *conn, &links, &c, &reply).await;
        deliver(&*notifier, n).await;
    }

    Ok(Json(ReplyView::new(&reply, Some(&user))))
}

/// E-mail of the comment's author, `None` if they no longer exist
async fn author_email(conn: &mut dyn Db, c: &Comment) -> anyhow::Result<Option<String>> {
    let mut users = conn
        .fetch_users(&[c.author])
        .await
        .with_context(|| format!("fetching author of comment {}", c.id))?;
    let email = users.remove(&c.author).map(|u| u.email);
    if email.is_none() {
        tracing::warn!(comment = %c.id, author = %c.author, "comment author does not exist");
    }
    Ok(email)
}

async fn reply_notification(
    conn: &mut dyn Db,
    links: &Links,
    c: &Comment,
    reply: &Reply,
) -> anyhow::Result<Option<Notification>> {
    let Some(to) = author_email(conn, c).await? else {
        return Ok(None);
    };
    let forum = conn
        .topic_forum(c.topic_id)
        .await
        .with_context(|| format!("fetching forum of topic {}", c.topic_id))?;
    Ok(Some(Notification {
        event: NotificationEvent::CommentReply,
        to,
        data: json!({
            "reply": {
                "id": reply.id,
                "author": { "id": reply.author },
                "text": reply.text,
            },
            "comment": {
                "id": c.id,
                "author": { "id": c.author },
            },
            "url": links.topic_url(forum.as_deref(), c.topic_id),
        }),
    }))
}

async fn vote_notification(
    conn: &mut dyn Db,
    c: &Comment,
    voter: &User,
    value: VoteValue,
) -> anyhow::Result<Option<Notification>> {
    let Some(to) = author_email(conn, c).await? else {
        return Ok(None);
    };
    Ok(Some(Notification {
        event: NotificationEvent::for_vote(value),
        to,
        data: json!({
            "comment": {
                "id": c.id,
                "text": c.text,
                "author": { "id": c.author },
            },
            "user": {
                "id": voter.id,
                "fullName": voter.full_name(),
            },
        }),
    }))
}

/// Sends a notification once the change it reports is stored, never failing the request
async fn deliver(notifier: &dyn Notifier, n: anyhow::Result<Option<Notification>>) {
    match n {
        Ok(Some(n)) => notify::send(notifier, n).await,
        Ok(None) => (),
        Err(err) => tracing::error!(?err, "failed preparing notification"),
    }
}

pub async fn replies(
    mut conn: DbConn,
    Path(id): Path<String>,
) -> Result<Json<Vec<ReplyView>>, Error> {
    let c = load_comment(&mut *conn, &id).await?;
    let users = fetch_users(&mut *conn, c.replies.iter().map(|r| r.author).collect()).await?;
    Ok(Json(
        c.replies
            .iter()
            .map(|r| ReplyView::new(r, users.get(&r.author)))
            .collect(),
    ))
}

async fn cast_vote(
    user: &User,
    notifier: &dyn Notifier,
    conn: &mut dyn Db,
    id: &str,
    value: VoteValue,
) -> Result<(), Error> {
    let mut c = load_comment(conn, id).await?;
    let at = now();
    if !c.vote(user.id, value, at)? {
        tracing::debug!(comment = %c.id, user = %user.id, ?value, "vote unchanged");
        return Ok(());
    }
    let vote = Vote {
        author: user.id,
        value,
        created_at: at,
    };
    let changed = conn
        .set_vote(c.id, user.id, Some(&vote))
        .await
        .with_context(|| format!("recording {value:?} vote of {} on {}", user.id, c.id))?;
    if !changed {
        tracing::debug!(comment = %c.id, user = %user.id, ?value, "vote already recorded");
        return Ok(());
    }
    tracing::info!(comment = %c.id, user = %user.id, ?value, "vote cast");
    let n = vote_notification(conn, &c, user, value).await;
    deliver(notifier, n).await;
    Ok(())
}

pub async fn upvote(
    Auth(user): Auth,
    State(notifier): State<NotifierHandle>,
    mut conn: DbConn,
    Path(id): Path<String>,
) -> Result<(), Error> {
    cast_vote(&user, &*notifier, &mut *conn, &id, VoteValue::Positive).await
}

pub async fn downvote(
    Auth(user): Auth,
    State(notifier): State<NotifierHandle>,
    mut conn: DbConn,
    Path(id): Path<String>,
) -> Result<(), Error> {
    cast_vote(&user, &*notifier, &mut *conn, &id, VoteValue::Negative).await
}

pub async fn unvote(
    Auth(user): Auth,
    mut conn: DbConn,
    Path(id): Path<String>,
) -> Result<(), Error> {
    let mut c = load_comment(&mut *conn, &id).await?;
    if c.unvote(user.id)
        && conn
            .set_vote(c.id, user.id, None)
            .await
            .with_context(|| format!("removing vote of {} on {}", user.id, c.id))?
    {
        tracing::info!(comment = %c.id, user = %user.id, "vote removed");
    }
    Ok(())
}

pub async fn flag(
    Auth(user): Auth,
    mut conn: DbConn,
    Path(id): Path<String>,
) -> Result<(), Error> {
    let mut c = load_comment(&mut *conn, &id).await?;
    let at = now();
    if c.flag(user.id, at)? {
        let flag = Flag {
            author: user.id,
            value: String::from(SPAM),
            created_at: at,
        };
        if conn
            .set_flag(c.id, user.id, Some(&flag))
            .await
            .with_context(|| format!("recording flag of {} on {}", user.id, c.id))?
        {
            tracing::info!(comment = %c.id, user = %user.id, "comment flagged");
        }
    }
    Ok(())
}

pub async fn unflag(
    Auth(user): Auth,
    mut conn: DbConn,
    Path(id): Path<String>,
) -> Result<(), Error> {
    let mut c = load_comment(&mut *conn, &id).await?;
    if c.unflag(user.id)
        && conn
            .set_flag(c.id, user.id, None)
            .await
            .with_context(|| format!("removing flag of {} on {}", user.id, c.id))?
    {
        tracing::info!(comment = %c.id, user = %user.id, "comment unflagged");
    }
    Ok(())
}

pub async fn edit(
    Auth(user): Auth,
    mut conn: DbConn,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<TextBody>,
) -> Result<Json<CommentView>, Error> {
    let mut c = load_comment(&mut *conn, &id).await?;
    c.check_editable_by(&user)?;
    let text = validate_text(body.text)?;
    let at = now();
    conn.edit_comment(c.id, &text, at)
        .await
        .with_context(|| format!("editing comment {}", c.id))?;
    c.text = text;
    c.edited_at = Some(at);
    Ok(Json(CommentView::edited(&c, Some(&user))))
}

pub async fn edit_reply(
    Auth(user): Auth,
    mut conn: DbConn,
    Path((id, reply_id)): Path<(String, String)>,
    JsonBody(body): JsonBody<TextBody>,
) -> Result<Json<EditedReplyView>, Error> {
    let mut c = load_comment(&mut *conn, &id).await?;
    let comment_id = c.id;
    let reply_id = ReplyId::parse(&reply_id)?;
    let r = c.reply_mut(reply_id)?;
    r.check_editable_by(&user)?;
    let text = validate_text(body.text)?;
    let at = now();
    conn.edit_reply(comment_id, reply_id, &text, at)
        .await
        .with_context(|| format!("editing reply {reply_id} of {comment_id}"))?;
    r.text = text;
    r.edited_at = Some(at);
    Ok(Json(EditedReplyView::new(r)))
}

pub async fn remove_reply(
    Auth(user): Auth,
    mut conn: DbConn,
    Path((id, reply_id)): Path<(String, String)>,
) -> Result<(), Error> {
    let c = load_comment(&mut *conn, &id).await?;
    let reply_id = ReplyId::parse(&reply_id)?;
    c.reply(reply_id)?.check_removable_by(&user)?;
    conn.remove_reply(c.id, reply_id)
        .await
        .with_context(|| format!("removing reply {reply_id} of {}", c.id))?;
    tracing::info!(comment = %c.id, reply = %reply_id, by = %user.id, "removed reply");
    Ok(())
}

pub async fn remove(
    Auth(user): Auth,
    mut conn: DbConn,
    Path(id): Path<String>,
) -> Result<(), Error> {
    let c = load_comment(&mut *conn, &id).await?;
    c.check_removable_by(&user)?;
    conn.remove_comment(c.id)
        .await
        .with_context(|| format!("removing comment {}", c.id))?;
    tracing::info!(comment = %c.id, by = %user.id, "removed comment");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(count: Option<&str>, page: Option<&str>) -> ListParams {
        ListParams {
            count: count.map(String::from),
            page: page.map(String::from),
            ..ListParams::default()
        }
    }

    #[test]
    fn count_truthiness() {
        assert!(!params(None, None).wants_count());
        assert!(!params(Some(""), None).wants_count());
        assert!(params(Some("0"), None).wants_count());
        assert!(params(Some("false"), None).wants_count());
        assert!(params(Some("true"), None).wants_count());
        assert!(params(Some("1"), None).wants_count());
    }

    #[test]
    fn paging_numbers() {
        assert_eq!(params(None, None).paging().unwrap(), Paging::unlimited());
        assert_eq!(params(None, Some("3")).paging().unwrap().page, 3);
        assert!(matches!(
            params(None, Some("-1")).paging(),
            Err(Error::Api(ApiError::InvalidNumber(n))) if n == "-1"
        ));
    }

    #[test]
    fn topic_id_is_required() {
        assert!(matches!(
            ListParams::default().topic_id(),
            Err(Error::Api(ApiError::MissingTopicId))
        ));
    }
}
