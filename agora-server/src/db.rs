use std::collections::HashMap;

use agora_api::{
    AuthToken, Comment, CommentFilter, CommentId, CommentStats, Context as CommentContext, Db,
    DbPool, Flag, NewComment, Reply, ReplyId, Time, TopicId, User, UserId, Uuid, Vote, VoteValue,
};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgRow, Connection, Row};

use crate::query::{self, Bind, COMMENT_COLUMNS};

const USER_COLUMNS: &str = "id, first_name, last_name, email, staff, status, avatar";

fn with_binds(
    query: &str,
    binds: Vec<Bind>,
) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments> {
    let mut q = sqlx::query(query);
    for b in binds {
        q = match b {
            Bind::Uuid(u) => q.bind(u),
            Bind::String(s) => q.bind(s),
            Bind::Int(i) => q.bind(i),
        };
    }
    q
}

#[derive(Clone)]
pub struct PgPool(sqlx::PgPool);

impl PgPool {
    pub fn new(pool: sqlx::PgPool) -> PgPool {
        PgPool(pool)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        crate::MIGRATOR
            .run(&self.0)
            .await
            .context("applying database migrations")
    }

    #[cfg(test)]
    pub fn num_idle(&self) -> usize {
        self.0.num_idle()
    }

    #[cfg(test)]
    pub async fn test_add_user(&self, u: &User) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO users (id, first_name, last_name, email, staff, status, avatar)
                VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(u.id.0)
        .bind(&u.first_name)
        .bind(&u.last_name)
        .bind(&u.email)
        .bind(u.staff)
        .bind(&u.status)
        .bind(&u.avatar)
        .execute(&self.0)
        .await
        .with_context(|| format!("inserting user {}", u.id))?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn test_add_session(&self, user: UserId, token: AuthToken) -> anyhow::Result<()> {
        let now = agora_api::now();
        sqlx::query(
            "INSERT INTO sessions (id, user_id, login_time, last_active) VALUES ($1, $2, $3, $3)",
        )
        .bind(token.0)
        .bind(user.0)
        .bind(now)
        .execute(&self.0)
        .await
        .with_context(|| format!("inserting session for {user}"))?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn test_add_topic(&self, topic: TopicId, forum: Option<&str>) -> anyhow::Result<()> {
        let forum_id = match forum {
            None => None,
            Some(name) => {
                let id = Uuid::new_v4();
                sqlx::query("INSERT INTO forums (id, name) VALUES ($1, $2)")
                    .bind(id)
                    .bind(name)
                    .execute(&self.0)
                    .await
                    .with_context(|| format!("inserting forum {name:?}"))?;
                Some(id)
            }
        };
        sqlx::query("INSERT INTO topics (id, forum_id) VALUES ($1, $2)")
            .bind(topic.0)
            .bind(forum_id)
            .execute(&self.0)
            .await
            .with_context(|| format!("inserting topic {topic}"))?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn test_reset(&self) -> anyhow::Result<()> {
        sqlx::query(include_str!("../reset-test-db.sql"))
            .execute(&self.0)
            .await
            .context("cleaning up database")?;
        Ok(())
    }
}

#[async_trait]
impl DbPool for PgPool {
    async fn acquire(&self) -> anyhow::Result<Box<dyn Db>> {
        Ok(Box::new(PostgresDb {
            conn: self.0.acquire().await.context("acquiring db connection")?,
        }))
    }
}

pub struct PostgresDb {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

fn user_from_row(r: &PgRow) -> anyhow::Result<User> {
    Ok(User {
        id: UserId(r.try_get("id").context("retrieving the id field")?),
        first_name: r
            .try_get("first_name")
            .context("retrieving the first_name field")?,
        last_name: r
            .try_get("last_name")
            .context("retrieving the last_name field")?,
        email: r.try_get("email").context("retrieving the email field")?,
        staff: r.try_get("staff").context("retrieving the staff field")?,
        status: r.try_get("status").context("retrieving the status field")?,
        avatar: r.try_get("avatar").context("retrieving the avatar field")?,
    })
}

fn comment_from_row(r: &PgRow) -> anyhow::Result<Comment> {
    let context: String = r.try_get("context").context("retrieving the context field")?;
    Ok(Comment {
        id: CommentId(r.try_get("id").context("retrieving the id field")?),
        topic_id: TopicId(
            r.try_get("topic_id")
                .context("retrieving the topic_id field")?,
        ),
        author: UserId(
            r.try_get("author_id")
                .context("retrieving the author_id field")?,
        ),
        text: r.try_get("text").context("retrieving the text field")?,
        alias: r.try_get("alias").context("retrieving the alias field")?,
        context: context
            .parse::<CommentContext>()
            .with_context(|| format!("parsing comment context {context:?}"))?,
        reference: r
            .try_get("reference")
            .context("retrieving the reference field")?,
        created_at: r
            .try_get("created_at")
            .context("retrieving the created_at field")?,
        edited_at: r
            .try_get("edited_at")
            .context("retrieving the edited_at field")?,
        votes: Vec::new(),
        flags: Vec::new(),
        replies: Vec::new(),
    })
}

/// Loads the votes, flags and replies of the comments in `rows`, keeping their order
async fn load_comments(
    conn: &mut sqlx::PgConnection,
    rows: Vec<PgRow>,
) -> anyhow::Result<Vec<Comment>> {
    let mut comments = rows
        .iter()
        .map(comment_from_row)
        .collect::<anyhow::Result<Vec<Comment>>>()?;
    if comments.is_empty() {
        return Ok(comments);
    }
    let ids = comments.iter().map(|c| c.id.0).collect::<Vec<Uuid>>();
    let positions = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect::<HashMap<Uuid, usize>>();
    let position = |r: &PgRow| -> anyhow::Result<usize> {
        let id: Uuid = r
            .try_get("comment_id")
            .context("retrieving the comment_id field")?;
        positions
            .get(&id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("got row for unrequested comment {id}"))
    };

    let votes = sqlx::query(
        "
            SELECT comment_id, user_id, value, created_at
                FROM comment_votes
            WHERE comment_id = ANY($1)
            ORDER BY created_at, user_id
        ",
    )
    .bind(ids.clone())
    .fetch_all(&mut *conn)
    .await
    .context("querying comment_votes table")?;
    for v in votes {
        let weight: i16 = v.try_get("value").context("retrieving the value field")?;
        comments[position(&v)?].votes.push(Vote {
            author: UserId(v.try_get("user_id").context("retrieving the user_id field")?),
            value: VoteValue::from_weight(weight)
                .ok_or_else(|| anyhow::anyhow!("invalid vote weight {weight}"))?,
            created_at: v
                .try_get("created_at")
                .context("retrieving the created_at field")?,
        });
    }

    let flags = sqlx::query(
        "
            SELECT comment_id, user_id, value, created_at
                FROM comment_flags
            WHERE comment_id = ANY($1)
            ORDER BY created_at, user_id
        ",
    )
    .bind(ids.clone())
    .fetch_all(&mut *conn)
    .await
    .context("querying comment_flags table")?;
    for f in flags {
        comments[position(&f)?].flags.push(Flag {
            author: UserId(f.try_get("user_id").context("retrieving the user_id field")?),
            value: f.try_get("value").context("retrieving the value field")?,
            created_at: f
                .try_get("created_at")
                .context("retrieving the created_at field")?,
        });
    }

    let replies = sqlx::query(
        "
            SELECT id, comment_id, author_id, text, alias, created_at, edited_at
                FROM comment_replies
            WHERE comment_id = ANY($1)
            ORDER BY created_at, id
        ",
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await
    .context("querying comment_replies table")?;
    for r in replies {
        comments[position(&r)?].replies.push(Reply {
            id: ReplyId(r.try_get("id").context("retrieving the id field")?),
            author: UserId(
                r.try_get("author_id")
                    .context("retrieving the author_id field")?,
            ),
            text: r.try_get("text").context("retrieving the text field")?,
            alias: r.try_get("alias").context("retrieving the alias field")?,
            created_at: r
                .try_get("created_at")
                .context("retrieving the created_at field")?,
            edited_at: r
                .try_get("edited_at")
                .context("retrieving the edited_at field")?,
        });
    }

    Ok(comments)
}

#[async_trait]
impl Db for PostgresDb {
    async fn recover_session(&mut self, token: AuthToken) -> anyhow::Result<Option<User>> {
        let user = sqlx::query(
            "
                UPDATE sessions
                    SET last_active = $1
                WHERE id = $2
                RETURNING user_id
            ",
        )
        .bind(agora_api::now())
        .bind(token.0)
        .fetch_optional(&mut *self.conn)
        .await
        .context("recovering session")?;
        let user: Uuid = match user {
            None => return Ok(None),
            Some(r) => r.try_get("user_id").context("retrieving the user_id field")?,
        };
        Ok(self.fetch_users(&[UserId(user)]).await?.remove(&UserId(user)))
    }

    async fn fetch_users(&mut self, ids: &[UserId]) -> anyhow::Result<HashMap<UserId, User>> {
        let ids = ids.iter().map(|u| u.0).collect::<Vec<Uuid>>();
        sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&mut *self.conn)
        .await
        .context("querying users table")?
        .iter()
        .map(|r| user_from_row(r).map(|u| (u.id, u)))
        .collect()
    }

    async fn topic_forum(&mut self, topic: TopicId) -> anyhow::Result<Option<String>> {
        let row = sqlx::query(
            "
                SELECT f.name
                    FROM topics t
                LEFT JOIN forums f
                    ON f.id = t.forum_id
                WHERE t.id = $1
            ",
        )
        .bind(topic.0)
        .fetch_optional(&mut *self.conn)
        .await
        .with_context(|| format!("fetching forum of topic {topic}"))?;
        Ok(match row {
            None => None,
            Some(r) => r
                .try_get::<Option<String>, _>("name")
                .context("retrieving the name field")?,
        })
    }

    async fn list_comments(&mut self, filter: &CommentFilter) -> anyhow::Result<Vec<Comment>> {
        let query::Sql { query, binds } = query::list_comments(filter);
        let rows = with_binds(&query, binds)
            .fetch_all(&mut *self.conn)
            .await
            .context("querying comments table")?;
        load_comments(&mut *self.conn, rows).await
    }

    async fn count_comments(&mut self, filter: &CommentFilter) -> anyhow::Result<u64> {
        let query::Sql { query, binds } = query::count_comments(filter);
        let r = with_binds(&query, binds)
            .fetch_one(&mut *self.conn)
            .await
            .context("counting comments")?;
        let count: i64 = r.try_get("count").context("retrieving the count field")?;
        u64::try_from(count).context("negative comment count")
    }

    async fn fetch_comment(&mut self, id: CommentId) -> anyhow::Result<Option<Comment>> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMENT_COLUMNS} FROM comments WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_all(&mut *self.conn)
        .await
        .with_context(|| format!("querying comment {id}"))?;
        Ok(load_comments(&mut *self.conn, rows).await?.pop())
    }

    async fn create_comment(&mut self, c: NewComment) -> anyhow::Result<Comment> {
        let res = sqlx::query(
            "
                INSERT INTO comments
                    (id, topic_id, author_id, text, alias, context, reference, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(c.id.0)
        .bind(c.topic_id.0)
        .bind(c.author.0)
        .bind(&c.text)
        .bind(&c.alias)
        .bind(c.context.as_str())
        .bind(&c.reference)
        .bind(c.created_at)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("inserting comment {}", c.id))?;
        anyhow::ensure!(
            res.rows_affected() == 1,
            "insertion of comment {} affected {} rows",
            c.id,
            res.rows_affected()
        );
        Ok(c.into_comment())
    }

    async fn edit_comment(&mut self, id: CommentId, text: &str, at: Time) -> anyhow::Result<()> {
        let res = sqlx::query("UPDATE comments SET text = $1, edited_at = $2 WHERE id = $3")
            .bind(text)
            .bind(at)
            .bind(id.0)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("updating comment {id}"))?;
        anyhow::ensure!(
            res.rows_affected() == 1,
            "update of comment {id} affected {} rows",
            res.rows_affected()
        );
        Ok(())
    }

    async fn remove_comment(&mut self, id: CommentId) -> anyhow::Result<()> {
        let res = sqlx::query("DELETE FROM comments WHERE id = $1")
            .bind(id.0)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("removing comment {id}"))?;
        anyhow::ensure!(
            res.rows_affected() == 1,
            "removal of comment {id} affected {} rows",
            res.rows_affected()
        );
        Ok(())
    }

    async fn set_vote(
        &mut self,
        comment: CommentId,
        user: UserId,
        vote: Option<&Vote>,
    ) -> anyhow::Result<bool> {
        let mut tx = self
            .conn
            .begin()
            .await
            .context("starting vote transaction")?;
        let res = match vote {
            None => sqlx::query("DELETE FROM comment_votes WHERE comment_id = $1 AND user_id = $2")
                .bind(comment.0)
                .bind(user.0)
                .execute(&mut tx)
                .await
                .with_context(|| format!("removing vote of {user} on {comment}"))?,
            Some(v) => sqlx::query(
                "
                    INSERT INTO comment_votes (comment_id, user_id, value, created_at)
                        VALUES ($1, $2, $3, $4)
                    ON CONFLICT (comment_id, user_id) DO UPDATE
                        SET value = EXCLUDED.value, created_at = EXCLUDED.created_at
                        WHERE comment_votes.value <> EXCLUDED.value
                ",
            )
            .bind(comment.0)
            .bind(v.author.0)
            .bind(v.value.weight())
            .bind(v.created_at)
            .execute(&mut tx)
            .await
            .with_context(|| format!("recording vote of {user} on {comment}"))?,
        };
        if res.rows_affected() == 0 {
            return Ok(false);
        }
        let res = sqlx::query(
            "
                UPDATE comments
                    SET score = (
                        SELECT COALESCE(SUM(value), 0)
                            FROM comment_votes
                        WHERE comment_id = $1
                    )
                WHERE id = $1
            ",
        )
        .bind(comment.0)
        .execute(&mut tx)
        .await
        .with_context(|| format!("updating score of {comment}"))?;
        anyhow::ensure!(
            res.rows_affected() == 1,
            "score update of comment {comment} affected {} rows",
            res.rows_affected()
        );
        tx.commit().await.context("committing vote transaction")?;
        Ok(true)
    }

    async fn set_flag(
        &mut self,
        comment: CommentId,
        user: UserId,
        flag: Option<&Flag>,
    ) -> anyhow::Result<bool> {
        let res = match flag {
            None => sqlx::query("DELETE FROM comment_flags WHERE comment_id = $1 AND user_id = $2")
                .bind(comment.0)
                .bind(user.0)
                .execute(&mut *self.conn)
                .await
                .with_context(|| format!("removing flag of {user} on {comment}"))?,
            Some(f) => sqlx::query(
                "
                    INSERT INTO comment_flags (comment_id, user_id, value, created_at)
                        VALUES ($1, $2, $3, $4)
                    ON CONFLICT (comment_id, user_id) DO NOTHING
                ",
            )
            .bind(comment.0)
            .bind(f.author.0)
            .bind(&f.value)
            .bind(f.created_at)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("recording flag of {user} on {comment}"))?,
        };
        Ok(res.rows_affected() != 0)
    }

    async fn add_reply(&mut self, comment: CommentId, reply: &Reply) -> anyhow::Result<()> {
        let res = sqlx::query(
            "
                INSERT INTO comment_replies
                    (id, comment_id, author_id, text, alias, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(reply.id.0)
        .bind(comment.0)
        .bind(reply.author.0)
        .bind(&reply.text)
        .bind(&reply.alias)
        .bind(reply.created_at)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("inserting reply {} to {comment}", reply.id))?;
        anyhow::ensure!(
            res.rows_affected() == 1,
            "insertion of reply {} affected {} rows",
            reply.id,
            res.rows_affected()
        );
        Ok(())
    }

    async fn edit_reply(
        &mut self,
        comment: CommentId,
        reply: ReplyId,
        text: &str,
        at: Time,
    ) -> anyhow::Result<()> {
        let res = sqlx::query(
            "UPDATE comment_replies SET text = $1, edited_at = $2 WHERE id = $3 AND comment_id = $4",
        )
        .bind(text)
        .bind(at)
        .bind(reply.0)
        .bind(comment.0)
        .execute(&mut *self.conn)
        .await
        .with_context(|| format!("updating reply {reply} of {comment}"))?;
        anyhow::ensure!(
            res.rows_affected() == 1,
            "update of reply {reply} affected {} rows",
            res.rows_affected()
        );
        Ok(())
    }

    async fn remove_reply(&mut self, comment: CommentId, reply: ReplyId) -> anyhow::Result<()> {
        let res = sqlx::query("DELETE FROM comment_replies WHERE id = $1 AND comment_id = $2")
            .bind(reply.0)
            .bind(comment.0)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("removing reply {reply} of {comment}"))?;
        anyhow::ensure!(
            res.rows_affected() == 1,
            "removal of reply {reply} affected {} rows",
            res.rows_affected()
        );
        Ok(())
    }

    async fn stats(&mut self) -> anyhow::Result<CommentStats> {
        let r = sqlx::query(
            "
                SELECT
                    (SELECT COUNT(*) FROM comment_votes) AS ratings,
                    (SELECT COUNT(*) FROM comment_replies) AS replies
            ",
        )
        .fetch_one(&mut *self.conn)
        .await
        .context("counting votes and replies")?;
        let ratings: i64 = r.try_get("ratings").context("retrieving the ratings field")?;
        let replies: i64 = r.try_get("replies").context("retrieving the replies field")?;
        Ok(CommentStats {
            ratings: u64::try_from(ratings).context("negative vote count")?,
            replies: u64::try_from(replies).context("negative reply count")?,
        })
    }
}
