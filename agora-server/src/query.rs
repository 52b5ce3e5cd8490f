use agora_api::{AuthorFilter, CommentFilter, SortOrder, Uuid};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Bind {
    Uuid(Uuid),
    String(String),
    Int(i64),
}

#[derive(Debug, Default)]
pub struct Sql {
    pub query: String,
    pub binds: Vec<Bind>,
}

impl Sql {
    /// Adds a Bind, returning the index that should be used to refer to it
    fn add_bind(&mut self, b: Bind) -> usize {
        self.binds.push(b);
        self.binds.len()
    }
}

pub const COMMENT_COLUMNS: &str =
    "id, topic_id, author_id, text, alias, context, reference, created_at, edited_at";

/// Builds the query listing the comments matching `f`, sorted and paged
pub fn list_comments(f: &CommentFilter) -> Sql {
    select(f, COMMENT_COLUMNS)
}

/// Builds the query counting the rows `list_comments` would return
pub fn count_comments(f: &CommentFilter) -> Sql {
    let mut res = select(f, "id");
    res.query = format!("SELECT COUNT(*) AS count FROM ({}) AS matching", res.query);
    res
}

fn select(f: &CommentFilter, columns: &str) -> Sql {
    let mut res = Sql::default();
    let idx = res.add_bind(Bind::Uuid(f.topic_id.0));
    res.query = format!("SELECT {columns} FROM comments WHERE topic_id = ${idx}");
    match f.author {
        Some(AuthorFilter::Is(u)) => {
            let idx = res.add_bind(Bind::Uuid(u.0));
            res.query.push_str(&format!(" AND author_id = ${idx}"));
        }
        Some(AuthorFilter::IsNot(u)) => {
            let idx = res.add_bind(Bind::Uuid(u.0));
            res.query.push_str(&format!(" AND author_id <> ${idx}"));
        }
        None => (),
    }
    if let Some(ctx) = f.context {
        let idx = res.add_bind(Bind::String(String::from(ctx.as_str())));
        res.query.push_str(&format!(" AND context = ${idx}"));
    }
    res.query.push_str(match f.sort {
        SortOrder::ScoreDesc => " ORDER BY score DESC, created_at DESC, id DESC",
        SortOrder::CreatedDesc => " ORDER BY created_at DESC, id DESC",
        SortOrder::CreatedAsc => " ORDER BY created_at ASC, id ASC",
    });
    if f.paging.limit > 0 {
        let limit = res.add_bind(Bind::Int(to_i64(f.paging.limit)));
        let offset = res.add_bind(Bind::Int(to_i64(f.paging.skip())));
        res.query
            .push_str(&format!(" LIMIT ${limit} OFFSET ${offset}"));
    }
    res
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use agora_api::{Context, Paging, TopicId, UserId};

    use super::*;

    #[test]
    fn plain_topic_listing() {
        let topic = TopicId(Uuid::new_v4());
        let sql = list_comments(&CommentFilter::for_topic(topic));
        assert_eq!(
            sql.query,
            format!(
                "SELECT {COMMENT_COLUMNS} FROM comments WHERE topic_id = $1 ORDER BY created_at DESC, id DESC"
            )
        );
        assert_eq!(sql.binds, vec![Bind::Uuid(topic.0)]);
    }

    #[test]
    fn every_filter_gets_its_own_bind() {
        let topic = TopicId(Uuid::new_v4());
        let user = UserId(Uuid::new_v4());
        let sql = list_comments(&CommentFilter {
            topic_id: topic,
            author: Some(AuthorFilter::IsNot(user)),
            context: Some(Context::Paragraph),
            sort: SortOrder::ScoreDesc,
            paging: Paging { page: 2, limit: 10 },
        });
        assert!(sql.query.contains("author_id <> $2"));
        assert!(sql.query.contains("context = $3"));
        assert!(sql.query.contains("ORDER BY score DESC"));
        assert!(sql.query.ends_with("LIMIT $4 OFFSET $5"));
        assert_eq!(
            sql.binds,
            vec![
                Bind::Uuid(topic.0),
                Bind::Uuid(user.0),
                Bind::String(String::from("paragraph")),
                Bind::Int(10),
                Bind::Int(20),
            ]
        );
    }

    #[test]
    fn counting_keeps_filters_and_paging() {
        let topic = TopicId(Uuid::new_v4());
        let mut f = CommentFilter::for_topic(topic);
        f.context = Some(Context::Topic);
        f.paging = Paging { page: 0, limit: 5 };
        let sql = count_comments(&f);
        assert_eq!(
            sql.query,
            "SELECT COUNT(*) AS count FROM (SELECT id FROM comments WHERE topic_id = $1 AND context = $2 ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4) AS matching"
        );
        assert_eq!(
            sql.binds,
            vec![
                Bind::Uuid(topic.0),
                Bind::String(String::from("topic")),
                Bind::Int(5),
                Bind::Int(0),
            ]
        );
    }

    #[test]
    fn zero_limit_means_no_paging() {
        let mut f = CommentFilter::for_topic(TopicId(Uuid::new_v4()));
        f.paging = Paging { page: 3, limit: 0 };
        let sql = list_comments(&f);
        assert!(!sql.query.contains("LIMIT"));
        assert_eq!(sql.binds.len(), 1);
    }
}
