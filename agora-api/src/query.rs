use std::cmp::Ordering;

use crate::{Comment, Context, TopicId, UserId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SortOrder {
    /// `-score`: best rated first
    ScoreDesc,

    /// `-createdAt`: newest first
    CreatedDesc,

    /// `createdAt`: oldest first
    CreatedAsc,
}

impl SortOrder {
    /// Parses a client-provided sort key, anything unknown meaning best rated first
    pub fn from_query(s: Option<&str>) -> SortOrder {
        match s {
            Some("-createdAt") => SortOrder::CreatedDesc,
            Some("createdAt") => SortOrder::CreatedAsc,
            _ => SortOrder::ScoreDesc,
        }
    }

    /// Total order used by every store, ties broken by date then id
    pub fn compare(&self, a: &Comment, b: &Comment) -> Ordering {
        let newest_first = b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id));
        match self {
            SortOrder::ScoreDesc => b.score().cmp(&a.score()).then(newest_first),
            SortOrder::CreatedDesc => newest_first,
            SortOrder::CreatedAsc => a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Paging {
    pub page: u64,

    /// 0 means no limit
    pub limit: u64,
}

impl Paging {
    pub fn unlimited() -> Paging {
        Paging { page: 0, limit: 0 }
    }

    pub fn skip(&self) -> u64 {
        self.page.saturating_mul(self.limit)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthorFilter {
    Is(UserId),
    IsNot(UserId),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommentFilter {
    pub topic_id: TopicId,
    pub author: Option<AuthorFilter>,
    pub context: Option<Context>,
    pub sort: SortOrder,
    pub paging: Paging,
}

impl CommentFilter {
    pub fn for_topic(topic_id: TopicId) -> CommentFilter {
        CommentFilter {
            topic_id,
            author: None,
            context: None,
            sort: SortOrder::CreatedDesc,
            paging: Paging::unlimited(),
        }
    }

    pub fn matches(&self, c: &Comment) -> bool {
        if c.topic_id != self.topic_id {
            return false;
        }
        match self.author {
            Some(AuthorFilter::Is(u)) if c.author != u => return false,
            Some(AuthorFilter::IsNot(u)) if c.author == u => return false,
            _ => (),
        }
        match self.context {
            Some(ctx) => c.context == ctx,
            None => true,
        }
    }

    /// Filters, sorts and pages an in-memory set of comments
    pub fn apply<'a, I>(&self, comments: I) -> Vec<&'a Comment>
    where
        I: IntoIterator<Item = &'a Comment>,
    {
        let mut res = comments
            .into_iter()
            .filter(|c| self.matches(c))
            .collect::<Vec<_>>();
        res.sort_by(|a, b| self.sort.compare(a, b));
        let skip = usize::try_from(self.paging.skip()).unwrap_or(usize::MAX);
        let res = res.into_iter().skip(skip);
        match self.paging.limit {
            0 => res.collect(),
            limit => res
                .take(usize::try_from(limit).unwrap_or(usize::MAX))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{now, CommentId, Uuid, Vote, VoteValue};

    fn comment(topic: TopicId, author: UserId, age_secs: i64, score: i64) -> Comment {
        let votes = (0..score.abs())
            .map(|_| Vote {
                author: UserId(Uuid::new_v4()),
                value: if score > 0 {
                    VoteValue::Positive
                } else {
                    VoteValue::Negative
                },
                created_at: now(),
            })
            .collect();
        Comment {
            id: CommentId(Uuid::new_v4()),
            topic_id: topic,
            author,
            text: format!("{age_secs}/{score}"),
            alias: None,
            context: Context::Topic,
            reference: topic.to_string(),
            created_at: now() - Duration::seconds(age_secs),
            edited_at: None,
            votes,
            flags: Vec::new(),
            replies: Vec::new(),
        }
    }

    #[test]
    fn sort_keys() {
        assert_eq!(SortOrder::from_query(None), SortOrder::ScoreDesc);
        assert_eq!(SortOrder::from_query(Some("score")), SortOrder::ScoreDesc);
        assert_eq!(
            SortOrder::from_query(Some("-createdAt")),
            SortOrder::CreatedDesc
        );
        assert_eq!(
            SortOrder::from_query(Some("createdAt")),
            SortOrder::CreatedAsc
        );
    }

    #[test]
    fn filter_sort_and_page() {
        let topic = TopicId(Uuid::new_v4());
        let alice = UserId(Uuid::new_v4());
        let bob = UserId(Uuid::new_v4());
        let comments = vec![
            comment(topic, alice, 30, 1),
            comment(topic, bob, 20, 3),
            comment(topic, alice, 10, -1),
            comment(TopicId(Uuid::new_v4()), alice, 5, 10),
        ];

        let mut filter = CommentFilter::for_topic(topic);
        filter.sort = SortOrder::ScoreDesc;
        let texts = |f: &CommentFilter| {
            f.apply(&comments)
                .into_iter()
                .map(|c| c.text.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(texts(&filter), vec!["20/3", "30/1", "10/-1"]);

        filter.sort = SortOrder::CreatedAsc;
        assert_eq!(texts(&filter), vec!["30/1", "20/3", "10/-1"]);

        filter.paging = Paging { page: 1, limit: 2 };
        assert_eq!(texts(&filter), vec!["10/-1"]);

        filter.paging = Paging::unlimited();
        filter.author = Some(AuthorFilter::IsNot(alice));
        assert_eq!(texts(&filter), vec!["20/3"]);

        filter.author = Some(AuthorFilter::Is(alice));
        filter.context = Some(Context::Paragraph);
        assert!(texts(&filter).is_empty());
    }
}
