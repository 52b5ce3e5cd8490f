#![cfg(test)]

use std::{
    cmp,
    collections::HashMap,
    ops::RangeTo,
    panic::AssertUnwindSafe,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use agora_api::{AuthToken, Error as ApiError, Notification, TopicId, UserId, Uuid, VoteValue};
use agora_mock_server::{MockNotifier, MockServer};
use async_recursion::async_recursion;
use bolero::generator::TypeGenerator;
use axum::{
    extract::FromRequestParts,
    http::{self, StatusCode},
    Router,
};
use serde_json::{json, Value};

use crate::{
    extractors::*,
    tests::{run_on_app, user},
    *,
};

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

fn build_pg_cluster(data: &Path) -> Option<postgresfixture::cluster::Cluster> {
    let mut best: Option<(postgresfixture::runtime::Runtime, _)> = None;
    for r in postgresfixture::runtime::Runtime::find_on_path() {
        if let Ok(v) = r.version() {
            let better = match &best {
                Some((_, best_version)) => *best_version < v,
                None => true,
            };
            if better {
                best = Some((r, v));
            }
        }
    }
    let (runtime, _) = best?;
    Some(postgresfixture::cluster::Cluster::new(data, runtime))
}

macro_rules! do_sqlx_test {
    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        fn $name() {
            if std::env::var("RUST_LOG").is_ok() {
                tracing_subscriber::fmt::init();
            }
            let lockfile = tempfile::tempfile().expect("creating tempfile");
            let datadir = tempfile::tempdir().expect("creating tempdir");
            let datadir_path: &Path = datadir.as_ref();
            let cluster = match build_pg_cluster(datadir_path) {
                Some(cluster) => cluster,
                None => {
                    eprintln!("skipping {}: postgresql is not installed in path", stringify!($name));
                    return;
                }
            };
            let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
            let started = AtomicBool::new(false);
            let res = postgresfixture::coordinate::run_and_destroy(&cluster, lockfile.into(), || {
                started.store(true, Ordering::SeqCst);
                cluster.createdb("test_db").expect("creating test_db database");
                let runtime = AssertUnwindSafe(
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed initializing tokio runtime"),
                );
                let pool = AssertUnwindSafe(runtime.block_on(async move {
                    let pool = create_sqlx_pool(
                        &format!("postgresql://?host={}&dbname=test_db", datadir_path),
                        10,
                    )
                    .await
                    .expect("creating sqlx pool");
                    pool.migrate().await.expect("failed applying migrations");
                    pool
                }));
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |v| {
                        let pool = pool.clone();
                        let idle_before = pool.num_idle();
                        let v_str = format!("{v:?}");
                        let idle_after_res: Result<usize, _> = {
                            let pool = pool.clone();
                            std::panic::catch_unwind(AssertUnwindSafe(|| {
                                runtime.block_on(async move {
                                    let () = $fn(pool.clone(), v).await;
                                    let mut idle_after = pool.num_idle();
                                    let wait_release_since = std::time::Instant::now();
                                    while idle_after < idle_before
                                        && wait_release_since.elapsed()
                                            <= std::time::Duration::from_secs(1)
                                    {
                                        tokio::task::yield_now().await;
                                        idle_after = pool.num_idle();
                                    }
                                    idle_after
                                })
                            }))
                        };
                        runtime.block_on(async move {
                            pool.test_reset().await.expect("failed cleaning up database");
                        });
                        match idle_after_res {
                            Err(e) => std::panic::resume_unwind(e),
                            Ok(idle_after) => assert!(
                                idle_after >= idle_before,
                                "test {} held onto pool after exiting test: before there were {idle_before} connections, and after there were {idle_after} with value {v_str}",
                                stringify!($name)
                            ),
                        }
                    });
            });
            match res {
                Ok(()) => (),
                // eg. a postgresql version postgresfixture does not know how to drive
                Err(e) if !started.load(Ordering::SeqCst) => {
                    eprintln!("skipping {}: cannot start postgresql: {e}", stringify!($name));
                }
                Err(e) => panic!("shutting down the pg cluster: {e}"),
            }
        }
    };
}

do_tokio_test!(fuzz_preauth_extractor, String, |token| async move {
    if let Ok(req) = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::AUTHORIZATION, token)
        .body(())
    {
        let mut req = req.into_parts().0;
        let res = PreAuth::from_request_parts(&mut req, &()).await;
        match res {
            Ok(_) => (),
            Err(Error::Api(ApiError::PermissionDenied)) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

#[derive(Clone, Debug, TypeGenerator)]
enum FuzzOp {
    Create {
        uid: usize,
        topic: usize,
        paragraph: bool,
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        text: String,
    },
    Reply {
        uid: usize,
        cid: usize,
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        text: String,
    },
    Vote {
        uid: usize,
        cid: usize,
        value: VoteValue,
    },
    Unvote {
        uid: usize,
        cid: usize,
    },
    Flag {
        uid: usize,
        cid: usize,
    },
    Unflag {
        uid: usize,
        cid: usize,
    },
    Edit {
        uid: usize,
        cid: usize,
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        text: String,
    },
    EditReply {
        uid: usize,
        cid: usize,
        rid: usize,
        #[generator(bolero::generator::gen_with::<String>().len(0..20usize))]
        text: String,
    },
    RemoveReply {
        uid: usize,
        cid: usize,
        rid: usize,
    },
    Remove {
        uid: usize,
        cid: usize,
    },
    List {
        topic: usize,
        sort: u8,
        page: u8,
        limit: u8,
        paragraph: bool,
        exclude: Option<usize>,
        count: bool,
    },
    Mine {
        uid: usize,
        topic: usize,
    },
    Side {
        topic: usize,
    },
    Fetch {
        cid: usize,
    },
    Replies {
        cid: usize,
    },
    Stats,
}

fn resize_int(fuzz_id: usize, RangeTo { end }: RangeTo<usize>) -> Option<usize> {
    if end == 0 {
        return None;
    }
    let bucket_size = cmp::max(1, usize::MAX / end); // in case we rounded to 0
    let id = fuzz_id / bucket_size;
    Some(cmp::min(id, end - 1)) // in case id was actually over end - 1 due to rounding
}

/// Replaces store-generated ids by their position, and timestamps by `true`
fn normalize(v: Value, ids: &HashMap<String, String>) -> Value {
    match v {
        Value::String(s) => Value::String(ids.get(&s).cloned().unwrap_or(s)),
        Value::Array(a) => Value::Array(a.into_iter().map(|v| normalize(v, ids)).collect()),
        Value::Object(o) => Value::Object(
            o.into_iter()
                .map(|(k, v)| match k.as_str() {
                    "createdAt" | "editedAt" => (k, Value::Bool(true)),
                    _ => (k, normalize(v, ids)),
                })
                .collect(),
        ),
        v => v,
    }
}

fn id_of(body: &Value) -> String {
    String::from(body["id"].as_str().expect("successful creation returns an id"))
}

/// Same comment as known by the app and the mock
struct TrackedComment {
    app: String,
    mock: String,
    replies: Vec<(String, String)>,
}

struct Target {
    app: Router,
    notifier: MockNotifier,
}

type Outcome = (StatusCode, Value);

struct ComparativeFuzzer {
    app: Target,
    mock: Target,
    users: Vec<UserId>,
    sessions: Vec<(AuthToken, AuthToken)>,
    topics: Vec<TopicId>,
    comments: Vec<TrackedComment>,
}

fn links() -> Links {
    Links {
        public_url: String::from("https://agora.test"),
    }
}

impl ComparativeFuzzer {
    async fn new(pool: PgPool) -> ComparativeFuzzer {
        let db = MockServer::new();
        let topics = vec![TopicId(Uuid::new_v4()), TopicId(Uuid::new_v4())];
        pool.test_add_topic(topics[0], Some("agora"))
            .await
            .expect("adding topic");
        db.test_add_topic(topics[0], Some(String::from("agora"))).await;
        pool.test_add_topic(topics[1], None)
            .await
            .expect("adding topic");
        db.test_add_topic(topics[1], None).await;

        let mut users = Vec::new();
        let mut sessions = Vec::new();
        for u in [
            user("Ada", "Admin", true),
            user("Bea", "Author", false),
            user("Cid", "Critic", false),
        ] {
            pool.test_add_user(&u).await.expect("adding user");
            db.test_add_user(u.clone()).await;
            let app_tok = AuthToken(Uuid::new_v4());
            pool.test_add_session(u.id, app_tok)
                .await
                .expect("adding session");
            sessions.push((app_tok, db.test_add_session(u.id).await));
            users.push(u.id);
        }

        let app_notifier = MockNotifier::new();
        let mock_notifier = MockNotifier::new();
        ComparativeFuzzer {
            app: Target {
                app: app(Arc::new(pool), Arc::new(app_notifier.clone()), links()),
                notifier: app_notifier,
            },
            mock: Target {
                app: app(Arc::new(db), Arc::new(mock_notifier.clone()), links()),
                notifier: mock_notifier,
            },
            users,
            sessions,
            topics,
            comments: Vec::new(),
        }
    }

    fn ids(&self, on_app: bool) -> HashMap<String, String> {
        let mut res = HashMap::new();
        for (i, c) in self.comments.iter().enumerate() {
            let id = if on_app { &c.app } else { &c.mock };
            res.insert(id.clone(), format!("comment-{i}"));
            for (j, (app, mock)) in c.replies.iter().enumerate() {
                let id = if on_app { app } else { mock };
                res.insert(id.clone(), format!("reply-{i}-{j}"));
            }
        }
        res
    }

    /// Runs the request on both sides, `uri` building the path from each side's comment and reply ids
    async fn exec<F>(
        &mut self,
        method: &str,
        uri: F,
        uid: Option<usize>,
        body: Option<Value>,
    ) -> (Outcome, Outcome)
    where
        F: Fn(&dyn Fn(&(String, String)) -> String) -> String,
    {
        let on_app = |ids: &(String, String)| ids.0.clone();
        let on_mock = |ids: &(String, String)| ids.1.clone();
        let (app_uri, mock_uri) = (uri(&on_app), uri(&on_mock));
        let tokens = uid.map(|u| self.sessions[u]);
        let app_res = run_on_app(
            &mut self.app.app,
            method,
            &app_uri,
            tokens.map(|t| t.0),
            body.as_ref(),
        )
        .await;
        let mock_res = run_on_app(
            &mut self.mock.app,
            method,
            &mock_uri,
            tokens.map(|t| t.1),
            body.as_ref(),
        )
        .await;
        (app_res, mock_res)
    }

    async fn compare(&mut self, name: &str, (app_res, mock_res): (Outcome, Outcome)) {
        let (app_ids, mock_ids) = (self.ids(true), self.ids(false));
        assert_eq!(
            (app_res.0, normalize(app_res.1, &app_ids)),
            (mock_res.0, normalize(mock_res.1, &mock_ids)),
            "app and mock did not return the same result for {name}"
        );
        let summarize = |sent: Vec<Notification>, ids: &HashMap<String, String>| {
            sent.into_iter()
                .map(|n| (n.event, n.to, normalize(n.data, ids)))
                .collect::<Vec<_>>()
        };
        assert_eq!(
            summarize(self.app.notifier.sent().await, &app_ids),
            summarize(self.mock.notifier.sent().await, &mock_ids),
            "app and mock did not send the same notifications after {name}"
        );
    }

    fn both_ok(res: &(Outcome, Outcome)) -> bool {
        res.0 .0 == StatusCode::OK && res.1 .0 == StatusCode::OK
    }

    fn uid(&self, uid: usize) -> usize {
        resize_int(uid, ..self.sessions.len()).expect("fuzzer always has users")
    }

    fn topic(&self, topic: usize) -> TopicId {
        self.topics[resize_int(topic, ..self.topics.len()).expect("fuzzer always has topics")]
    }

    fn comment_ids(&self, cid: usize) -> (String, String) {
        let c = &self.comments[cid];
        (c.app.clone(), c.mock.clone())
    }

    /// Resolves `cid` to a comment, creating one first if there is none yet
    #[async_recursion]
    async fn comment(&mut self, cid: usize) -> usize {
        match resize_int(cid, ..self.comments.len()) {
            Some(cid) => cid,
            None => {
                self.execute_fuzz_op(FuzzOp::Create {
                    uid: 0,
                    topic: 0,
                    paragraph: false,
                    text: String::from("seed"),
                })
                .await;
                assert!(!self.comments.is_empty(), "seeding a comment failed");
                self.comment(cid).await
            }
        }
    }

    /// Resolves `rid` to a reply of comment `cid`, adding one first if there is none yet
    #[async_recursion]
    async fn reply(&mut self, cid: usize, rid: usize) -> usize {
        match resize_int(rid, ..self.comments[cid].replies.len()) {
            Some(rid) => rid,
            None => {
                let ids = self.comment_ids(cid);
                let res = self
                    .exec(
                        "POST",
                        |side| format!("/comment/{}/reply", side(&ids)),
                        Some(self.uid(usize::MAX)),
                        Some(json!({ "text": "seed" })),
                    )
                    .await;
                let ok = Self::both_ok(&res);
                if ok {
                    self.comments[cid]
                        .replies
                        .push((id_of(&res.0 .1), id_of(&res.1 .1)));
                }
                self.compare("seed reply", res).await;
                assert!(ok, "seeding a reply failed");
                self.reply(cid, rid).await
            }
        }
    }

    #[async_recursion]
    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::Create {
                uid,
                topic,
                paragraph,
                text,
            } => {
                let topic = self.topic(topic);
                let context = if paragraph { "paragraph" } else { "topic" };
                let res = self
                    .exec(
                        "POST",
                        |_| format!("/comment?topicId={topic}"),
                        Some(self.uid(uid)),
                        Some(json!({ "text": text, "context": context })),
                    )
                    .await;
                if Self::both_ok(&res) {
                    self.comments.push(TrackedComment {
                        app: id_of(&res.0 .1),
                        mock: id_of(&res.1 .1),
                        replies: Vec::new(),
                    });
                }
                self.compare("Create", res).await;
            }
            FuzzOp::Reply { uid, cid, text } => {
                let cid = self.comment(cid).await;
                let ids = self.comment_ids(cid);
                let res = self
                    .exec(
                        "POST",
                        |side| format!("/comment/{}/reply", side(&ids)),
                        Some(self.uid(uid)),
                        Some(json!({ "text": text })),
                    )
                    .await;
                if Self::both_ok(&res) {
                    self.comments[cid]
                        .replies
                        .push((id_of(&res.0 .1), id_of(&res.1 .1)));
                }
                self.compare("Reply", res).await;
            }
            FuzzOp::Vote { uid, cid, value } => {
                let cid = self.comment(cid).await;
                let ids = self.comment_ids(cid);
                let action = match value {
                    VoteValue::Positive => "upvote",
                    VoteValue::Negative => "downvote",
                };
                let res = self
                    .exec(
                        "POST",
                        |side| format!("/comment/{}/{action}", side(&ids)),
                        Some(self.uid(uid)),
                        None,
                    )
                    .await;
                self.compare("Vote", res).await;
            }
            FuzzOp::Unvote { uid, cid } => self.simple_op("Unvote", "unvote", uid, cid).await,
            FuzzOp::Flag { uid, cid } => self.simple_op("Flag", "flag", uid, cid).await,
            FuzzOp::Unflag { uid, cid } => self.simple_op("Unflag", "unflag", uid, cid).await,
            FuzzOp::Edit { uid, cid, text } => {
                let cid = self.comment(cid).await;
                let ids = self.comment_ids(cid);
                let res = self
                    .exec(
                        "PUT",
                        |side| format!("/comment/{}", side(&ids)),
                        Some(self.uid(uid)),
                        Some(json!({ "text": text })),
                    )
                    .await;
                self.compare("Edit", res).await;
            }
            FuzzOp::EditReply {
                uid,
                cid,
                rid,
                text,
            } => {
                let cid = self.comment(cid).await;
                let rid = self.reply(cid, rid).await;
                let ids = self.comment_ids(cid);
                let rids = self.comments[cid].replies[rid].clone();
                let res = self
                    .exec(
                        "PUT",
                        |side| format!("/comment/{}/reply/{}", side(&ids), side(&rids)),
                        Some(self.uid(uid)),
                        Some(json!({ "text": text })),
                    )
                    .await;
                self.compare("EditReply", res).await;
            }
            FuzzOp::RemoveReply { uid, cid, rid } => {
                let cid = self.comment(cid).await;
                let rid = self.reply(cid, rid).await;
                let ids = self.comment_ids(cid);
                let rids = self.comments[cid].replies[rid].clone();
                let res = self
                    .exec(
                        "DELETE",
                        |side| format!("/comment/{}/reply/{}", side(&ids), side(&rids)),
                        Some(self.uid(uid)),
                        None,
                    )
                    .await;
                self.compare("RemoveReply", res.clone()).await;
                if Self::both_ok(&res) {
                    self.comments[cid].replies.remove(rid);
                }
            }
            FuzzOp::Remove { uid, cid } => {
                let cid = self.comment(cid).await;
                let ids = self.comment_ids(cid);
                let res = self
                    .exec(
                        "DELETE",
                        |side| format!("/comment/{}", side(&ids)),
                        Some(self.uid(uid)),
                        None,
                    )
                    .await;
                self.compare("Remove", res.clone()).await;
                if Self::both_ok(&res) {
                    self.comments.remove(cid);
                }
            }
            FuzzOp::List {
                topic,
                sort,
                page,
                limit,
                paragraph,
                exclude,
                count,
            } => {
                let sort = ["-score", "-createdAt", "createdAt", "best"][usize::from(sort % 4)];
                let mut uri = format!(
                    "/comment/all?topicId={}&sort={sort}&page={}&limit={}",
                    self.topic(topic),
                    page % 4,
                    limit % 4,
                );
                if paragraph {
                    uri.push_str("&context=paragraph");
                }
                if let Some(u) = exclude {
                    let u = self.uid(u);
                    uri.push_str(&format!("&excludeAuthor={}", self.users[u]));
                }
                if count {
                    uri.push_str("&count=true");
                }
                let res = self.exec("GET", |_| uri.clone(), None, None).await;
                self.compare("List", res).await;
            }
            FuzzOp::Mine { uid, topic } => {
                let topic = self.topic(topic);
                let res = self
                    .exec(
                        "GET",
                        |_| format!("/comment/mine?topicId={topic}"),
                        Some(self.uid(uid)),
                        None,
                    )
                    .await;
                self.compare("Mine", res).await;
            }
            FuzzOp::Side { topic } => {
                let topic = self.topic(topic);
                let res = self
                    .exec(
                        "GET",
                        |_| format!("/comment/sidecomments?topicId={topic}"),
                        None,
                        None,
                    )
                    .await;
                self.compare("Side", res).await;
            }
            FuzzOp::Fetch { cid } => {
                let cid = self.comment(cid).await;
                let ids = self.comment_ids(cid);
                let res = self
                    .exec("GET", |side| format!("/comment/{}", side(&ids)), None, None)
                    .await;
                self.compare("Fetch", res).await;
            }
            FuzzOp::Replies { cid } => {
                let cid = self.comment(cid).await;
                let ids = self.comment_ids(cid);
                let res = self
                    .exec(
                        "GET",
                        |side| format!("/comment/{}/replies", side(&ids)),
                        None,
                        None,
                    )
                    .await;
                self.compare("Replies", res).await;
            }
            FuzzOp::Stats => {
                let res = self
                    .exec("GET", |_| String::from("/comment/stats"), None, None)
                    .await;
                self.compare("Stats", res).await;
            }
        }
    }

    async fn simple_op(&mut self, name: &str, action: &str, uid: usize, cid: usize) {
        let cid = self.comment(cid).await;
        let ids = self.comment_ids(cid);
        let res = self
            .exec(
                "POST",
                |side| format!("/comment/{}/{action}", side(&ids)),
                Some(self.uid(uid)),
                None,
            )
            .await;
        self.compare(name, res).await;
    }
}

do_sqlx_test!(
    compare_with_mock,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize),
    |pool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool).await;
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
    }
);
