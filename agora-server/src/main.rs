use std::sync::Arc;

use agora_api::{DbPool, Notifier};
use anyhow::Context;
use axum::{
    http::{self, Request},
    middleware::Next,
    response::Response,
    routing::{get, post, put},
    Router,
};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod error;
mod extractors;
mod fuzz;
mod handlers;
mod notify;
mod query;

pub use config::{Links, Opt};
pub use db::PgPool;
pub use error::Error;

use extractors::{AppState, DbHandle, NotifierHandle};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

pub async fn create_sqlx_pool(url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    Ok(PgPool::new(
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .with_context(|| format!("opening database {url:?}"))?,
    ))
}

fn accepts_json(accept: &str) -> bool {
    accept.split(',').any(|range| {
        let mime = range.split(';').next().unwrap_or("").trim();
        ["application/json", "application/*", "*/*"]
            .iter()
            .any(|ok| mime.eq_ignore_ascii_case(ok))
    })
}

/// Rejects requests that cannot take a JSON response
async fn accept_json<B>(req: Request<B>, next: Next<B>) -> Result<Response, Error> {
    if let Some(accept) = req.headers().get(http::header::ACCEPT) {
        let accept = accept.to_str().map_err(|_| Error::not_acceptable())?;
        if !accepts_json(accept) {
            return Err(Error::not_acceptable());
        }
    }
    Ok(next.run(req).await)
}

pub fn app(db: Arc<dyn DbPool>, notifier: Arc<dyn Notifier>, links: Links) -> Router {
    let state = AppState {
        db: DbHandle(db),
        notifier: NotifierHandle(notifier),
        links,
    };
    Router::new()
        .route("/comment", post(handlers::create))
        .route("/comment/all", get(handlers::list_all))
        .route("/comment/mine", get(handlers::list_mine))
        .route("/comment/sidecomments", get(handlers::list_side))
        .route("/comment/stats", get(handlers::stats))
        .route(
            "/comment/:id",
            get(handlers::fetch)
                .put(handlers::edit)
                .delete(handlers::remove),
        )
        .route("/comment/:id/replies", get(handlers::replies))
        .route("/comment/:id/reply", post(handlers::reply))
        .route(
            "/comment/:id/reply/:reply_id",
            put(handlers::edit_reply).delete(handlers::remove_reply),
        )
        .route("/comment/:id/upvote", post(handlers::upvote))
        .route("/comment/:id/downvote", post(handlers::downvote))
        .route("/comment/:id/unvote", post(handlers::unvote))
        .route("/comment/:id/flag", post(handlers::flag))
        .route("/comment/:id/unflag", post(handlers::unflag))
        .route_layer(axum::middleware::from_fn(accept_json))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opt = Opt::from_args();
    let pool = create_sqlx_pool(&opt.database_url, opt.max_connections).await?;
    pool.migrate().await?;

    let notifier: Arc<dyn Notifier> = match &opt.notify_webhook {
        Some(url) => {
            tracing::info!(%url, "delivering notifications through webhook");
            Arc::new(notify::WebhookNotifier::new(url.clone()))
        }
        None => {
            tracing::warn!("no notification webhook configured, notifications will only be logged");
            Arc::new(notify::LogNotifier)
        }
    };

    let app = app(Arc::new(pool), notifier, opt.links());
    tracing::info!("listening on {}", opt.listen);
    axum::Server::bind(&opt.listen)
        .serve(app.into_make_service())
        .await
        .context("serving axum webserver")
}

#[cfg(test)]
mod accept_tests {
    use super::accepts_json;

    #[test]
    fn accept_header_ranges() {
        assert!(accepts_json("application/json"));
        assert!(accepts_json("text/html, application/json;q=0.9"));
        assert!(accepts_json("*/*"));
        assert!(accepts_json("Application/*"));
        assert!(!accepts_json("text/html"));
        assert!(!accepts_json("application/xml, text/plain"));
    }
}
