use agora_api::{Notification, Notifier};
use anyhow::Context;
use async_trait::async_trait;

/// Sends `n`, logging delivery failures instead of reporting them
pub async fn send(notifier: &dyn Notifier, n: Notification) {
    let event = n.event.name();
    let to = n.to.clone();
    match notifier.notify(n).await {
        Ok(()) => tracing::debug!(event, %to, "sent notification"),
        Err(err) => tracing::error!(?err, event, %to, "failed sending notification"),
    }
}

/// Notifier for deployments without a delivery service
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: Notification) -> anyhow::Result<()> {
        tracing::info!(event = n.event.name(), to = %n.to, data = %n.data, "notification");
        Ok(())
    }
}

/// Posts each notification as JSON to the delivery service
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> WebhookNotifier {
        WebhookNotifier {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, n: Notification) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&n)
            .send()
            .await
            .with_context(|| format!("posting {} notification to {}", n.event.name(), self.url))?
            .error_for_status()
            .with_context(|| format!("delivery service rejected {} notification", n.event.name()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use agora_api::NotificationEvent;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::*;

    type Received = Arc<Mutex<Vec<Notification>>>;

    async fn receive(State(received): State<Received>, Json(n): Json<Notification>) -> StatusCode {
        let reject = n.to.is_empty();
        received.lock().await.push(n);
        if reject {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::OK
        }
    }

    async fn delivery_service() -> (String, Received) {
        let received = Received::default();
        let app = Router::new()
            .route("/notify", post(receive))
            .with_state(received.clone());
        let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
            .serve(app.into_make_service());
        let url = format!("http://{}/notify", server.local_addr());
        tokio::spawn(server);
        (url, received)
    }

    fn notification(to: &str) -> Notification {
        Notification {
            event: NotificationEvent::CommentUpvote,
            to: String::from(to),
            data: json!({ "comment": { "id": "c1" } }),
        }
    }

    #[tokio::test]
    async fn webhook_posts_json() {
        let (url, received) = delivery_service().await;
        let notifier = WebhookNotifier::new(url);
        notifier.notify(notification("ada@example.org")).await.unwrap();
        assert_eq!(
            *received.lock().await,
            vec![notification("ada@example.org")]
        );
    }

    #[tokio::test]
    async fn webhook_reports_rejections() {
        let (url, _received) = delivery_service().await;
        let notifier = WebhookNotifier::new(url);
        assert!(notifier.notify(notification("")).await.is_err());
    }

    #[tokio::test]
    async fn send_swallows_failures() {
        let notifier = WebhookNotifier::new(String::from("http://127.0.0.1:1/unreachable"));
        send(&notifier, notification("ada@example.org")).await;
    }
}
