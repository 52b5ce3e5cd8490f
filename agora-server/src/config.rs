use std::net::SocketAddr;

use agora_api::TopicId;

#[derive(Debug, structopt::StructOpt)]
#[structopt(name = "agora-server", about = "Threaded comments for deliberation topics")]
pub struct Opt {
    /// PostgreSQL connection string
    #[structopt(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Maximum number of pooled database connections
    #[structopt(long, env = "AGORA_DB_MAX_CONNECTIONS", default_value = "10")]
    pub max_connections: u32,

    #[structopt(long, env = "AGORA_LISTEN", default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Base URL of the platform, used to build links in notifications
    #[structopt(long, env = "AGORA_PUBLIC_URL", default_value = "http://localhost:3000")]
    pub public_url: String,

    /// Endpoint receiving notifications as JSON; notifications are only logged if unset
    #[structopt(long, env = "AGORA_NOTIFY_WEBHOOK")]
    pub notify_webhook: Option<String>,
}

impl Opt {
    pub fn links(&self) -> Links {
        Links {
            public_url: self.public_url.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Links {
    pub public_url: String,
}

impl Links {
    pub fn topic_url(&self, forum: Option<&str>, topic: TopicId) -> String {
        let base = self.public_url.trim_end_matches('/');
        match forum {
            Some(forum) => format!("{base}/{forum}/topic/{topic}"),
            None => format!("{base}/topic/{topic}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use agora_api::Uuid;
    use structopt::StructOpt;

    use super::*;

    #[test]
    fn command_line_overrides() {
        let opt = Opt::from_iter([
            "agora-server",
            "--database-url",
            "postgresql://localhost/agora",
            "--listen",
            "0.0.0.0:8080",
            "--public-url",
            "https://agora.example.org/",
            "--notify-webhook",
            "http://mailer.internal/notify",
        ]);
        assert_eq!(opt.database_url, "postgresql://localhost/agora");
        assert_eq!(opt.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(
            opt.notify_webhook.as_deref(),
            Some("http://mailer.internal/notify")
        );
        let topic = TopicId(Uuid::nil());
        assert_eq!(
            opt.links().topic_url(Some("budget"), topic),
            format!("https://agora.example.org/budget/topic/{topic}")
        );
        assert_eq!(
            opt.links().topic_url(None, topic),
            format!("https://agora.example.org/topic/{topic}")
        );
    }
}
