use async_trait::async_trait;
use log::info;

/// Outbound email. Delivery is best-effort and never blocks a request.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_invitation(&self, to: &str, invite_link: &str) -> anyhow::Result<()>;
}

/// Writes deliveries to the log instead of an SMTP relay.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_invitation(&self, to: &str, invite_link: &str) -> anyhow::Result<()> {
        info!("[MAIL] Invitation for {} -> {}", to, invite_link);
        Ok(())
    }
}

pub fn invite_link(base_url: &str, group_id: &str, invitation_id: &str) -> String {
    format!("{}/{}/invite?invitation={}", base_url.trim_end_matches('/'), group_id, invitation_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_link_format() {
        assert_eq!(
            invite_link("http://localhost:5001/groups/", "g1", "inv-9"),
            "http://localhost:5001/groups/g1/invite?invitation=inv-9"
        );
    }

    #[tokio::test]
    async fn log_mailer_always_succeeds() {
        assert!(LogMailer.send_invitation("bob@example.com", "http://x/g/invite?invitation=1").await.is_ok());
    }
}
