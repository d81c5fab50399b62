//! Outbound mail for external-customer activities.

use crate::config::SmtpConfig;
use crate::definition::ProcessActivity;
use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

const FROM_ADDRESS: &str = "noreply@process-gpt.io";
const REPLY_TO: &str = "help@uengine.org";
const SUPPORT_EMAIL: &str = "help@uengine.org";

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<()>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)
            .with_context(|| format!("invalid SMTP relay '{}'", config.server))?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();
        Ok(Self { transport })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<()> {
        let message = Message::builder()
            .from(FROM_ADDRESS.parse().context("bad from address")?)
            .reply_to(REPLY_TO.parse().context("bad reply-to address")?)
            .to(to.parse().with_context(|| format!("bad recipient '{to}'"))?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())?;
        self.transport
            .send(message)
            .await
            .context("SMTP send failed")?;
        Ok(())
    }
}

/// The external-form URL mailed to a customer. The tenant decides the host;
/// `localhost` maps to the local dev server.
pub fn external_form_url(
    tenant_id: &str,
    form_id: &str,
    proc_def_id: &str,
    activity_id: &str,
    proc_inst_id: &str,
) -> String {
    let base = if tenant_id == "localhost" {
        "http://localhost:8088/external-forms".to_string()
    } else {
        format!("https://{tenant_id}.process-gpt.io/external-forms")
    };
    format!(
        "{base}/{form_id}?process_definition_id={proc_def_id}&activity_id={activity_id}&process_instance_id={proc_inst_id}"
    )
}

/// HTML invitation for the next step, linking the external form.
pub fn task_invitation_html(activity: &ProcessActivity, url: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>{name}</title>
</head>
<body style="font-family: Arial, sans-serif; background-color: #f4f4f4; margin: 0; padding: 20px;">
    <div style="max-width: 600px; background-color: #fff; padding: 30px; border-radius: 8px; box-shadow: 0 0 10px rgba(0, 0, 0, 0.1); text-align: center; margin: 0 auto;">
        <h2 style="color: #333; margin-bottom: 20px;">Your turn in the process.</h2>
        <p style="color: #555; font-size: 16px; line-height: 1.5;">
        It is your turn to complete '{name}'. Use the button below to review and submit.
        </p>
        <div style="margin: 30px 0;">
            <a href="{url}" style="display: inline-block; padding: 12px 24px; background-color: #0366d6; color: #fff; text-decoration: none; border-radius: 5px; font-weight: bold;">
                {name}
            </a>
        </div>
        <p style="margin-top: 30px; font-size: 13px; color: #888; line-height: 1.5;">
            If you run into problems, please contact our support team. {support}
        </p>
    </div>
</body>
</html>"#,
        name = activity.name,
        url = url,
        support = SUPPORT_EMAIL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_url_carries_routing_parameters() {
        let url = external_form_url("acme", "order_form", "order", "confirm", "order.inst-9");
        assert!(url.starts_with("https://acme.process-gpt.io/external-forms/order_form?"));
        assert!(url.contains("process_definition_id=order"));
        assert!(url.contains("activity_id=confirm"));
        assert!(url.contains("process_instance_id=order.inst-9"));
    }

    #[test]
    fn localhost_tenant_uses_the_dev_server() {
        let url = external_form_url("localhost", "f", "d", "a", "d.i");
        assert!(url.starts_with("http://localhost:8088/external-forms/f?"));
    }
}
