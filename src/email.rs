use crate::config::EmailConfig;
use async_trait::async_trait;
use resend_rs::types::CreateEmailBaseOptions;
use resend_rs::Resend;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("Unknown Email error")]
    UnknownError,
    #[error("Email is not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupportTicket {
    pub user_id: Uuid,
    pub account_email: String,
    pub contact_email: Option<String>,
    pub subject: String,
    pub message: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_support_ticket(&self, ticket: &SupportTicket) -> Result<(), EmailError>;
}

pub struct ResendMailer {
    resend: Resend,
    support_email: String,
    from: String,
}

impl ResendMailer {
    pub fn new(config: &EmailConfig) -> Self {
        Self {
            resend: Resend::new(&config.resend_api_key),
            support_email: config.support_email.clone(),
            from: config.from.clone(),
        }
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send_support_ticket(&self, ticket: &SupportTicket) -> Result<(), EmailError> {
        debug!("Entering send_support_ticket");

        let to = [self.support_email.clone()];
        let subject = format!("[Support] {}", ticket.subject);
        let html_content = support_ticket_html(ticket);

        let email = CreateEmailBaseOptions::new(self.from.clone(), to, subject)
            .with_html(&html_content);

        self.resend.emails.send(email).await.map_err(|e| {
            error!("Failed to send support ticket email: {}", e);
            EmailError::UnknownError
        })?;

        debug!("Exiting send_support_ticket");
        Ok(())
    }
}

/// Used when no Resend key is configured.
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send_support_ticket(&self, _ticket: &SupportTicket) -> Result<(), EmailError> {
        Err(EmailError::NotConfigured)
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn support_ticket_html(ticket: &SupportTicket) -> String {
    let contact = ticket
        .contact_email
        .as_deref()
        .unwrap_or(&ticket.account_email);
    format!(
        r#"
        <!DOCTYPE html>
        <html lang="en">
        <head>
            <meta charset="UTF-8">
            <title>Support ticket</title>
            <style>
                body {{ font-family: ui-sans-serif,system-ui,sans-serif; }}
                .container {{ max-width: 600px; margin: 0 auto; padding: 20px; }}
                .message {{ background-color: rgba(1,1,1,0.05); padding: 10px; border-radius: 5px; white-space: pre-wrap; }}
            </style>
        </head>
        <body>
            <div class="container">
                <h2>{}</h2>
                <p><strong>User:</strong> {}</p>
                <p><strong>Account email:</strong> {}</p>
                <p><strong>Reply to:</strong> {}</p>
                <div class="message">{}</div>
            </div>
        </body>
        </html>
        "#,
        escape_html(&ticket.subject),
        ticket.user_id,
        escape_html(&ticket.account_email),
        escape_html(contact),
        escape_html(&ticket.message),
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<SupportTicket>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send_support_ticket(&self, ticket: &SupportTicket) -> Result<(), EmailError> {
            self.sent.lock().unwrap().push(ticket.clone());
            Ok(())
        }
    }
}
