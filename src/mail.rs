use serde::Serialize;
use serde_with::skip_serializing_none;

use crate::config::MailConfig;

#[derive(Debug, Clone)]
pub struct QrEmail {
    pub to: String,
    pub student_name: String,
    pub student_id: String,
    pub qr_image_url: String,
}

impl QrEmail {
    pub fn subject(&self) -> String {
        "Your QR Code - QR Attend System".to_string()
    }

    pub fn html(&self) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Your QR Code - QR Attend</title>
</head>
<body style="font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
  <h1 style="text-align: center;">Welcome, {name}!</h1>
  <p style="text-align: center; color: #6b7280;">Your registration is complete. This is your personal attendance QR code.</p>
  <div style="text-align: center; margin: 32px 0;">
    <img src="{url}" alt="Your QR code" width="200" height="200" style="border: 2px solid #e5e7eb; border-radius: 8px; padding: 8px;">
  </div>
  <table style="width: 100%; background: #eff6ff; border-radius: 8px; padding: 16px;">
    <tr><td><strong>Name</strong></td><td>{name}</td></tr>
    <tr><td><strong>Student ID</strong></td><td>{id}</td></tr>
    <tr><td><strong>Email</strong></td><td>{to}</td></tr>
  </table>
  <h3>How to use your QR code</h3>
  <ol>
    <li>Save this email or download the QR image to your phone.</li>
    <li>Show the code to the event administrator at the entrance.</li>
    <li>Your attendance is logged once per day when the code is scanned.</li>
  </ol>
  <p style="color: #6b7280; font-size: 12px;">Keep this code private. It identifies you for attendance.</p>
</body>
</html>"#,
            name = html_escape(&self.student_name),
            id = html_escape(&self.student_id),
            to = html_escape(&self.to),
            url = html_escape(&self.qr_image_url),
        )
    }

    pub fn text(&self) -> String {
        format!(
            "Welcome, {name}!\n\n\
             Your registration is complete.\n\n\
             Name: {name}\n\
             Student ID: {id}\n\
             Email: {to}\n\n\
             Your QR code: {url}\n\n\
             How to use your QR code:\n\
             1. Save this email or download the QR image to your phone.\n\
             2. Show the code to the event administrator at the entrance.\n\
             3. Your attendance is logged once per day when the code is scanned.\n",
            name = self.student_name,
            id = self.student_id,
            to = self.to,
            url = self.qr_image_url,
        )
    }
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailOutcome {
    pub sent: bool,
    pub error: Option<String>,
}

impl EmailOutcome {
    fn failed<S: Into<String>>(error: S) -> Self {
        Self {
            sent: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    html: String,
    text: String,
}

pub struct Mailer {
    client: reqwest::Client,
    config: MailConfig,
}

impl Mailer {
    pub fn new(config: MailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Delivery problems are reported in the outcome, never as an error.
    pub async fn send_qr_code(&self, email: &QrEmail) -> EmailOutcome {
        let api_key = match &self.config.api_key {
            Some(key) => key,
            None => {
                log::warn!("RESEND_API_KEY is not configured, skipping QR email");
                return EmailOutcome::failed(
                    "Email service not configured. Please contact administrator.",
                );
            }
        };

        let request = SendRequest {
            from: &self.config.from,
            to: [email.to.as_str()],
            subject: email.subject(),
            html: email.html(),
            text: email.text(),
        };

        let response = match self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                log::warn!("Sending QR email to {} failed: {}", email.to, err);
                return EmailOutcome::failed(err.to_string());
            }
        };

        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            let message = body["message"].as_str().unwrap_or("Unknown error");
            log::warn!("Email provider rejected message to {}: {}", email.to, message);
            return EmailOutcome::failed(format!("Email service error: {}", message));
        }

        log::info!(
            "QR email sent to {} ({})",
            email.to,
            body["id"].as_str().unwrap_or("no id")
        );
        EmailOutcome {
            sent: true,
            error: None,
        }
    }
}
