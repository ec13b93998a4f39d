//! Alert dispatcher: formats an `AlertNotification` and delivers it to the
//! configured recipient. Delivery failures are reported as `false`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::channels::Transport;
use crate::pipeline::types::AlertNotification;

const ALERT_HEADER: &str = "🚨 *EMERGENCY ALERT* 🚨";
const ALERT_FOOTER: &str = "_This is an automated alert from the Emergency Detection system._";

/// Sends formatted alerts over a transport.
pub struct AlertDispatcher {
    transport: Arc<dyn Transport>,
    recipient: String,
    timeout: Duration,
}

impl AlertDispatcher {
    pub fn new(transport: Arc<dyn Transport>, recipient: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            recipient: recipient.into(),
            timeout,
        }
    }

    /// Send one alert. Never retries.
    pub async fn dispatch(&self, alert: &AlertNotification) -> bool {
        let body = format_alert(alert);
        let sent = tokio::time::timeout(
            self.timeout,
            self.transport.send_message(&self.recipient, &body),
        )
        .await;

        match sent {
            Ok(Ok(())) => {
                info!(
                    category = %alert.category,
                    conversation = %alert.conversation_id,
                    transport = self.transport.name(),
                    "Alert sent to recipient"
                );
                true
            }
            Ok(Err(e)) => {
                error!(
                    category = %alert.category,
                    conversation = %alert.conversation_id,
                    error = %e,
                    "Failed to send alert to recipient"
                );
                false
            }
            Err(_) => {
                error!(
                    category = %alert.category,
                    conversation = %alert.conversation_id,
                    timeout_secs = self.timeout.as_secs(),
                    "Timed out sending alert to recipient"
                );
                false
            }
        }
    }
}

/// Render the alert body.
pub fn format_alert(alert: &AlertNotification) -> String {
    let confidence = (alert.confidence_score * 100.0).round() as i64;

    let mut body = format!("{ALERT_HEADER}\n\n");
    body.push_str(&format!("*Category:* {}\n", alert.category.label()));
    body.push_str(&format!("*Confidence:* {confidence}%\n"));
    body.push_str(&format!("*Group:* {}\n", alert.conversation_id));
    body.push_str(&format!(
        "*Time:* {}\n\n",
        alert.occurred_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    body.push_str(&format!("*Message:*\n{}\n\n", alert.message_text));

    if !alert.context.is_empty() {
        body.push_str(&format!("*Recent Context:*\n{}\n\n", alert.context.join("\n")));
    }

    body.push_str(ALERT_FOOTER);
    body
}
