//! Instrument fault alerts.
//!
//! The monitor experiment raises an alert the first time the signal drifts
//! out of tolerance. Message content and SMTP endpoint selection live here;
//! delivery is behind [`AlertSink`] so a mail transport can be plugged in
//! without touching the experiment.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::AppResult;

/// Subject line of every fault alert.
pub const ALERT_SUBJECT: &str = "Instrument Fault Alert pyFSRS";

/// SMTP endpoint inferred from the sender address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SmtpProvider {
    /// Host name
    pub host: &'static str,
    /// Submission port
    pub port: u16,
}

impl SmtpProvider {
    /// Pick the provider whose name appears in `sender`, if any.
    pub fn infer(sender: &str) -> Option<Self> {
        if sender.contains("gmail") {
            Some(Self {
                host: "smtp.gmail.com",
                port: 587,
            })
        } else if sender.contains("yahoo") {
            Some(Self {
                host: "smtp.mail.yahoo.com",
                port: 465,
            })
        } else if sender.contains("microsoft") {
            Some(Self {
                host: "smtp.office365.com",
                port: 587,
            })
        } else {
            None
        }
    }
}

/// A fully addressed alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertMessage {
    /// Endpoint to submit through
    pub provider: SmtpProvider,
    /// Sender address, also the login
    pub sender: String,
    /// Recipient address
    pub destination: String,
    /// Subject line
    pub subject: String,
    /// Plain-text body
    pub body: String,
}

impl AlertMessage {
    /// Instability alert for a sliding average of `duration` samples that
    /// left a band of `tolerance` standard deviations.
    ///
    /// Returns `None` when no provider can be inferred from `sender`.
    pub fn instability(
        sender: &str,
        destination: &str,
        duration: usize,
        tolerance: f64,
    ) -> Option<Self> {
        let provider = SmtpProvider::infer(sender)?;
        Some(Self {
            provider,
            sender: sender.to_string(),
            destination: destination.to_string(),
            subject: ALERT_SUBJECT.to_string(),
            body: format!(
                "This is an automated alter from pyFSRS. The instrument is unstable.\n \
                 An average over {duration} measurements have fell outside a tolerance of \
                 {tolerance} standard deviations.\nHave a great day!"
            ),
        })
    }

    /// RFC 5322 style message text: subject header, blank line, body.
    pub fn to_rfc822(&self) -> String {
        format!("Subject: {}\n\n{}", self.subject, self.body)
    }
}

/// Delivery of alerts.
pub trait AlertSink: Send + Sync {
    /// Deliver `message`, authenticating with `password`.
    fn send(&self, message: &AlertMessage, password: &str) -> AppResult<()>;
}

/// Sink that records alerts in the log instead of sending mail.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send(&self, message: &AlertMessage, _password: &str) -> AppResult<()> {
        info!(
            host = message.provider.host,
            port = message.provider.port,
            from = %message.sender,
            to = %message.destination,
            subject = %message.subject,
            "fault alert (log only)"
        );
        Ok(())
    }
}

/// Build and deliver an instability alert, logging when the sender's
/// provider is unknown.
pub fn send_instability_alert(
    sink: &Arc<dyn AlertSink>,
    sender: &str,
    password: &str,
    destination: &str,
    duration: usize,
    tolerance: f64,
) -> AppResult<bool> {
    match AlertMessage::instability(sender, destination, duration, tolerance) {
        Some(message) => {
            sink.send(&message, password)?;
            Ok(true)
        }
        None => {
            warn!(
                sender,
                "cannot identify SMTP host for sender address; alert not sent"
            );
            Ok(false)
        }
    }
}
