//! Structured audit events.
//!
//! Every logical CA operation records exactly one event carrying the
//! operation name, the CA, free-form name/value pairs and the outcome.

use chrono::{DateTime, Utc};
use log::{info, warn};

//------------ AuditEvent ----------------------------------------------------

#[derive(Clone, Debug)]
pub struct AuditEvent {
    pub ca: String,
    pub operation: &'static str,
    pub started: DateTime<Utc>,
    pub data: Vec<(String, String)>,
}

impl AuditEvent {
    pub fn start(ca: &str, operation: &'static str) -> Self {
        AuditEvent {
            ca: ca.to_string(),
            operation,
            started: Utc::now(),
            data: Vec::new(),
        }
    }

    pub fn add(&mut self, name: &str, value: impl ToString) {
        self.data.push((name.to_string(), value.to_string()));
    }
}

//------------ AuditSink -----------------------------------------------------

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent, successful: bool);
}

/// Default sink writing audit events through `log`.
#[derive(Debug, Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: &AuditEvent, successful: bool) {
        let data: Vec<String> = event
            .data
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        if successful {
            info!(
                "AUDIT ca={} op={} {}",
                event.ca,
                event.operation,
                data.join(" ")
            );
        } else {
            warn!(
                "AUDIT ca={} op={} FAILED {}",
                event.ca,
                event.operation,
                data.join(" ")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_accumulates_data() {
        let mut event = AuditEvent::start("root", "issue_cert");
        event.add("serial", "1a");
        event.add("profile", "tls-server");
        assert_eq!(event.data.len(), 2);
        assert_eq!(event.data[1].1, "tls-server");
        LogAuditSink.record(&event, true);
    }
}
