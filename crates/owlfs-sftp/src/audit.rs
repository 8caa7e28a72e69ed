//! Audit trail and connection tracking
//!
//! Security relevant events are emitted through `tracing` with an `event`
//! field and the full serialised record, so JSON logs can be shipped to a
//! collector as-is.

use crate::auth::AuthDecision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{info, warn};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    /// Connection established
    ConnectionEstablished {
        connection_id: String,
        peer: Option<SocketAddr>,
        timestamp: DateTime<Utc>,
    },
    /// Connection closed
    ConnectionClosed {
        connection_id: String,
        peer: Option<SocketAddr>,
        /// Authenticated user name
        principal: Option<String>,
        timestamp: DateTime<Utc>,
        /// Connection duration in seconds
        duration_secs: i64,
    },
    /// One authentication decision
    AuthAttempt {
        connection_id: String,
        peer: Option<SocketAddr>,
        /// Method offered by the client (none, password, publickey)
        method: String,
        /// User name offered by the client
        username: String,
        timestamp: DateTime<Utc>,
        success: bool,
        /// Failure reason if applicable
        reason: Option<String>,
    },
    /// Connection dropped after too many failed attempts
    AuthAttemptsExceeded {
        connection_id: String,
        peer: Option<SocketAddr>,
        attempts: usize,
        timestamp: DateTime<Utc>,
    },
    /// Security event
    SecurityEvent {
        connection_id: String,
        principal: Option<String>,
        /// Security event type
        event: String,
        details: String,
        timestamp: DateTime<Utc>,
    },
}

impl AuditEvent {
    /// Record for one authentication decision
    pub fn auth_attempt(
        connection: &ConnectionInfo,
        username: &str,
        decision: &AuthDecision,
    ) -> Self {
        AuditEvent::AuthAttempt {
            connection_id: connection.connection_id.clone(),
            peer: connection.peer,
            method: decision.method().to_string(),
            username: username.to_string(),
            timestamp: Utc::now(),
            success: decision.is_accepted(),
            reason: decision.reason().map(str::to_string),
        }
    }

    /// Log the audit event
    pub fn log(&self) {
        match self {
            AuditEvent::ConnectionEstablished {
                connection_id,
                peer,
                ..
            } => {
                info!(
                    event = "connection_established",
                    connection_id,
                    peer = ?peer,
                    audit = ?self,
                    "New connection established"
                );
            }
            AuditEvent::ConnectionClosed {
                connection_id,
                principal,
                duration_secs,
                ..
            } => {
                info!(
                    event = "connection_closed",
                    connection_id,
                    principal = ?principal,
                    duration_secs,
                    audit = ?self,
                    "Connection closed"
                );
            }
            AuditEvent::AuthAttempt {
                connection_id,
                peer,
                method,
                username,
                success,
                reason,
                ..
            } => {
                if *success {
                    info!(
                        event = "auth_success",
                        connection_id,
                        peer = ?peer,
                        method,
                        username,
                        audit = ?self,
                        "Authentication successful"
                    );
                } else {
                    warn!(
                        event = "auth_failure",
                        connection_id,
                        peer = ?peer,
                        method,
                        username,
                        reason = ?reason,
                        audit = ?self,
                        "Authentication failed"
                    );
                }
            }
            AuditEvent::AuthAttemptsExceeded {
                connection_id,
                peer,
                attempts,
                ..
            } => {
                warn!(
                    event = "auth_attempts_exceeded",
                    connection_id,
                    peer = ?peer,
                    attempts,
                    audit = ?self,
                    "Too many authentication attempts, disconnecting"
                );
            }
            AuditEvent::SecurityEvent {
                connection_id,
                principal,
                event,
                details,
                ..
            } => {
                warn!(
                    event = "security_event",
                    connection_id,
                    principal = ?principal,
                    security_event = event,
                    details,
                    audit = ?self,
                    "Security event detected"
                );
            }
        }
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Per-connection identity used in audit records
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Unique connection identifier
    pub connection_id: String,
    pub peer: Option<SocketAddr>,
    /// Authenticated user name
    pub principal: Option<String>,
    pub start_time: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            peer,
            principal: None,
            start_time: Utc::now(),
        }
    }

    /// Connection duration in seconds
    pub fn duration_secs(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.start_time)
            .num_seconds()
    }

    pub fn established(&self) -> AuditEvent {
        AuditEvent::ConnectionEstablished {
            connection_id: self.connection_id.clone(),
            peer: self.peer,
            timestamp: self.start_time,
        }
    }

    pub fn closed(&self) -> AuditEvent {
        AuditEvent::ConnectionClosed {
            connection_id: self.connection_id.clone(),
            peer: self.peer,
            principal: self.principal.clone(),
            timestamp: Utc::now(),
            duration_secs: self.duration_secs(),
        }
    }

    pub fn security_event(&self, event: &str, details: impl Into<String>) -> AuditEvent {
        AuditEvent::SecurityEvent {
            connection_id: self.connection_id.clone(),
            principal: self.principal.clone(),
            event: event.to_string(),
            details: details.into(),
            timestamp: Utc::now(),
        }
    }
}
