//! Per-request audit records.
//!
//! Every request through the audited router produces exactly one structured
//! `audit_event` at the end of the handler chain, including requests that
//! panic. The record travels in the request extensions so the verifier,
//! handlers and the vending pipeline can enrich it.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use futures::FutureExt;
use tracing::info;

use crate::auth::claims::IdentityClaims;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// The audit record for a single request. Mutated through [`AuditHandle`];
/// emitted exactly once when the request ends.
#[derive(Debug, Clone, Default)]
pub struct AuditRecord {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub source_ip: String,
    pub user_agent: String,
    pub requested_profile: String,
    pub authorized: bool,
    pub auth_subject: String,
    pub auth_issuer: String,
    pub auth_audience: Vec<String>,
    pub auth_expiry_secs: i64,
    pub error: String,
    pub repositories: Vec<String>,
    pub permissions: Vec<String>,
    pub expiry_secs: i64,
    pub emitted: bool,
}

/// Shared handle to the request's audit record.
#[derive(Debug, Clone, Default)]
pub struct AuditHandle(Arc<Mutex<AuditRecord>>);

impl AuditHandle {
    /// Record the request attributes available before any processing.
    pub fn begin(&self, request: &Request) {
        let mut record = self.0.lock().unwrap();
        record.method = request.method().to_string();
        record.path = request.uri().path().to_string();
        record.user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        record.source_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_default();
    }

    /// Append to the error field, `; `-joining multiple contributions.
    pub fn append_error(&self, message: &str) {
        let mut record = self.0.lock().unwrap();
        if !record.error.is_empty() {
            record.error.push_str("; ");
        }
        record.error.push_str(message);
    }

    /// Mark the request authorized and copy the identity attributes.
    pub fn record_identity(&self, claims: &IdentityClaims) {
        let mut record = self.0.lock().unwrap();
        record.authorized = true;
        record.auth_subject = claims.subject.clone();
        record.auth_issuer = claims.issuer.clone();
        record.auth_audience = claims.audience.clone();
        record.auth_expiry_secs = claims.expiry;
    }

    /// Record a successfully vended token.
    pub fn record_vended(&self, repository_url: &str, expiry_secs: i64) {
        let mut record = self.0.lock().unwrap();
        record.repositories = vec![repository_url.to_string()];
        record.permissions = vec!["contents:read".to_string()];
        record.expiry_secs = expiry_secs;
    }

    fn set_status(&self, status: u16) {
        self.0.lock().unwrap().status = status;
    }

    fn record_panic(&self, description: &str) {
        self.set_status(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
        self.append_error(&format!("panic: {description}"));
    }

    /// Emit the record as a structured `audit_event`. A record that never saw
    /// a response status defaults to 200.
    fn emit(&self) {
        let mut record = self.0.lock().unwrap();
        if record.status == 0 {
            record.status = StatusCode::OK.as_u16();
        }
        record.emitted = true;

        info!(
            target: "audit",
            method = %record.method,
            path = %record.path,
            status = record.status,
            source_ip = %record.source_ip,
            user_agent = %record.user_agent,
            requested_profile = %record.requested_profile,
            authorized = record.authorized,
            auth_subject = %record.auth_subject,
            auth_issuer = %record.auth_issuer,
            auth_audience = ?record.auth_audience,
            auth_expiry_secs = record.auth_expiry_secs,
            error = %record.error,
            repositories = ?record.repositories,
            permissions = ?record.permissions,
            expiry_secs = record.expiry_secs,
            "audit_event"
        );
    }

    /// Snapshot the current record state.
    pub fn snapshot(&self) -> AuditRecord {
        self.0.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Install an audit record on the request and emit it when the request ends.
///
/// A panic in the inner chain is recovered so the record can be written with
/// status 500 and a `panic:` error, then re-raised so the server's default
/// crash handling still applies. An [`AuditHandle`] already present on the
/// request (tests) is reused rather than replaced.
pub async fn middleware(mut request: Request, next: Next) -> Response {
    let audit = match request.extensions().get::<AuditHandle>() {
        Some(existing) => existing.clone(),
        None => {
            let audit = AuditHandle::default();
            request.extensions_mut().insert(audit.clone());
            audit
        }
    };

    audit.begin(&request);

    match std::panic::AssertUnwindSafe(next.run(request))
        .catch_unwind()
        .await
    {
        Ok(response) => {
            audit.set_status(response.status().as_u16());
            audit.emit();
            response
        }
        Err(panic) => {
            audit.record_panic(&panic_description(panic.as_ref()));
            audit.emit();
            std::panic::resume_unwind(panic)
        }
    }
}

fn panic_description(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
