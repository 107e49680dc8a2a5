//! QR-code authorization.
//!
//! A QR session is submitted once, then its status is polled on a single
//! worker until the user confirms on their phone or the code expires.
//! Observers hear about status *changes* only, on the shared callback
//! context.

use crate::manager::AuthManager;
use crate::oauth::OAuthEndpoint;
use core_runtime::CallbackContext;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consecutive failed polls after which the session is abandoned.
pub const MAX_POLL_ERRORS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QrCodeStatus {
    /// Waiting for a scan.
    WaitLogin,
    /// Scanned, waiting for the user to confirm.
    ScanSuccess,
    LoginSuccess,
    QrCodeExpired,
}

impl QrCodeStatus {
    /// Wire name to status; anything unknown reads as `WaitLogin`.
    pub fn parse(value: &str) -> Self {
        match value {
            "ScanSuccess" => QrCodeStatus::ScanSuccess,
            "LoginSuccess" => QrCodeStatus::LoginSuccess,
            "QRCodeExpired" => QrCodeStatus::QrCodeExpired,
            _ => QrCodeStatus::WaitLogin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QrCodeStatus::WaitLogin => "WaitLogin",
            QrCodeStatus::ScanSuccess => "ScanSuccess",
            QrCodeStatus::LoginSuccess => "LoginSuccess",
            QrCodeStatus::QrCodeExpired => "QRCodeExpired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QrCodeStatus::LoginSuccess | QrCodeStatus::QrCodeExpired)
    }
}

/// `POST oauth/authorize/qrcode` answer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeSession {
    pub qr_code_url: String,
    pub sid: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    #[serde(default)]
    status: String,
    #[serde(default)]
    auth_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QrObserverId(u64);

type StatusObserver = Arc<dyn Fn(QrCodeStatus) + Send + Sync>;

struct Inner {
    session: QrCodeSession,
    callbacks: CallbackContext,
    observers: Mutex<Vec<(QrObserverId, StatusObserver)>>,
    current: Mutex<Option<QrCodeStatus>>,
    next_id: AtomicU64,
    cancelled: AtomicBool,
    finished: tokio::sync::Notify,
    done: AtomicBool,
}

/// Handle to a running QR session. Clones share the session.
#[derive(Clone)]
pub struct QrCodeAuthTask {
    inner: Arc<Inner>,
}

impl QrCodeAuthTask {
    pub(crate) fn spawn(
        session: QrCodeSession,
        endpoint: OAuthEndpoint,
        manager: Arc<AuthManager>,
        callbacks: CallbackContext,
        interval: Duration,
    ) -> Self {
        let task = Self {
            inner: Arc::new(Inner {
                session,
                callbacks,
                observers: Mutex::new(Vec::new()),
                current: Mutex::new(None),
                next_id: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                finished: tokio::sync::Notify::new(),
                done: AtomicBool::new(false),
            }),
        };

        let worker = task.clone();
        tokio::spawn(async move {
            worker.poll(endpoint, manager, interval).await;
            worker.inner.done.store(true, Ordering::SeqCst);
            worker.inner.finished.notify_waiters();
        });

        task
    }

    pub fn qr_code_url(&self) -> &str {
        &self.inner.session.qr_code_url
    }

    pub fn sid(&self) -> &str {
        &self.inner.session.sid
    }

    /// Last status delivered to observers.
    pub fn current_status(&self) -> Option<QrCodeStatus> {
        self.inner.current.lock().ok().and_then(|current| *current)
    }

    pub fn add_status_observer<F>(&self, observer: F) -> QrObserverId
    where
        F: Fn(QrCodeStatus) + Send + Sync + 'static,
    {
        let id = QrObserverId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut observers) = self.inner.observers.lock() {
            observers.push((id, Arc::new(observer)));
        }
        id
    }

    pub fn remove_status_observer(&self, id: QrObserverId) -> bool {
        match self.inner.observers.lock() {
            Ok(mut observers) => {
                let before = observers.len();
                observers.retain(|(existing, _)| *existing != id);
                observers.len() != before
            }
            Err(_) => false,
        }
    }

    /// Stop polling before the next status request.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Resolves when the poll loop has stopped.
    pub async fn finished(&self) {
        loop {
            let notified = self.inner.finished.notified();
            if self.inner.done.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    async fn poll(&self, endpoint: OAuthEndpoint, manager: Arc<AuthManager>, interval: Duration) {
        let path = format!("oauth/qrcode/{}/status", self.inner.session.sid);
        let mut errors = 0;

        loop {
            tokio::time::sleep(interval).await;
            if self.inner.cancelled.load(Ordering::SeqCst) {
                info!(sid = %self.inner.session.sid, "QR code polling cancelled");
                return;
            }

            let body: StatusBody = match endpoint.get_json(&path).await {
                Ok(body) => {
                    errors = 0;
                    body
                }
                Err(e) => {
                    errors += 1;
                    warn!(sid = %self.inner.session.sid, attempt = errors, error = %e, "QR status poll failed");
                    if errors >= MAX_POLL_ERRORS {
                        manager
                            .report_login_failure(format!("QR code status unavailable: {}", e))
                            .await;
                        return;
                    }
                    continue;
                }
            };

            let status = QrCodeStatus::parse(&body.status);
            debug!(sid = %self.inner.session.sid, status = status.as_str(), "QR status polled");
            self.publish(status);

            match status {
                QrCodeStatus::LoginSuccess => {
                    // Failures are reported as LoginFailed events by the manager.
                    let _ = manager.fetch_token(Some(&body.auth_code), None).await;
                    return;
                }
                QrCodeStatus::QrCodeExpired => return,
                QrCodeStatus::WaitLogin | QrCodeStatus::ScanSuccess => {}
            }
        }
    }

    fn publish(&self, status: QrCodeStatus) {
        let inner = Arc::clone(&self.inner);
        self.inner.callbacks.post(move || {
            let Ok(mut current) = inner.current.lock() else {
                return;
            };
            if *current == Some(status) {
                return;
            }
            *current = Some(status);
            drop(current);

            let observers: Vec<StatusObserver> = match inner.observers.lock() {
                Ok(observers) => observers.iter().map(|(_, o)| Arc::clone(o)).collect(),
                Err(_) => return,
            };
            for observer in observers {
                observer(status);
            }
        });
    }
}

impl std::fmt::Debug for QrCodeAuthTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrCodeAuthTask")
            .field("sid", &self.inner.session.sid)
            .field("current", &self.current_status())
            .finish()
    }
}
