//! Host platform capabilities: notifications and app lifecycle control.

use async_trait::async_trait;

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Warning,
    Error,
}

/// Capability for surfacing messages to the user and closing the app,
/// replacing the host's callback-based alert/confirm dialogs. The call
/// completes when the host has shown (or discarded) the notice.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: NoticeKind, message: &str);

    /// Instruct the host shell to close the app (e.g. after a fatal
    /// authorization failure).
    async fn close_app(&self);
}

/// Notifier that only logs. Useful as a default when no host dialog surface
/// exists.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, kind: NoticeKind, message: &str) {
        match kind {
            NoticeKind::Info => log::info!("{}", message),
            NoticeKind::Warning => log::warn!("{}", message),
            NoticeKind::Error => log::error!("{}", message),
        }
    }

    async fn close_app(&self) {
        log::info!("host asked to close the app");
    }
}
