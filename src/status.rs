use chrono::{DateTime, Local};
use tokio::sync::watch;

use crate::error::ReconcileError;

/// Port-reachability indicator shown next to the proxy toggle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Reachability {
    Loading,
    Ok,
    Fail,
    #[default]
    None,
}

impl Reachability {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Loading => "checking…",
            Self::Ok => "reachable",
            Self::Fail => "not reachable",
            Self::None => "-",
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Loading)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorNotice {
    pub message: String,
    /// Set only for failures the user can fix by following a link.
    pub help_link: Option<String>,
}

impl ErrorNotice {
    pub fn plain(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            help_link: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    pub text: String,
    pub reachability: Reachability,
    pub error: Option<ErrorNotice>,
    pub updated_at: DateTime<Local>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            text: String::new(),
            reachability: Reachability::None,
            error: None,
            updated_at: Local::now(),
        }
    }
}

/// Publishes status to the presentation layer. Cloning shares the channel.
#[derive(Clone)]
pub struct StatusHandle {
    sender: watch::Sender<StatusSnapshot>,
    permission_help_url: Option<String>,
}

impl StatusHandle {
    pub fn new(permission_help_url: Option<String>) -> Self {
        let (sender, _) = watch::channel(StatusSnapshot::default());
        Self {
            sender,
            permission_help_url,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.sender.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.sender.borrow().clone()
    }

    fn update(&self, change: impl FnOnce(&mut StatusSnapshot)) {
        self.sender.send_modify(|snapshot| {
            change(snapshot);
            snapshot.updated_at = Local::now();
        });
    }

    pub fn set_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.update(|snapshot| snapshot.text = text);
    }

    pub fn set_reachability(&self, reachability: Reachability) {
        self.update(|snapshot| snapshot.reachability = reachability);
    }

    pub fn clear_error(&self) {
        self.update(|snapshot| snapshot.error = None);
    }

    pub fn set_error(&self, notice: ErrorNotice) {
        self.update(|snapshot| snapshot.error = Some(notice));
    }

    pub fn notice_for(&self, error: &ReconcileError) -> ErrorNotice {
        match error {
            ReconcileError::PermissionDenied(_) => ErrorNotice {
                message: error.to_string(),
                help_link: self.permission_help_url.clone(),
            },
            other => ErrorNotice::plain(other.to_string()),
        }
    }

    /// Clears the status line and shows `error` in its place.
    pub fn report_failure(&self, error: &ReconcileError) {
        let notice = self.notice_for(error);
        self.update(|snapshot| {
            snapshot.text.clear();
            snapshot.error = Some(notice);
        });
    }
}
