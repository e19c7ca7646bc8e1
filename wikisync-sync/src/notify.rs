//! Post-update notifications.
//!
//! Delivery is best effort: the orchestrator logs and discards notifier errors.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use wikisync_core::RepositoryId;

use crate::orchestrator::UpdateMode;

/// Payload describing a completed update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateNotification {
    pub repository_id: RepositoryId,
    /// `org/repo`.
    pub repository: String,
    pub branch: String,
    pub previous_commit_id: Option<String>,
    pub commit_id: String,
    pub mode: UpdateMode,
    /// One line for humans, e.g. "Updated with 3 changed files".
    pub summary: String,
    pub changed_files_count: usize,
    pub updated_count: usize,
    pub completed_at: DateTime<Utc>,
}

impl UpdateNotification {
    pub fn summarize(mode: UpdateMode, changed_files_count: usize) -> String {
        let files = if changed_files_count == 1 { "file" } else { "files" };
        match mode {
            UpdateMode::Full => format!("Generated from {changed_files_count} {files}"),
            UpdateMode::Incremental => {
                format!("Updated with {changed_files_count} changed {files}")
            }
            UpdateMode::UpToDate => "Checkpoint advanced; no documentation changes".to_string(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &UpdateNotification) -> anyhow::Result<()>;
}

/// Emits an `info` event per update.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &UpdateNotification) -> anyhow::Result<()> {
        tracing::info!(
            repository = %notification.repository,
            branch = %notification.branch,
            commit = %notification.commit_id,
            mode = ?notification.mode,
            summary = %notification.summary,
            changed = notification.changed_files_count,
            updated = notification.updated_count,
            "wiki updated"
        );
        Ok(())
    }
}

/// POSTs the notification as JSON to a configured URL.
#[derive(Clone)]
pub struct WebhookNotifier {
    url: String,
    agent: ureq::Agent,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: &UpdateNotification) -> anyhow::Result<()> {
        self.agent
            .post(&self.url)
            .send_json(notification)
            .map_err(|err| anyhow::anyhow!("webhook {} failed: {err}", self.url))?;
        Ok(())
    }
}

/// Fans a notification out to several notifiers; the first error is returned
/// after every notifier ran.
#[derive(Default)]
pub struct Notifiers(Vec<Box<dyn Notifier>>);

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: impl Notifier + 'static) -> Self {
        self.0.push(Box::new(notifier));
        self
    }
}

impl Notifier for Notifiers {
    fn notify(&self, notification: &UpdateNotification) -> anyhow::Result<()> {
        let mut first_error = None;
        for notifier in &self.0 {
            if let Err(err) = notifier.notify(notification) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting(Arc<AtomicUsize>, bool);

    impl Notifier for Counting {
        fn notify(&self, _: &UpdateNotification) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if self.1 {
                anyhow::bail!("unreachable endpoint");
            }
            Ok(())
        }
    }

    fn notification() -> UpdateNotification {
        UpdateNotification {
            repository_id: RepositoryId::from("r-1"),
            repository: "acme/widgets".into(),
            branch: "main".into(),
            previous_commit_id: None,
            commit_id: "c1".into(),
            mode: UpdateMode::Full,
            summary: UpdateNotification::summarize(UpdateMode::Full, 3),
            changed_files_count: 3,
            updated_count: 1,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn every_notifier_runs_even_after_a_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let notifiers = Notifiers::new()
            .with(Counting(Arc::clone(&calls), true))
            .with(Counting(Arc::clone(&calls), false))
            .with(LogNotifier);
        let err = notifiers.notify(&notification()).unwrap_err();
        assert!(err.to_string().contains("unreachable"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn webhook_to_closed_port_fails() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook");
        assert!(notifier.notify(&notification()).is_err());
    }

    #[test]
    fn payload_serializes_mode_in_lowercase() {
        let json = serde_json::to_value(notification()).unwrap();
        assert_eq!(json["mode"], "full");
        assert_eq!(json["repository"], "acme/widgets");
        assert_eq!(json["summary"], "Generated from 3 files");
    }

    #[test]
    fn summary_counts_changed_files() {
        assert_eq!(
            UpdateNotification::summarize(UpdateMode::Incremental, 3),
            "Updated with 3 changed files"
        );
        assert_eq!(
            UpdateNotification::summarize(UpdateMode::Incremental, 1),
            "Updated with 1 changed file"
        );
        assert!(UpdateNotification::summarize(UpdateMode::UpToDate, 0).contains("no documentation"));
    }
}
