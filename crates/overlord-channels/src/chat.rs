//! Transport-agnostic chat medium — a single configured channel the daemon
//! posts updates to and reads replies from. Concrete wiring to a specific
//! chat backend lives outside this crate; this crate only needs the
//! capability, not the protocol.

use std::sync::Arc;

use async_trait::async_trait;
use overlord_proposals::{ProposalNotifier, ThreadHistoryProvider};
use overlord_types::Proposal;

#[async_trait]
pub trait ChatMedium: Send + Sync {
    async fn post_message(&self, text: &str) -> Result<(), String>;
    async fn post_thread_reply(&self, thread_ts: &str, text: &str) -> Result<(), String>;
    async fn fetch_thread_replies(&self, thread_ts: &str) -> Result<Vec<String>, String>;
}

/// Adapts a [`ChatMedium`] to the [`ThreadHistoryProvider`] contract
/// `overlord-proposals` expects for offline reconciliation.
pub struct ChatThreadHistory<'a>(pub &'a dyn ChatMedium);

#[async_trait]
impl<'a> ThreadHistoryProvider for ChatThreadHistory<'a> {
    async fn fetch_replies(&self, thread_ts: &str) -> Result<Vec<String>, String> {
        self.0.fetch_thread_replies(thread_ts).await
    }
}

/// Announces proposal lifecycle events through a chat medium. `notify_new`/
/// `notify_result` are synchronous per the `ProposalNotifier` contract, so
/// the actual post is fired off as a detached task; failures are logged,
/// never propagated back to the proposal lifecycle.
pub struct ChatNotifier<M: ChatMedium + 'static> {
    medium: Arc<M>,
}

impl<M: ChatMedium + 'static> ChatNotifier<M> {
    pub fn new(medium: Arc<M>) -> Self {
        Self { medium }
    }
}

impl<M: ChatMedium + 'static> ProposalNotifier for ChatNotifier<M> {
    fn notify_new(&self, proposal: &Proposal) {
        let medium = self.medium.clone();
        let message = overlord_proposals::format_proposal_message(proposal);
        tokio::spawn(async move {
            if let Err(e) = medium.post_message(&message).await {
                tracing::warn!(error = %e, "failed to post new-proposal notification");
            }
        });
    }

    fn notify_result(&self, proposal: &Proposal) {
        let medium = self.medium.clone();
        let thread_ts = proposal.thread_ts.clone();
        let text = format!(
            "Proposal `{}` resolved: {}",
            proposal.id,
            proposal.result_summary.as_deref().unwrap_or(proposal.state.to_string().as_str())
        );
        tokio::spawn(async move {
            let result = match thread_ts {
                Some(ts) => medium.post_thread_reply(&ts, &text).await,
                None => medium.post_message(&text).await,
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to post proposal-result notification");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlord_types::{ProposalState, ScopeImpact};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingMedium {
        posts: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatMedium for RecordingMedium {
        async fn post_message(&self, text: &str) -> Result<(), String> {
            self.posts.lock().unwrap().push(text.to_string());
            Ok(())
        }
        async fn post_thread_reply(&self, _thread_ts: &str, text: &str) -> Result<(), String> {
            self.posts.lock().unwrap().push(text.to_string());
            Ok(())
        }
        async fn fetch_thread_replies(&self, _thread_ts: &str) -> Result<Vec<String>, String> {
            Ok(vec![])
        }
    }

    fn sample_proposal() -> Proposal {
        Proposal {
            id: "abcd1234".to_string(),
            task: "do the thing".to_string(),
            scope_projects: vec!["core".to_string()],
            scope_impact: ScopeImpact::Medium,
            affects_remote: false,
            reason: "test".to_string(),
            state: ProposalState::Pending,
            thread_ts: None,
            created_at: chrono::Utc::now(),
            resolved_at: None,
            result_summary: None,
        }
    }

    #[tokio::test]
    async fn notify_new_posts_formatted_message() {
        let medium = Arc::new(RecordingMedium::default());
        let notifier = ChatNotifier::new(medium.clone());
        notifier.notify_new(&sample_proposal());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(medium.posts.lock().unwrap().len(), 1);
    }
}
