use async_trait::async_trait;
use tidewire_core::request::RequestContext;
use tracing::debug;

use crate::error::PipelineError;
use crate::registry::ServiceRegistry;
use crate::services::NotificationSource;
use crate::stage::{Stage, StageFlow};

/// Surfaces unread background-task notifications to the model as one
/// system note.
pub struct InjectNotificationsStage;

#[async_trait]
impl Stage for InjectNotificationsStage {
    fn name(&self) -> &'static str {
        "inject_notifications"
    }

    fn runs_on_retry(&self) -> bool {
        false
    }

    fn skipped_on_fast_path(&self) -> bool {
        true
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        services: &ServiceRegistry,
    ) -> Result<StageFlow, PipelineError> {
        let Some(source) = services.get::<dyn NotificationSource>() else {
            return Ok(StageFlow::Next);
        };
        let unread = source.take_unread().await;
        if unread.is_empty() {
            return Ok(StageFlow::Next);
        }

        debug!(request_id = %ctx.id, count = unread.len(), "Injecting notifications");
        let lines: Vec<String> = unread.iter().map(|n| format!("- {n}")).collect();
        ctx.metadata.notices.push(format!(
            "Background task updates since the user's last message:\n{}",
            lines.join("\n")
        ));
        Ok(StageFlow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Inbox(Mutex<Vec<String>>);

    #[async_trait]
    impl NotificationSource for Inbox {
        async fn take_unread(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    #[tokio::test]
    async fn unread_notifications_become_one_notice_once() {
        let inbox: Arc<dyn NotificationSource> = Arc::new(Inbox(Mutex::new(vec![
            "Task 'index docs' completed".into(),
            "Task 'lint' failed: exit 1".into(),
        ])));
        let services = ServiceRegistry::new().with(inbox);

        let mut ctx = RequestContext::new("what happened?", 5);
        InjectNotificationsStage.run(&mut ctx, &services).await.unwrap();
        assert_eq!(ctx.metadata.notices.len(), 1);
        assert!(ctx.metadata.notices[0].contains("- Task 'lint' failed"));

        let mut next = RequestContext::new("and now?", 5);
        InjectNotificationsStage.run(&mut next, &services).await.unwrap();
        assert!(next.metadata.notices.is_empty());
    }

    #[tokio::test]
    async fn no_source_is_fine() {
        let mut ctx = RequestContext::new("hi", 5);
        InjectNotificationsStage
            .run(&mut ctx, &ServiceRegistry::new())
            .await
            .unwrap();
        assert!(ctx.metadata.notices.is_empty());
    }
}
