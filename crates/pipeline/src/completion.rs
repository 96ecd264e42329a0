//! Single-shot, tool-less model calls used by triage and quality grading.

use tidewire_core::error::ProviderError;
use tidewire_core::message::Message;
use tidewire_core::model::TaskRole;
use tidewire_core::provider::GenerateRequest;
use tidewire_core::CancellationToken;
use tidewire_providers::ModelRouter;
use tracing::debug;

/// Ask the model serving `role` one question and return its text.
pub(crate) async fn complete(
    router: &ModelRouter,
    role: TaskRole,
    system: &str,
    user: String,
    max_tokens: u32,
    cancel: &CancellationToken,
) -> Result<String, ProviderError> {
    let model = router.resolve_model(role);
    let provider = router.provider_for(&model).ok_or_else(|| {
        ProviderError::NotConfigured(format!(
            "no provider '{}' for model '{}'",
            model.provider, model.model_id
        ))
    })?;

    let mut request = GenerateRequest::new(
        model.model_id.clone(),
        vec![Message::system(system), Message::user(user)],
    );
    request.temperature = 0.0;
    request.max_tokens = Some(max_tokens);

    debug!(%role, model = %model.model_id, "One-shot completion");
    let mut response = provider.generate(request, cancel.clone()).await?;
    if response.choices.len() != 1 {
        return Err(ProviderError::MalformedResponse(format!(
            "expected exactly one choice, got {}",
            response.choices.len()
        )));
    }
    Ok(response.choices.remove(0).message.content_text().trim().to_string())
}
