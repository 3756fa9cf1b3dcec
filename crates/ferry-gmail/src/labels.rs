use crate::{GmailClient, GmailError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Lazily-populated map of label name → Gmail label id. Custom labels are
/// created on first use; the seed listing avoids re-creating labels that
/// already exist in the target mailbox.
pub struct LabelCache {
    client: Arc<GmailClient>,
    by_name: Mutex<HashMap<String, String>>,
}

impl LabelCache {
    pub async fn seed(client: Arc<GmailClient>) -> Result<Self, GmailError> {
        let labels = client.list_labels().await?;
        let by_name = labels
            .into_iter()
            .map(|label| (label.name, label.id))
            .collect();
        Ok(Self {
            client,
            by_name: Mutex::new(by_name),
        })
    }

    /// Resolve a label name to its id, creating the label on a miss.
    pub async fn ensure(&self, name: &str) -> Result<String, GmailError> {
        let normalized = name.trim();
        if normalized.is_empty() {
            return Err(GmailError::Unexpected("blank label name".to_string()));
        }

        let mut by_name = self.by_name.lock().await;
        if let Some(id) = by_name.get(normalized) {
            return Ok(id.clone());
        }

        let created = self.client.create_label(normalized).await?;
        info!(label = normalized, id = %created.id, "created gmail label");
        by_name.insert(created.name, created.id.clone());
        Ok(created.id)
    }
}
