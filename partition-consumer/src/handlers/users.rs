use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::folders::FolderService;
use crate::handler::MessageHandler;
use crate::kafka::message::MessageEnvelope;

pub const EVENT_TYPE_HEADER: &str = "eventType";
pub const USER_CREATED_EVENT: &str = "UserCreatedEvent";
pub const USER_DELETED_EVENT: &str = "UserDeletedEvent";

/// Keeps a user's folder tree in step with the user lifecycle events.
///
/// The event type comes from the `eventType` header and the user id from the
/// message key.
pub struct UserEventHandler {
    topic: String,
    folders: Arc<dyn FolderService>,
}

impl UserEventHandler {
    pub fn new(topic: impl Into<String>, folders: Arc<dyn FolderService>) -> Self {
        Self {
            topic: topic.into(),
            folders,
        }
    }

    async fn on_user_created(&self, user_id: &str) -> Result<()> {
        let user_id: u64 = user_id
            .parse()
            .with_context(|| format!("invalid user id {user_id:?}"))?;

        let folder = self
            .folders
            .create_root_folder(user_id)
            .await
            .with_context(|| format!("failed to create root folder for user {user_id}"))?;

        info!(user_id, folder_id = %folder.id, "Created root folder");
        Ok(())
    }

    async fn on_user_deleted(&self, user_id: &str) -> Result<()> {
        let user_id: u64 = user_id
            .parse()
            .with_context(|| format!("invalid user id {user_id:?}"))?;

        let folders = self
            .folders
            .delete_all_folders(user_id)
            .await
            .with_context(|| format!("failed to delete folders for user {user_id}"))?;
        let files = self
            .folders
            .delete_all_files(user_id)
            .await
            .with_context(|| format!("failed to delete files for user {user_id}"))?;

        info!(user_id, folders, files, "Deleted user folders and files");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for UserEventHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle_message(&self, message: &MessageEnvelope) -> Result<()> {
        let event_type = message.header_str(EVENT_TYPE_HEADER).unwrap_or_default();
        let user_id = message
            .key()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();

        debug!(
            event_type,
            user_id = %user_id,
            offset = message.offset(),
            "Handling user event"
        );

        match event_type {
            USER_CREATED_EVENT => self.on_user_created(&user_id).await,
            USER_DELETED_EVENT => self.on_user_deleted(&user_id).await,
            other => Err(anyhow!("unknown users event type: {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folders::InMemoryFolderService;
    use crate::kafka::types::PartitionId;

    fn event(event_type: &str, user_id: &str) -> MessageEnvelope {
        MessageEnvelope::new("users", PartitionId::new(0), 0)
            .with_key(user_id.to_string())
            .with_header(EVENT_TYPE_HEADER, event_type.to_string())
            .with_payload(format!("{{\"userID\":\"{user_id}\"}}"))
    }

    fn handler() -> (UserEventHandler, Arc<InMemoryFolderService>) {
        let folders = Arc::new(InMemoryFolderService::new());
        (UserEventHandler::new("users", folders.clone()), folders)
    }

    #[tokio::test]
    async fn test_user_created_creates_root_folder() {
        let (handler, folders) = handler();

        handler
            .handle_message(&event(USER_CREATED_EVENT, "42"))
            .await
            .unwrap();

        let root = folders.root_folder(42).unwrap();
        assert!(root.is_root());
    }

    #[tokio::test]
    async fn test_duplicate_user_created_fails() {
        let (handler, folders) = handler();
        handler
            .handle_message(&event(USER_CREATED_EVENT, "42"))
            .await
            .unwrap();

        let err = handler
            .handle_message(&event(USER_CREATED_EVENT, "42"))
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("root folder already exists for user 42"));
        assert_eq!(folders.folder_count(42), 1);
    }

    #[tokio::test]
    async fn test_user_deleted_removes_folders_and_files() {
        let (handler, folders) = handler();
        handler
            .handle_message(&event(USER_CREATED_EVENT, "9"))
            .await
            .unwrap();
        let root = folders.root_folder(9).unwrap();
        folders.insert_file(9, root.id, "notes.txt");

        handler
            .handle_message(&event(USER_DELETED_EVENT, "9"))
            .await
            .unwrap();

        assert_eq!(folders.folder_count(9), 0);
        assert_eq!(folders.file_count(9), 0);
    }

    #[tokio::test]
    async fn test_invalid_user_id() {
        let (handler, folders) = handler();

        let err = handler
            .handle_message(&event(USER_CREATED_EVENT, "not-a-number"))
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("invalid user id"));
        assert!(folders.root_folder(0).is_none());
    }

    #[tokio::test]
    async fn test_unknown_or_missing_event_type() {
        let (handler, _) = handler();

        let err = handler
            .handle_message(&event("UserRenamedEvent", "1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown users event type"));

        let no_header = MessageEnvelope::new("users", PartitionId::new(0), 1).with_key("1");
        assert!(handler.handle_message(&no_header).await.is_err());
    }
}
