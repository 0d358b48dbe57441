//! Folder storage contract used by the event handlers, plus an in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FolderError {
    #[error("root folder already exists for user {0}")]
    RootExists(u64),
    #[error("folder storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: Uuid,
    pub user_id: u64,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Folder {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub id: Uuid,
    pub user_id: u64,
    pub folder_id: Uuid,
    pub name: String,
}

/// The slice of the folder/file layer the user event handler needs
#[async_trait]
pub trait FolderService: Send + Sync {
    /// Create the unnamed top-level folder of a user. A user has at most one.
    async fn create_root_folder(&self, user_id: u64) -> Result<Folder, FolderError>;

    /// Delete every folder of a user, returning how many were removed
    async fn delete_all_folders(&self, user_id: u64) -> Result<usize, FolderError>;

    /// Delete every file of a user, returning how many were removed
    async fn delete_all_files(&self, user_id: u64) -> Result<usize, FolderError>;
}

/// Process-local folder store backing the binary
#[derive(Default)]
pub struct InMemoryFolderService {
    folders: DashMap<u64, Vec<Folder>>,
    files: DashMap<u64, Vec<StoredFile>>,
}

impl InMemoryFolderService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_folder(&self, user_id: u64) -> Option<Folder> {
        self.folders
            .get(&user_id)
            .and_then(|folders| folders.iter().find(|f| f.is_root()).cloned())
    }

    pub fn folder_count(&self, user_id: u64) -> usize {
        self.folders.get(&user_id).map_or(0, |folders| folders.len())
    }

    pub fn file_count(&self, user_id: u64) -> usize {
        self.files.get(&user_id).map_or(0, |files| files.len())
    }

    /// Add a named folder under `parent_id`
    pub fn insert_folder(&self, user_id: u64, name: &str, parent_id: Uuid) -> Folder {
        let folder = Folder {
            id: Uuid::now_v7(),
            user_id,
            name: name.to_string(),
            parent_id: Some(parent_id),
            created_at: Utc::now(),
        };
        self.folders
            .entry(user_id)
            .or_default()
            .push(folder.clone());
        folder
    }

    pub fn insert_file(&self, user_id: u64, folder_id: Uuid, name: &str) -> StoredFile {
        let file = StoredFile {
            id: Uuid::now_v7(),
            user_id,
            folder_id,
            name: name.to_string(),
        };
        self.files.entry(user_id).or_default().push(file.clone());
        file
    }
}

#[async_trait]
impl FolderService for InMemoryFolderService {
    async fn create_root_folder(&self, user_id: u64) -> Result<Folder, FolderError> {
        let mut folders = self.folders.entry(user_id).or_default();
        if folders.iter().any(|f| f.is_root()) {
            return Err(FolderError::RootExists(user_id));
        }

        let folder = Folder {
            id: Uuid::now_v7(),
            user_id,
            name: String::new(),
            parent_id: None,
            created_at: Utc::now(),
        };
        folders.push(folder.clone());
        Ok(folder)
    }

    async fn delete_all_folders(&self, user_id: u64) -> Result<usize, FolderError> {
        Ok(self
            .folders
            .remove(&user_id)
            .map_or(0, |(_, folders)| folders.len()))
    }

    async fn delete_all_files(&self, user_id: u64) -> Result<usize, FolderError> {
        Ok(self
            .files
            .remove(&user_id)
            .map_or(0, |(_, files)| files.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_root_folder_once() {
        let service = InMemoryFolderService::new();

        let root = service.create_root_folder(42).await.unwrap();
        assert!(root.is_root());
        assert_eq!(root.user_id, 42);
        assert_eq!(root.name, "");
        assert_eq!(service.root_folder(42), Some(root));

        assert_eq!(
            service.create_root_folder(42).await,
            Err(FolderError::RootExists(42))
        );
        assert_eq!(service.folder_count(42), 1);
    }

    #[tokio::test]
    async fn test_delete_all_for_user() {
        let service = InMemoryFolderService::new();
        let root = service.create_root_folder(7).await.unwrap();
        let docs = service.insert_folder(7, "docs", root.id);
        service.insert_file(7, docs.id, "a.txt");
        service.insert_file(7, root.id, "b.txt");
        service.create_root_folder(8).await.unwrap();

        assert_eq!(service.delete_all_folders(7).await, Ok(2));
        assert_eq!(service.delete_all_files(7).await, Ok(2));
        assert_eq!(service.folder_count(7), 0);
        assert_eq!(service.file_count(7), 0);

        // other users are untouched
        assert_eq!(service.folder_count(8), 1);
        // nothing left to delete
        assert_eq!(service.delete_all_folders(7).await, Ok(0));
    }
}
