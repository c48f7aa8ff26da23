//! In-memory [`ObjectStorage`] for tests.

use super::{
    FileData, ObjectStorage, ResourceType, StorageError, UploadOptions,
    UploadedObject,
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Mutex};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, FileData>>,
    reject_credentials: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails as if the provider refused the credentials.
    pub fn rejecting_credentials() -> Self {
        Self {
            reject_credentials: true,
            ..Self::default()
        }
    }

    pub fn contains(&self, public_id: &str) -> bool {
        self.objects
            .lock()
            .expect("storage lock poisoned")
            .contains_key(public_id)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("storage lock poisoned").len()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.reject_credentials {
            Err(StorageError::Authentication("Invalid credentials".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(
        &self,
        file: FileData,
        options: &UploadOptions,
    ) -> Result<UploadedObject, StorageError> {
        self.check()?;
        let name = options
            .public_id
            .clone()
            .unwrap_or_else(|| file.file_name.clone());
        let public_id = format!("{}/{}", options.folder, name);
        self.objects
            .lock()
            .expect("storage lock poisoned")
            .insert(public_id.clone(), file);

        Ok(UploadedObject {
            url: format!(
                "https://storage.test/{}/{public_id}",
                options.resource_type.as_str()
            ),
            public_id,
        })
    }

    async fn delete(
        &self,
        public_id: &str,
        _resource_type: ResourceType,
    ) -> Result<(), StorageError> {
        self.check()?;
        match self
            .objects
            .lock()
            .expect("storage lock poisoned")
            .remove(public_id)
        {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(public_id.to_owned())),
        }
    }
}
