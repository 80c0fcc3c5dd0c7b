use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::RegistryError;

use super::Codec;

/// Process-wide name→codec and content-type→codec index. The only
/// process-wide mutable resource in the runtime; mutations are expected to
/// happen once at startup and are serialized here by an internal mutex
/// rather than by caller discipline alone.
#[derive(Default)]
pub struct CodecRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, Arc<dyn Codec>>,
    by_content_type: HashMap<String, String>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, codec: Arc<dyn Codec>) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let name = codec.name().to_string();
        let content_type = codec.content_type().to_string();

        if inner.by_name.contains_key(&name) {
            return Err(RegistryError::DuplicateName { name });
        }
        if let Some(existing) = inner.by_content_type.get(&content_type) {
            return Err(RegistryError::DuplicateContentType {
                content_type,
                existing: existing.clone(),
            });
        }

        inner.by_content_type.insert(content_type, name.clone());
        inner.by_name.insert(name, codec);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        match inner.by_name.remove(name) {
            Some(codec) => {
                inner.by_content_type.remove(codec.content_type());
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_name.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Codec>> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_name.get(name).cloned()
    }

    pub fn get_by_content_type(&self, content_type: &str) -> Option<Arc<dyn Codec>> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        let name = inner.by_content_type.get(content_type)?;
        inner.by_name.get(name).cloned()
    }

    pub fn reset_for_tests(&self) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_name.clear();
        inner.by_content_type.clear();
    }
}
