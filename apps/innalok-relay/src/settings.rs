use std::sync::Arc;

use crate::store::{self, KeyValueStore, StoreError};

pub const AUTO_FORWARD_KEY: &str = "invoys_auto_forward";

/// User toggles persisted next to the device list.
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn KeyValueStore>,
}

impl Settings {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Whether incoming notifications are sent to the terminal. Defaults to
    /// on; an unreadable value also counts as on.
    pub fn auto_forward(&self) -> bool {
        match store::load_json::<bool>(self.store.as_ref(), AUTO_FORWARD_KEY) {
            Ok(value) => value.unwrap_or(true),
            Err(err) => {
                tracing::warn!(
                    target: "innalok::store",
                    error = %err,
                    "unreadable auto-forward setting; assuming enabled"
                );
                true
            }
        }
    }

    pub fn set_auto_forward(&self, enabled: bool) -> Result<(), StoreError> {
        store::save_json(self.store.as_ref(), AUTO_FORWARD_KEY, &enabled)
    }
}
