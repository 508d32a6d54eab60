//! Server notifications.
//!
//! Handlers are plain closures registered on the client. They run on the
//! receive loop in arrival order, so they must not block.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tracing::debug;

use crate::types::DcId;

pub type UpdateHandler = Arc<dyn Fn(DcId, Bytes) + Send + Sync>;
pub type DcHandler = Arc<dyn Fn(DcId) + Send + Sync>;

/// The registered notification handlers. Registering replaces the previous one.
#[derive(Default)]
pub struct Notifier {
    on_update: RwLock<Option<UpdateHandler>>,
    on_auth_cancelled: RwLock<Option<DcHandler>>,
    on_updates_invalidated: RwLock<Option<DcHandler>>,
}

fn current<T: Clone>(slot: &RwLock<Option<T>>) -> Option<T> {
    match slot.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn replace<T>(slot: &RwLock<Option<T>>, value: T) {
    match slot.write() {
        Ok(mut guard) => *guard = Some(value),
        Err(poisoned) => *poisoned.into_inner() = Some(value),
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_update(&self, handler: UpdateHandler) {
        replace(&self.on_update, handler);
    }

    pub fn set_on_auth_cancelled(&self, handler: DcHandler) {
        replace(&self.on_auth_cancelled, handler);
    }

    pub fn set_on_updates_invalidated(&self, handler: DcHandler) {
        replace(&self.on_updates_invalidated, handler);
    }

    pub fn update(&self, dc: DcId, payload: Bytes) {
        match current(&self.on_update) {
            Some(handler) => handler(dc, payload),
            None => debug!(dc = %dc, len = payload.len(), "Update dropped, no handler registered"),
        }
    }

    pub fn auth_cancelled(&self, dc: DcId) {
        if let Some(handler) = current(&self.on_auth_cancelled) {
            handler(dc);
        }
    }

    pub fn updates_invalidated(&self, dc: DcId) {
        if let Some(handler) = current(&self.on_updates_invalidated) {
            handler(dc);
        }
    }
}
