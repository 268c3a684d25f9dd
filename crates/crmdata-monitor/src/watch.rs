//! Watched documents.
//!
//! Maintenance closes subscriptions that see no traffic, and a denied listen
//! yields an inert handle, so the watch list is re-checked on every stats
//! tick and missing subscriptions are reopened.

use std::collections::HashMap;

use tracing::{debug, info};

use crmdata_access::{DataAccess, SubscriptionHandle};
use crmdata_models::{Collection, DocKey, Payload};

pub struct Watchlist {
    keys: Vec<DocKey>,
    handles: HashMap<DocKey, SubscriptionHandle>,
}

impl Watchlist {
    pub fn new(keys: Vec<DocKey>) -> Self {
        Self {
            keys,
            handles: HashMap::new(),
        }
    }

    /// Subscribe every watched document that has no live subscription.
    ///
    /// Returns how many live subscriptions were opened.
    pub fn ensure(&mut self, access: &DataAccess) -> usize {
        let mut opened = 0;
        for key in &self.keys {
            let collection: Collection<Payload> = Collection::new(key.collection());
            if access.is_listening(&collection, key.doc_id()) {
                continue;
            }

            let path = key.to_string();
            let handle = access.listen_to_document(&collection, key.doc_id(), move |value: Option<Payload>| {
                match value {
                    Some(fields) => info!(document = %path, fields = fields.len(), "Document changed"),
                    None => info!(document = %path, "Document missing"),
                }
            });
            if handle.is_noop() {
                debug!(document = %key, "Watch denied, retrying next tick");
            } else {
                opened += 1;
            }
            if let Some(stale) = self.handles.insert(key.clone(), handle) {
                stale.unsubscribe();
            }
        }
        opened
    }

    pub fn unsubscribe_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.unsubscribe();
        }
    }
}
