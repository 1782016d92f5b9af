use tracing::{error, info};

use super::Migration;
use crate::kv::{short_id, StoreError, Storer};

/// Backfills the `short_id` field for sent messages recorded before short
/// ids existed.
pub(super) struct ShortIdBackfill;

impl Migration for ShortIdBackfill {
    fn version(&self) -> i64 {
        1
    }

    fn description(&self) -> &str {
        "Backfill short ids for sent messages"
    }

    fn up(&self, store: &dyn Storer) -> Result<(), StoreError> {
        info!("listing sent messages to backfill short ids");
        let messages = store.list_sent_messages()?;
        for mut message in messages {
            if message.short_id.is_empty() {
                message.short_id = short_id(&message.id);
                if let Err(err) = store.update_sent_message(&message) {
                    error!("failed to update message {}: {}", message.id, err);
                }
            }
        }
        Ok(())
    }
}
