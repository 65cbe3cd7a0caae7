//! Change notifications pushed by the realtime endpoint.

use crate::record::{Record, RecordId};

/// One create/update/delete event on a record.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeNotification {
    /// A record was created elsewhere (or by us, echoed back).
    Created(Record),
    /// A record was replaced.
    Updated(Record),
    /// A record was removed.
    Deleted(RecordId),
}

impl ChangeNotification {
    /// Identifier of the record this notification concerns.
    #[must_use]
    pub const fn record_id(&self) -> &RecordId {
        match self {
            Self::Created(record) | Self::Updated(record) => &record.id,
            Self::Deleted(id) => id,
        }
    }

    /// Lower-case action name, as it appears on the wire.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Deleted(_) => "deleted",
        }
    }
}
