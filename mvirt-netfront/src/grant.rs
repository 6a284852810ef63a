//! Revoke-exactly-once grant handles

use std::sync::Arc;

use tracing::error;

use crate::error::GrantError;
use crate::host::{DomainId, GrantTable};
use crate::protocol::GrantRef;

/// An active grant of one guest frame to the backend.
///
/// Not `Clone`: `revoke` consumes the entry, so a reference cannot be revoked
/// twice. Dropping an entry that was never revoked leaks the grant and is
/// logged.
#[derive(Debug)]
pub struct GrantEntry {
    gref: GrantRef,
    pfn: u64,
}

impl GrantEntry {
    /// Grant `pfn` to `domain`.
    pub fn permit(
        table: &Arc<dyn GrantTable>,
        domain: DomainId,
        pfn: u64,
        read_only: bool,
    ) -> Result<Self, GrantError> {
        let gref = table.permit_foreign_access(domain, pfn, read_only)?;
        Ok(Self { gref, pfn })
    }

    pub fn gref(&self) -> GrantRef {
        self.gref
    }

    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    /// End foreign access.
    ///
    /// On failure the backend still holds a mapping; the entry is consumed
    /// either way since retrying cannot succeed until the backend unmaps.
    pub fn revoke(self, table: &Arc<dyn GrantTable>) -> Result<(), GrantError> {
        let result = table.revoke_foreign_access(self.gref);
        std::mem::forget(self);
        result
    }
}

impl Drop for GrantEntry {
    fn drop(&mut self) {
        error!(gref = self.gref, pfn = self.pfn, "Grant dropped without revoke");
    }
}
