//! D. ProfileResolver (spec.md §4.4) — maps account email to a
//! browser-profile identifier. Primary path is the sheet's cached mapping
//! lookup (the TTL cache lives inside the `SheetGateway` implementation, see
//! `subcycle_sheet::http::HttpSheetGateway`); the fallback is a live registry
//! search by name-or-remark equality.

use async_trait::async_trait;
use log::debug;
use subcycle_sheet::{SheetError, SheetGateway};

/// A candidate profile surfaced by the fallback registry search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileCandidate {
    pub profile_id: String,
    /// True if this candidate passes the registry's own syntactic check
    /// (e.g. the profile is well-formed, not a half-created stub).
    pub syntactically_valid: bool,
}

/// Opaque collaborator queried only when the mapping sheet has nothing.
#[async_trait]
pub trait ProfileRegistry: Send + Sync {
    /// Profiles whose name or remark equals `email`, case-insensitive.
    async fn find_by_name_or_remark(&self, email: &str) -> Result<Vec<ProfileCandidate>, SheetError>;
}

pub struct ProfileResolver<'a> {
    sheet: &'a dyn SheetGateway,
    registry: Option<&'a dyn ProfileRegistry>,
}

impl<'a> ProfileResolver<'a> {
    pub fn new(sheet: &'a dyn SheetGateway) -> Self {
        Self {
            sheet,
            registry: None,
        }
    }

    pub fn with_registry(mut self, registry: &'a dyn ProfileRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Resolve `email -> profileId`. Returns `Ok(None)` — not an error — when
    /// nothing is found; the executor is still invoked with a null profile id
    /// and is expected to carry its own last-ditch search.
    pub async fn resolve(&self, email: &str) -> Result<Option<String>, SheetError> {
        if let Some(id) = self.sheet.resolve_profile_id(email).await? {
            return Ok(Some(id));
        }

        let Some(registry) = self.registry else {
            return Ok(None);
        };

        let candidates = registry.find_by_name_or_remark(email).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let chosen = candidates
            .iter()
            .find(|c| c.syntactically_valid)
            .unwrap_or(&candidates[0]);
        debug!(
            "profile resolver: fallback search picked {} for {email} (valid={})",
            chosen.profile_id, chosen.syntactically_valid
        );
        Ok(Some(chosen.profile_id.clone()))
    }
}
