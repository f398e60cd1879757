//! Entry result and insights views: poll a created entry until enriched.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::errors::SyncResult;
use crate::core::ids::EntityId;
use crate::polling::entity::{EntityFields, EntryField, EntryInsights, PollableEntity};
use crate::polling::reconciler::{PollHandle, PollNotification, PollStart, PollingReconciler};
use crate::transport::EntityFetcher;

/// Which enrichment the view waits for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InsightsView {
    /// Entry result page: waits for the generated title.
    Result,
    /// Insights page: waits for the emotional landscape.
    Insights,
}

impl InsightsView {
    /// Field whose presence completes the view.
    #[must_use]
    pub const fn field(self) -> EntryField {
        match self {
            Self::Result => EntryField::Title,
            Self::Insights => EntryField::EmotionalLandscape,
        }
    }
}

/// Shows one entry and refreshes it while enrichment runs.
pub struct InsightsController {
    reconciler: Arc<PollingReconciler>,
    view: InsightsView,
    handle: Option<PollHandle>,
    insights: EntryInsights,
}

impl InsightsController {
    /// Controller for `view`, polling through `reconciler`.
    #[must_use]
    pub fn new(reconciler: Arc<PollingReconciler>, view: InsightsView) -> Self {
        Self {
            reconciler,
            view,
            handle: None,
            insights: EntryInsights::default(),
        }
    }

    /// View this controller serves.
    #[must_use]
    pub const fn view(&self) -> InsightsView {
        self.view
    }

    /// Latest known entry state.
    #[must_use]
    pub const fn insights(&self) -> &EntryInsights {
        &self.insights
    }

    /// Whether the awaited field is present.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        match self.view {
            InsightsView::Result => {
                self.insights.title.as_deref().is_some_and(|t| !t.is_empty())
            }
            InsightsView::Insights => self
                .insights
                .emotional_landscape
                .as_ref()
                .is_some_and(|v| !v.is_null()),
        }
    }

    /// Whether a poll session is still running for this view.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.handle.as_ref().is_some_and(PollHandle::is_active)
    }

    /// Show entry `id` with already-known fields and poll if incomplete.
    ///
    /// Any session from a previously shown entry is cancelled.
    pub fn open(&mut self, id: impl Into<EntityId>, known: EntityFields) -> PollStart {
        self.close();
        self.absorb(&known);
        let entity = PollableEntity::new(id, known, self.view.field().present());
        let handle = self.reconciler.start(entity);
        let status = handle.status();
        debug!(
            entity_id = %handle.entity_id(),
            ?status,
            view = ?self.view,
            "insights view opened"
        );
        self.handle = Some(handle);
        status
    }

    /// Fetch entry `id` once, show it, and poll if incomplete.
    ///
    /// # Errors
    /// Returns the fetch error; nothing is polled in that case.
    pub async fn load(
        &mut self,
        fetcher: &dyn EntityFetcher,
        id: EntityId,
    ) -> SyncResult<PollStart> {
        let fields = fetcher.fetch_entity(&id).await?;
        Ok(self.open(id, fields))
    }

    /// Wait for the next poll result and return the refreshed view.
    ///
    /// Returns `None` once the session has stopped.
    pub async fn next_update(&mut self) -> Option<&EntryInsights> {
        let notification = self.handle.as_mut()?.recv().await?;
        match &notification {
            PollNotification::Updated { fields, .. } | PollNotification::Settled { fields, .. } => {
                self.absorb(fields);
            }
            PollNotification::Expired { entity_id, attempts } => {
                warn!(entity_id = %entity_id, attempts, "entry did not finish enriching");
                return None;
            }
        }
        Some(&self.insights)
    }

    /// Follow updates until the awaited field appears or polling stops.
    pub async fn wait_ready(&mut self) -> Option<&EntryInsights> {
        while !self.is_ready() {
            self.next_update().await?;
        }
        Some(&self.insights)
    }

    /// Stop polling. Idempotent.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }

    fn absorb(&mut self, fields: &EntityFields) {
        match EntryInsights::from_fields(fields) {
            Ok(insights) => self.insights = insights,
            Err(err) => warn!(error = %err, "entry fields did not match the expected shape"),
        }
    }
}

impl Drop for InsightsController {
    fn drop(&mut self) {
        self.close();
    }
}
