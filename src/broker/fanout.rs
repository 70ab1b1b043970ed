//! Update Fan-out.
//!
//! After a state-mutating call, publish the new size, replay every cached
//! view against the worker and publish each result, then signal
//! `all_updates_complete`. The three view families replay concurrently; the
//! completion signal waits for all of them.

use futures_util::future::{join3, join_all};
use log::{debug, warn};

use super::channel::ComputeTransport;
use super::events::BrokerEvent;
use super::key::SessionKey;
use super::registry::ContextHandle;
use super::views::ViewDefinition;
use super::{Broker, QueryResult};

/// The event that carries `result` for `view`.
pub fn view_event(key: &SessionKey, view: &ViewDefinition, result: QueryResult) -> BrokerEvent {
    let dataset = key.dataset.clone();
    let engine = key.worker.to_string();
    match view {
        ViewDefinition::DimensionOrder { dimension, .. } => BrokerEvent::UpdateDimension {
            dataset,
            engine,
            dimension: dimension.clone(),
            result,
        },
        ViewDefinition::Histogram { dimension, .. } => BrokerEvent::UpdateHist {
            dataset,
            engine,
            dimension: dimension.clone(),
            result,
        },
        ViewDefinition::GroupOrder { dimension, aggregation, .. } => BrokerEvent::UpdateGroup {
            dataset,
            engine,
            dimension:   dimension.clone(),
            aggregation: aggregation.key().to_string(),
            result,
        },
    }
}

impl<T: ComputeTransport> Broker<T> {
    /// Republish the context behind `handle` after a mutation left the
    /// dataset at `size` rows. Returns how many views were republished.
    ///
    /// Nothing is published once the context is no longer current.
    pub async fn propagate(&self, handle: &ContextHandle, size: String, trigger: Option<&str>) -> usize {
        let key = &handle.key;
        if !self.registry().is_current(handle) {
            return 0;
        }
        self.hub().publish(&key.session, BrokerEvent::update_size(key, size));

        let mut dimensions = Vec::new();
        let mut histograms = Vec::new();
        let mut groups = Vec::new();
        for view in self.registry().views(key) {
            if view.replay_command().is_none() {
                continue;
            }
            match view {
                ViewDefinition::DimensionOrder { .. } => dimensions.push(view),
                ViewDefinition::Histogram { .. } => histograms.push(view),
                ViewDefinition::GroupOrder { .. } => groups.push(view),
            }
        }
        debug!(
            "{key}: replaying {} dimension, {} histogram, {} group view(s) after change to {}",
            dimensions.len(),
            histograms.len(),
            groups.len(),
            trigger.unwrap_or("all dimensions"),
        );

        let (d, h, g) = join3(
            join_all(dimensions.into_iter().map(|view| self.replay(handle, view))),
            join_all(histograms.into_iter().map(|view| self.replay(handle, view))),
            join_all(groups.into_iter().map(|view| self.replay(handle, view))),
        )
        .await;
        let republished = d.into_iter().chain(h).chain(g).filter(|ok| *ok).count();

        if self.registry().is_current(handle) {
            self.hub().publish(&key.session, BrokerEvent::all_updates_complete(key));
        }
        republished
    }

    /// Recompute one view and publish it. Failures are logged and skipped.
    async fn replay(&self, handle: &ContextHandle, view: ViewDefinition) -> bool {
        let key = &handle.key;
        let Some(command) = view.replay_command() else { return false };
        match self.client().call(key, &command).await {
            Ok(result) => {
                if !self.registry().is_current(handle) {
                    return false;
                }
                self.hub().publish(&key.session, view_event(key, &view, result));
                true
            }
            Err(failure) => {
                warn!("{key}: replay of {} for {} failed: {}", command.name(), view.dimension(), failure.error);
                if failure.is_fatal() {
                    self.fail_context(handle, &failure.error);
                }
                false
            }
        }
    }
}
