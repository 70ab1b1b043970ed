//! Query Dispatcher.
//!
//! Runs one client data command against a Ready context. Read-only commands
//! only answer the caller; view-defining commands also record the view and
//! publish their result to the session; state-mutating commands hand the new
//! dataset size to the fan-out.

use log::{debug, info};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::channel::{CallFailure, CallResult, ComputeTransport};
use super::events::{BrokerEvent, ConnectionId};
use super::fanout::view_event;
use super::key::SessionKey;
use super::registry::ContextState;
use super::views::ViewDefinition;
use super::wire::WorkerCommand;
use super::{Broker, ComputeError};

/// Effect class of a data command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// No cache effect, no fan-out.
    ReadOnly,
    /// Defines or redefines a cached view.
    ViewDefining,
    /// Changes the filtered dataset state; followed by fan-out.
    StateMutating,
}

impl CommandClass {
    /// `None` for lifecycle commands, which never go through dispatch.
    pub fn of(command: &WorkerCommand) -> Option<Self> {
        match command {
            WorkerCommand::GetSchema
            | WorkerCommand::GetSize
            | WorkerCommand::DimensionGetMaxMin { .. } => Some(CommandClass::ReadOnly),
            WorkerCommand::DimensionLoad { .. }
            | WorkerCommand::DimensionFilterOrder { .. }
            | WorkerCommand::DimensionHist { .. }
            | WorkerCommand::GroupbyLoad { .. }
            | WorkerCommand::GroupbyFilterOrder { .. } => Some(CommandClass::ViewDefining),
            WorkerCommand::DimensionFilter { .. }
            | WorkerCommand::DimensionFilterRange { .. }
            | WorkerCommand::DimensionReset { .. }
            | WorkerCommand::ResetAllFilters => Some(CommandClass::StateMutating),
            WorkerCommand::InitConnection
            | WorkerCommand::ReadData { .. }
            | WorkerCommand::EndConnection => None,
        }
    }
}

/// How a view-defining command changes the View Cache.
enum ViewUpdate {
    /// Replace whatever is cached under the same identity.
    Overwrite(ViewDefinition),
    /// Create an unordered slot unless one exists.
    Register(ViewDefinition),
}

fn view_update(command: &WorkerCommand) -> Option<ViewUpdate> {
    match command {
        WorkerCommand::DimensionLoad { dimension } => {
            Some(ViewUpdate::Register(ViewDefinition::DimensionOrder {
                dimension: dimension.clone(),
                order:     None,
            }))
        }
        WorkerCommand::DimensionFilterOrder { dimension, order } => {
            Some(ViewUpdate::Overwrite(ViewDefinition::DimensionOrder {
                dimension: dimension.clone(),
                order:     Some(order.clone()),
            }))
        }
        WorkerCommand::DimensionHist { dimension, bins } => {
            Some(ViewUpdate::Overwrite(ViewDefinition::Histogram {
                dimension: dimension.clone(),
                bins:      *bins,
            }))
        }
        WorkerCommand::GroupbyLoad { dimension, aggregation } => {
            Some(ViewUpdate::Register(ViewDefinition::GroupOrder {
                dimension:   dimension.clone(),
                aggregation: aggregation.clone(),
                order:       None,
            }))
        }
        WorkerCommand::GroupbyFilterOrder { dimension, aggregation, order } => {
            Some(ViewUpdate::Overwrite(ViewDefinition::GroupOrder {
                dimension:   dimension.clone(),
                aggregation: aggregation.clone(),
                order:       Some(order.clone()),
            }))
        }
        _ => None,
    }
}

/// Dimension a mutating command was aimed at, if any.
fn mutated_dimension(command: &WorkerCommand) -> Option<String> {
    match command {
        WorkerCommand::DimensionFilter { dimension, .. }
        | WorkerCommand::DimensionFilterRange { dimension, .. }
        | WorkerCommand::DimensionReset { dimension } => Some(dimension.clone()),
        _ => None,
    }
}

/// Outcome of [`Broker::dispatch`].
#[derive(Debug)]
pub struct Dispatched {
    pub outcome: CallResult,
    /// Fan-out started by a successful mutating command; resolves to the
    /// number of views republished.
    pub fanout:  Option<JoinHandle<usize>>,
}

impl Dispatched {
    fn done(outcome: CallResult) -> Self {
        Dispatched { outcome, fanout: None }
    }

    fn refused(error: ComputeError) -> Self {
        Dispatched::done(Err(CallFailure::refused(error)))
    }
}

impl<T: ComputeTransport> Broker<T> {
    /// Run a data command for `key` and return what the caller receives.
    pub async fn dispatch(&self, key: &SessionKey, command: WorkerCommand) -> Dispatched {
        self.dispatch_from(key, command, None).await
    }

    /// Like [`dispatch`](Self::dispatch) for a command issued by the client
    /// `origin`, which gets view results as its reply rather than as an event.
    pub async fn dispatch_from(
        &self,
        key:     &SessionKey,
        command: WorkerCommand,
        origin:  Option<ConnectionId>,
    ) -> Dispatched {
        let Some(class) = CommandClass::of(&command) else {
            return Dispatched::refused(ComputeError::NotDispatchable(command.name()));
        };
        let Some(handle) = self.registry().handle(key) else {
            return Dispatched::refused(ComputeError::NoContext(key.clone()));
        };
        match handle.state {
            ContextState::Ready => {}
            ContextState::Loading => return Dispatched::refused(ComputeError::Busy(key.clone())),
            _ => return Dispatched::refused(ComputeError::NotLoaded(key.clone())),
        }
        self.registry().touch(key, Instant::now());

        // Definition written by this call, dropped again if the call fails.
        let mut written = None;
        if class == CommandClass::ViewDefining {
            match view_update(&command) {
                Some(ViewUpdate::Overwrite(view)) => {
                    if self.registry().put_view(&handle, view.clone()) {
                        written = Some(view);
                    }
                }
                Some(ViewUpdate::Register(view)) => {
                    if self.registry().register_view(&handle, view.clone()) {
                        written = Some(view);
                    } else {
                        debug!("{key}: {} slot already cached", command.name());
                    }
                }
                None => {}
            }
        }

        // Held through the call and the fan-out it triggers.
        let gate = if class == CommandClass::StateMutating && self.settings().serialize_mutations {
            match self.registry().mutation_gate(key) {
                Some(gate) => Some(gate.lock_owned().await),
                None => None,
            }
        } else {
            None
        };

        let result = match self.client().call(key, &command).await {
            Ok(result) => result,
            Err(failure) => {
                if failure.is_fatal() {
                    self.fail_context(&handle, &failure.error);
                } else if let Some(view) = written {
                    self.registry().discard_view(&handle, &view);
                }
                return Dispatched::done(Err(failure));
            }
        };
        if !self.registry().is_current(&handle) {
            info!("{key}: discarding {} result, context ended meanwhile", command.name());
            return Dispatched::refused(ComputeError::Superseded(key.clone()));
        }

        match class {
            CommandClass::ReadOnly => {
                if command == WorkerCommand::GetSize {
                    let event = BrokerEvent::update_size(key, result.data.clone());
                    self.hub().publish(&key.session, event);
                }
                Dispatched::done(Ok(result))
            }
            CommandClass::ViewDefining => {
                if let Some(ViewUpdate::Overwrite(view)) = view_update(&command) {
                    let event = view_event(key, &view, result.clone());
                    self.hub().publish_except(&key.session, origin, event);
                }
                Dispatched::done(Ok(result))
            }
            CommandClass::StateMutating => {
                let broker = self.clone();
                let size = result.data.clone();
                let trigger = mutated_dimension(&command);
                let fanout = tokio::spawn(async move {
                    let _gate = gate;
                    broker.propagate(&handle, size, trigger.as_deref()).await
                });
                Dispatched { outcome: Ok(result), fanout: Some(fanout) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::broker::testing::{attach, broker, broker_with, drain, key, ready};
    use crate::broker::views::{AggregationSpec, RowOrder, SortOrder};
    use crate::broker::BrokerSettings;

    fn hist(dimension: &str, bins: u32) -> WorkerCommand {
        WorkerCommand::DimensionHist { dimension: dimension.into(), bins }
    }

    #[rstest]
    #[case(WorkerCommand::GetSchema, Some(CommandClass::ReadOnly))]
    #[case(WorkerCommand::DimensionGetMaxMin { dimension: "x".into() }, Some(CommandClass::ReadOnly))]
    #[case(WorkerCommand::DimensionLoad { dimension: "x".into() }, Some(CommandClass::ViewDefining))]
    #[case(WorkerCommand::DimensionHist { dimension: "x".into(), bins: 4 }, Some(CommandClass::ViewDefining))]
    #[case(WorkerCommand::DimensionReset { dimension: "x".into() }, Some(CommandClass::StateMutating))]
    #[case(WorkerCommand::ResetAllFilters, Some(CommandClass::StateMutating))]
    #[case(WorkerCommand::EndConnection, None)]
    fn commands_are_classified(#[case] command: WorkerCommand, #[case] class: Option<CommandClass>) {
        assert_eq!(CommandClass::of(&command), class);
    }

    #[tokio::test]
    async fn commands_need_a_loaded_context() {
        let (broker, transport) = broker();
        let k = key("s", "d");
        let refused = broker.dispatch(&k, WorkerCommand::GetSchema).await;
        assert_eq!(refused.outcome.unwrap_err().error, ComputeError::NoContext(k.clone()));

        broker.init(&k).await.unwrap();
        let refused = broker.dispatch(&k, WorkerCommand::GetSchema).await;
        let failure = refused.outcome.unwrap_err();
        assert_eq!(failure.error, ComputeError::NotLoaded(k.clone()));
        assert!(failure.result.error);
        assert_eq!(transport.count("get_schema"), 0);
    }

    #[tokio::test]
    async fn lifecycle_commands_are_not_dispatched() {
        let (broker, transport) = broker();
        let k = key("s", "d");
        ready(&broker, &k).await;
        let refused = broker.dispatch(&k, WorkerCommand::EndConnection).await;
        assert_eq!(refused.outcome.unwrap_err().error, ComputeError::NotDispatchable("end_connection"));
        assert_eq!(transport.count("end_connection"), 0);
    }

    #[tokio::test]
    async fn read_only_commands_leave_cache_alone() {
        let (broker, transport) = broker();
        let k = key("s", "d");
        ready(&broker, &k).await;
        transport.answer("dimension_get_max_min", "[0,99]&0.01");

        let dispatched = broker
            .dispatch(&k, WorkerCommand::DimensionGetMaxMin { dimension: "x".into() })
            .await;
        assert_eq!(dispatched.outcome.unwrap().data, "[0,99]");
        assert!(dispatched.fanout.is_none());
        assert_eq!(broker.registry().view_count(&k), 0);
    }

    #[tokio::test]
    async fn size_is_published_to_the_session() {
        let (broker, transport) = broker();
        let k = key("s", "d");
        ready(&broker, &k).await;
        let (_, mut rx) = attach(&broker, &k.session);
        transport.answer("get_size", "500&0.01");

        broker.dispatch(&k, WorkerCommand::GetSize).await.outcome.unwrap();
        assert_eq!(drain(&mut rx), vec![BrokerEvent::update_size(&k, "500")]);
    }

    #[tokio::test]
    async fn view_defining_commands_cache_and_publish() {
        let (broker, transport) = broker();
        let k = key("s", "d");
        ready(&broker, &k).await;
        let (issuer, mut issuer_rx) = attach(&broker, &k.session);
        let (_, mut sibling_rx) = attach(&broker, &k.session);
        transport.answer("dimension_hist", "[1,2,3]&0.1");

        let result = broker.dispatch_from(&k, hist("x", 10), Some(issuer)).await.outcome.unwrap();
        assert_eq!(result.data, "[1,2,3]");
        assert_eq!(broker.registry().views(&k), vec![ViewDefinition::Histogram { dimension: "x".into(), bins: 10 }]);
        assert!(drain(&mut issuer_rx).is_empty());
        let events = drain(&mut sibling_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "update_hist");
    }

    #[tokio::test]
    async fn newer_view_definition_overwrites_older() {
        let (broker, _) = broker();
        let k = key("s", "d");
        ready(&broker, &k).await;
        broker.dispatch(&k, hist("x", 10)).await.outcome.unwrap();
        broker.dispatch(&k, hist("x", 25)).await.outcome.unwrap();
        assert_eq!(broker.registry().views(&k), vec![ViewDefinition::Histogram { dimension: "x".into(), bins: 25 }]);
    }

    #[tokio::test]
    async fn repeated_dimension_load_keeps_one_entry() {
        let (broker, transport) = broker();
        let k = key("s", "d");
        ready(&broker, &k).await;
        let load = WorkerCommand::DimensionLoad { dimension: "age".into() };
        broker.dispatch(&k, load.clone()).await.outcome.unwrap();
        broker.dispatch(&k, load).await.outcome.unwrap();
        assert_eq!(broker.registry().view_count(&k), 1);
        assert_eq!(transport.count("dimension_load"), 2);
    }

    #[tokio::test]
    async fn ordering_attaches_to_loaded_slots() {
        let (broker, _) = broker();
        let k = key("s", "d");
        ready(&broker, &k).await;
        let agg = AggregationSpec::from_value(&json!({"amount": ["sum"]}));
        broker
            .dispatch(&k, WorkerCommand::GroupbyLoad { dimension: "region".into(), aggregation: agg.clone() })
            .await
            .outcome
            .unwrap();
        broker
            .dispatch(&k, WorkerCommand::DimensionLoad { dimension: "age".into() })
            .await
            .outcome
            .unwrap();
        let order = RowOrder { sort_order: SortOrder::Top, row_count: Some(5), columns: String::new() };
        broker
            .dispatch(&k, WorkerCommand::DimensionFilterOrder { dimension: "age".into(), order: order.clone() })
            .await
            .outcome
            .unwrap();

        let views = broker.registry().views(&k);
        assert_eq!(views.len(), 2);
        assert!(views.contains(&ViewDefinition::DimensionOrder { dimension: "age".into(), order: Some(order) }));
        assert!(views.contains(&ViewDefinition::GroupOrder { dimension: "region".into(), aggregation: agg, order: None }));
    }

    #[tokio::test]
    async fn mutating_commands_start_fanout() {
        let (broker, transport) = broker();
        let k = key("s", "d");
        ready(&broker, &k).await;
        transport.answer("dimension_filter", "42&0.01");

        let dispatched = broker
            .dispatch(&k, WorkerCommand::filter("y", ">", &json!(3), false))
            .await;
        assert_eq!(dispatched.outcome.unwrap().data, "42");
        assert_eq!(dispatched.fanout.unwrap().await.unwrap(), 0);
        assert_eq!(broker.registry().view_count(&k), 0);
    }

    #[tokio::test]
    async fn fatal_fault_invalidates_and_forces_reinit() {
        let (broker, transport) = broker();
        let k = key("s", "d");
        ready(&broker, &k).await;
        let (_, mut rx) = attach(&broker, &k.session);
        transport.push("dimension_hist", Ok("RuntimeException***out of memory&0.3".into()));

        let failure = broker.dispatch(&k, hist("x", 10)).await.outcome.unwrap_err();
        assert!(failure.is_fatal());
        assert!(broker.registry().handle(&k).is_none());
        assert_eq!(broker.registry().view_count(&k), 0);
        assert_eq!(drain(&mut rx)[0].name(), "session_ended");

        let refused = broker.dispatch(&k, WorkerCommand::GetSchema).await;
        assert_eq!(refused.outcome.unwrap_err().error, ComputeError::NoContext(k.clone()));

        ready(&broker, &k).await;
        assert_eq!(transport.count("init_connection"), 2);
        assert_eq!(transport.count("read_data"), 2);
        assert!(broker.dispatch(&k, WorkerCommand::GetSchema).await.outcome.is_ok());
    }

    #[tokio::test]
    async fn non_fatal_fault_keeps_context() {
        let (broker, transport) = broker();
        let k = key("s", "d");
        ready(&broker, &k).await;
        transport.push("dimension_hist", Ok("KeyException***no column z&0.01".into()));

        let failure = broker.dispatch(&k, hist("z", 10)).await.outcome.unwrap_err();
        assert_eq!(failure.result.data, "no column z");
        assert_eq!(broker.registry().handle(&k).unwrap().state, ContextState::Ready);
    }

    #[tokio::test]
    async fn failed_definition_is_not_replayed() {
        let (broker, transport) = broker();
        let k = key("s", "d");
        ready(&broker, &k).await;
        broker.dispatch(&k, hist("x", 10)).await.outcome.unwrap();
        transport.push("dimension_hist", Ok("KeyException***no column z&0.01".into()));
        transport.push("dimension_load", Ok("KeyException***no column w&0.01".into()));

        assert!(broker.dispatch(&k, hist("z", 10)).await.outcome.is_err());
        assert!(broker
            .dispatch(&k, WorkerCommand::DimensionLoad { dimension: "w".into() })
            .await
            .outcome
            .is_err());
        assert_eq!(broker.registry().views(&k), vec![ViewDefinition::Histogram { dimension: "x".into(), bins: 10 }]);

        let dispatched = broker.dispatch(&k, WorkerCommand::ResetAllFilters).await;
        assert_eq!(dispatched.fanout.unwrap().await.unwrap(), 1);
        assert_eq!(transport.count("dimension_hist"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn results_of_superseded_calls_are_discarded() {
        let (broker, transport) = broker();
        let k = key("s", "d");
        ready(&broker, &k).await;
        let (_, mut rx) = attach(&broker, &k.session);
        transport.delay("dimension_hist", Duration::from_secs(5));

        let inflight = {
            let broker = broker.clone();
            let k = k.clone();
            tokio::spawn(async move { broker.dispatch(&k, hist("x", 10)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        broker.end_session(&k, None).await.unwrap();
        ready(&broker, &k).await;

        let dispatched = inflight.await.unwrap();
        assert_eq!(dispatched.outcome.unwrap_err().error, ComputeError::Superseded(k.clone()));
        assert_eq!(broker.registry().view_count(&k), 0);
        assert!(drain(&mut rx).iter().all(|e| e.name() != "update_hist"));
    }

    #[tokio::test(start_paused = true)]
    async fn serialized_mutations_wait_for_previous_fanout() {
        let settings = BrokerSettings { serialize_mutations: true, ..BrokerSettings::default() };
        let (broker, transport) = broker_with(settings);
        let k = key("s", "d");
        ready(&broker, &k).await;
        broker.dispatch(&k, hist("x", 10)).await.outcome.unwrap();
        transport.delay("dimension_hist", Duration::from_secs(5));

        let first = broker.dispatch(&k, WorkerCommand::filter("y", ">", &json!(1), false)).await;
        let second = {
            let broker = broker.clone();
            let k = k.clone();
            tokio::spawn(async move {
                broker.dispatch(&k, WorkerCommand::filter("y", ">", &json!(2), false)).await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.count("dimension_filter"), 1);

        first.fanout.unwrap().await.unwrap();
        let second = second.await.unwrap();
        second.fanout.unwrap().await.unwrap();
        assert_eq!(
            transport.commands()[transport.commands().len() - 4..],
            ["dimension_filter", "dimension_hist", "dimension_filter", "dimension_hist"]
        );
    }
}
