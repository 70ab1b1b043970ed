//! JSON framing of the client-facing WebSocket surface.
//!
//! Client → broker: `{"id": 7, "event": "dimension_get_hist", "args": {...}}`.
//! Broker → client: replies `{"id": 7, "error": false, "payload": {...}}` and
//! pushed events `{"event": "update_hist", "args": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::events::Outbound;
use crate::broker::key::WorkerKind;
use crate::broker::views::{value_text, AggregationSpec, GroupRowOrder, RowOrder, SortOrder};
use crate::broker::wire::WorkerCommand;
use crate::broker::QueryResult;
use crate::error::{BrokerError, Result};

const DEFAULT_LOAD_TYPE: &str = "arrow";

// ── Inbound ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id:    Option<u64>,
    pub event: String,
    #[serde(default)]
    pub args:  Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode `args` according to `event`.
    pub fn request(&self) -> Result<ClientRequest> {
        let args = || -> Value {
            match &self.args {
                Value::Null => Value::Object(Default::default()),
                other => other.clone(),
            }
        };
        let request = match self.event.as_str() {
            "init" => {
                let a: InitArgs = serde_json::from_value(args())?;
                ClientRequest::Init { target: a.target, use_sessions: a.use_sessions }
            }
            "load_data" => {
                let a: LoadArgs = serde_json::from_value(args())?;
                ClientRequest::LoadData { target: a.target, load_type: a.load_type }
            }
            "endSession" => {
                let target: Target = serde_json::from_value(args())?;
                ClientRequest::EndSession { target }
            }
            "get_schema" => data(serde_json::from_value(args())?, WorkerCommand::GetSchema),
            "size" => data(serde_json::from_value(args())?, WorkerCommand::GetSize),
            "reset_all_filters" => data(serde_json::from_value(args())?, WorkerCommand::ResetAllFilters),
            "dimension_load" => {
                let a: DimensionArgs = serde_json::from_value(args())?;
                data(a.target, WorkerCommand::DimensionLoad { dimension: a.dimension_name })
            }
            "dimension_reset_filters" => {
                let a: DimensionArgs = serde_json::from_value(args())?;
                data(a.target, WorkerCommand::DimensionReset { dimension: a.dimension_name })
            }
            "dimension_get_max_min" => {
                let a: DimensionArgs = serde_json::from_value(args())?;
                data(a.target, WorkerCommand::DimensionGetMaxMin { dimension: a.dimension_name })
            }
            "dimension_filter" => {
                let a: FilterArgs = serde_json::from_value(args())?;
                let command = WorkerCommand::filter(&a.dimension_name, &a.comparison, &a.value, a.pre_reset);
                data(a.target, command)
            }
            "dimension_filter_range" => {
                let a: RangeArgs = serde_json::from_value(args())?;
                let command = WorkerCommand::filter_range(
                    &a.dimension_name,
                    &a.range_min,
                    &a.range_max,
                    a.pre_reset,
                );
                data(a.target, command)
            }
            "dimension_filter_order" => {
                let a: OrderArgs = serde_json::from_value(args())?;
                let order = RowOrder {
                    sort_order: a.sort_order,
                    row_count:  row_count(a.sort_order, a.num_rows)?,
                    columns:    a.columns.as_ref().map(value_text).unwrap_or_default(),
                };
                data(a.target, WorkerCommand::DimensionFilterOrder { dimension: a.dimension_name, order })
            }
            "dimension_get_hist" => {
                let a: HistArgs = serde_json::from_value(args())?;
                if a.num_of_bins == 0 {
                    return Err(BrokerError::Request("num_of_bins must be at least 1".into()));
                }
                data(a.target, WorkerCommand::DimensionHist { dimension: a.dimension_name, bins: a.num_of_bins })
            }
            "groupby_load" => {
                let a: GroupArgs = serde_json::from_value(args())?;
                let aggregation = AggregationSpec::from_value(&a.agg);
                data(a.target, WorkerCommand::GroupbyLoad { dimension: a.dimension_name, aggregation })
            }
            "groupby_filter_order" => {
                let a: GroupOrderArgs = serde_json::from_value(args())?;
                let order = GroupRowOrder {
                    sort_order:  a.sort_order,
                    row_count:   row_count(a.sort_order, a.num_rows)?,
                    sort_column: a.sort_column,
                };
                let aggregation = AggregationSpec::from_value(&a.agg);
                data(a.target, WorkerCommand::GroupbyFilterOrder {
                    dimension: a.dimension_name,
                    aggregation,
                    order,
                })
            }
            other => return Err(BrokerError::Request(format!("unknown event `{other}`"))),
        };
        Ok(request)
    }
}

fn data(target: Target, command: WorkerCommand) -> ClientRequest {
    ClientRequest::Data { target, command }
}

/// `top` and `bottom` need a row count; `all` ignores a missing one.
fn row_count(order: SortOrder, num_rows: Option<u32>) -> Result<Option<u32>> {
    match (order, num_rows) {
        (SortOrder::All, n) => Ok(n),
        (_, Some(n)) => Ok(Some(n)),
        (order, None) => Err(BrokerError::Request(format!(
            "num_rows is required for sort_order `{}`",
            order.as_str()
        ))),
    }
}

/// Dataset and worker a request is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Target {
    pub dataset: String,
    pub engine:  String,
}

impl Target {
    pub fn worker(&self) -> WorkerKind { WorkerKind::new(&self.engine) }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Init { target: Target, use_sessions: bool },
    LoadData { target: Target, load_type: String },
    EndSession { target: Target },
    Data { target: Target, command: WorkerCommand },
}

impl ClientRequest {
    pub fn target(&self) -> &Target {
        match self {
            ClientRequest::Init { target, .. }
            | ClientRequest::LoadData { target, .. }
            | ClientRequest::EndSession { target }
            | ClientRequest::Data { target, .. } => target,
        }
    }
}

fn yes() -> bool { true }

fn default_load_type() -> String { DEFAULT_LOAD_TYPE.to_string() }

#[derive(Deserialize)]
struct InitArgs {
    #[serde(flatten)]
    target:       Target,
    #[serde(default = "yes")]
    use_sessions: bool,
}

#[derive(Deserialize)]
struct LoadArgs {
    #[serde(flatten)]
    target:    Target,
    #[serde(default = "default_load_type")]
    load_type: String,
}

#[derive(Deserialize)]
struct DimensionArgs {
    #[serde(flatten)]
    target:         Target,
    dimension_name: String,
}

#[derive(Deserialize)]
struct FilterArgs {
    #[serde(flatten)]
    target:         Target,
    dimension_name: String,
    comparison:     String,
    value:          Value,
    #[serde(default)]
    pre_reset:      bool,
}

#[derive(Deserialize)]
struct RangeArgs {
    #[serde(flatten)]
    target:         Target,
    dimension_name: String,
    range_min:      Value,
    range_max:      Value,
    #[serde(default)]
    pre_reset:      bool,
}

#[derive(Deserialize)]
struct OrderArgs {
    #[serde(flatten)]
    target:         Target,
    sort_order:     SortOrder,
    dimension_name: String,
    #[serde(default)]
    num_rows:       Option<u32>,
    #[serde(default)]
    columns:        Option<Value>,
}

#[derive(Deserialize)]
struct HistArgs {
    #[serde(flatten)]
    target:         Target,
    dimension_name: String,
    num_of_bins:    u32,
}

#[derive(Deserialize)]
struct GroupArgs {
    #[serde(flatten)]
    target:         Target,
    dimension_name: String,
    agg:            Value,
}

#[derive(Deserialize)]
struct GroupOrderArgs {
    #[serde(flatten)]
    target:         Target,
    sort_order:     SortOrder,
    dimension_name: String,
    #[serde(default)]
    num_rows:       Option<u32>,
    sort_column:    String,
    agg:            Value,
}

// ── Outbound ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ReplyFrame<'a> {
    id:      Option<u64>,
    error:   bool,
    payload: &'a QueryResult,
}

/// Render one outbound message as a text frame.
pub fn encode(out: &Outbound) -> Result<String> {
    let text = match out {
        Outbound::Reply { id, result } => serde_json::to_string(&ReplyFrame {
            id:      *id,
            error:   result.error,
            payload: result,
        })?,
        Outbound::Event(event) => serde_json::to_string(event)?,
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::broker::events::BrokerEvent;

    fn request(text: &str) -> Result<ClientRequest> {
        Envelope::parse(text)?.request()
    }

    fn target() -> Target {
        Target { dataset: "sales".into(), engine: "cudf".into() }
    }

    #[test]
    fn init_defaults_to_per_client_sessions() {
        let req = request(r#"{"id":1,"event":"init","args":{"dataset":"sales","engine":"cudf"}}"#).unwrap();
        assert_eq!(req, ClientRequest::Init { target: target(), use_sessions: true });

        let req = request(
            r#"{"event":"init","args":{"dataset":"sales","engine":"cudf","use_sessions":false}}"#,
        )
        .unwrap();
        assert_eq!(req, ClientRequest::Init { target: target(), use_sessions: false });
    }

    #[test]
    fn load_data_defaults_load_type() {
        let req = request(r#"{"event":"load_data","args":{"dataset":"sales","engine":"cudf"}}"#).unwrap();
        assert_eq!(req, ClientRequest::LoadData { target: target(), load_type: "arrow".into() });
    }

    #[test]
    fn range_filter_maps_to_worker_command() {
        let req = request(
            r#"{"id":3,"event":"dimension_filter_range","args":{"dataset":"sales","engine":"cudf",
                "dimension_name":"y","range_min":10,"range_max":20,"pre_reset":true}}"#,
        )
        .unwrap();
        assert_eq!(req, ClientRequest::Data {
            target: target(),
            command: WorkerCommand::DimensionFilterRange {
                dimension: "y".into(),
                min:       "10".into(),
                max:       "20".into(),
                pre_reset: true,
            },
        });
    }

    #[test]
    fn group_order_carries_aggregation_and_order() {
        let req = request(
            r#"{"event":"groupby_filter_order","args":{"dataset":"sales","engine":"cudf",
                "sort_order":"bottom","dimension_name":"region","num_rows":3,
                "sort_column":"amount","agg":{"amount":["sum"]}}}"#,
        )
        .unwrap();
        match req {
            ClientRequest::Data { command: WorkerCommand::GroupbyFilterOrder { aggregation, order, .. }, .. } => {
                assert_eq!(aggregation.key(), "amount:sum");
                assert_eq!(order.sort_order, SortOrder::Bottom);
                assert_eq!(order.row_count, Some(3));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[rstest]
    #[case(r#"{"event":"dimension_filter_order","args":{"dataset":"d","engine":"cudf","sort_order":"top","dimension_name":"x"}}"#)]
    #[case(r#"{"event":"dimension_get_hist","args":{"dataset":"d","engine":"cudf","dimension_name":"x","num_of_bins":0}}"#)]
    #[case(r#"{"event":"dimension_filter","args":{"dataset":"d","engine":"cudf","dimension_name":"x"}}"#)]
    #[case(r#"{"event":"explode","args":{}}"#)]
    #[case(r#"{"event":"size"}"#)]
    fn invalid_requests_are_rejected(#[case] text: &str) {
        assert!(request(text).is_err());
    }

    #[test]
    fn ordering_all_without_row_count_is_accepted() {
        let req = request(
            r#"{"event":"dimension_filter_order","args":{"dataset":"sales","engine":"cudf",
                "sort_order":"all","dimension_name":"x","columns":["a","b"]}}"#,
        )
        .unwrap();
        let ClientRequest::Data { command: WorkerCommand::DimensionFilterOrder { order, .. }, .. } = req else {
            panic!("unexpected request");
        };
        assert_eq!(order.row_count, None);
        assert_eq!(order.columns, "a,b");
    }

    #[test]
    fn replies_and_events_are_framed() {
        let reply = Outbound::Reply { id: Some(4), result: QueryResult::failure("boom", 0.0, 0.5) };
        let value: Value = serde_json::from_str(&encode(&reply).unwrap()).unwrap();
        assert_eq!(value, json!({
            "id": 4,
            "error": true,
            "payload": { "data": "boom", "computeTime": 0.0, "brokerTime": 0.5 }
        }));

        let event = Outbound::Event(BrokerEvent::AllUpdatesComplete { dataset: "d".into(), engine: "cudf".into() });
        let value: Value = serde_json::from_str(&encode(&event).unwrap()).unwrap();
        assert_eq!(value, json!({ "event": "all_updates_complete", "args": { "dataset": "d", "engine": "cudf" } }));
    }
}
