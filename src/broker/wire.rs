//! Compute-worker wire format.
//!
//! Requests are a command name plus `key=value` pairs; the transport decides
//! how they travel (the HTTP transport sends `GET /<command>?<pairs>`).
//! Replies are a delimited record `payload<d>elapsed[<d>extra...]` where
//! `elapsed` is the worker-side compute time in seconds. A payload containing
//! [`EXCEPTION_MARKER`] is a failure; when it also names a fatal condition the
//! worker has lost the context and the broker must invalidate it.

use super::key::SessionKey;
use super::views::{value_text, AggregationSpec, GroupRowOrder, RowOrder};
use super::ComputeError;

/// Substring that marks a reply payload as a worker-side exception.
pub const EXCEPTION_MARKER: &str = "Exception";

/// Separator between the exception name and its human-readable message.
const EXCEPTION_DETAIL_SEPARATOR: &str = "***";

/// Payload substrings that mean accelerator memory is exhausted or the
/// runtime is in an unrecoverable state.
pub const FATAL_MARKERS: &[&str] = &["out of memory", "thrust::system::system_error"];

pub const DEFAULT_DELIMITER: &str = "&";

// ── Commands ──────────────────────────────────────────────────────────────────

/// Every command the broker sends to a compute worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    InitConnection,
    ReadData { load_type: String },
    GetSchema,
    GetSize,
    DimensionLoad { dimension: String },
    DimensionFilter {
        dimension:  String,
        comparison: String,
        value:      String,
        pre_reset:  bool,
    },
    DimensionFilterRange {
        dimension: String,
        min:       String,
        max:       String,
        pre_reset: bool,
    },
    DimensionReset { dimension: String },
    DimensionFilterOrder { dimension: String, order: RowOrder },
    DimensionHist { dimension: String, bins: u32 },
    DimensionGetMaxMin { dimension: String },
    GroupbyLoad { dimension: String, aggregation: AggregationSpec },
    GroupbyFilterOrder {
        dimension:   String,
        aggregation: AggregationSpec,
        order:       GroupRowOrder,
    },
    ResetAllFilters,
    EndConnection,
}

impl WorkerCommand {
    /// Name of the worker route for this command.
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::InitConnection            => "init_connection",
            WorkerCommand::ReadData { .. }           => "read_data",
            WorkerCommand::GetSchema                 => "get_schema",
            WorkerCommand::GetSize                   => "get_size",
            WorkerCommand::DimensionLoad { .. }      => "dimension_load",
            WorkerCommand::DimensionFilter { .. }    => "dimension_filter",
            WorkerCommand::DimensionFilterRange { .. } => "dimension_filter_range",
            WorkerCommand::DimensionReset { .. }     => "dimension_reset",
            WorkerCommand::DimensionFilterOrder { .. } => "dimension_filter_order",
            WorkerCommand::DimensionHist { .. }      => "dimension_hist",
            WorkerCommand::DimensionGetMaxMin { .. } => "dimension_get_max_min",
            WorkerCommand::GroupbyLoad { .. }        => "groupby_load",
            WorkerCommand::GroupbyFilterOrder { .. } => "groupby_filter_order",
            WorkerCommand::ResetAllFilters           => "reset_all_filters",
            WorkerCommand::EndConnection             => "end_connection",
        }
    }

    /// Command-specific request fields, in a stable order.
    fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            WorkerCommand::InitConnection
            | WorkerCommand::GetSchema
            | WorkerCommand::GetSize
            | WorkerCommand::ResetAllFilters
            | WorkerCommand::EndConnection => Vec::new(),
            WorkerCommand::ReadData { load_type } => vec![("load_type", load_type.clone())],
            WorkerCommand::DimensionLoad { dimension }
            | WorkerCommand::DimensionReset { dimension }
            | WorkerCommand::DimensionGetMaxMin { dimension } => {
                vec![("dimension_name", dimension.clone())]
            }
            WorkerCommand::DimensionFilter { dimension, comparison, value, pre_reset } => vec![
                ("dimension_name",       dimension.clone()),
                ("comparison_operation", comparison.clone()),
                ("value",                value.clone()),
                ("pre_reset",            pre_reset.to_string()),
            ],
            WorkerCommand::DimensionFilterRange { dimension, min, max, pre_reset } => vec![
                ("dimension_name", dimension.clone()),
                ("min_value",      min.clone()),
                ("max_value",      max.clone()),
                ("pre_reset",      pre_reset.to_string()),
            ],
            WorkerCommand::DimensionFilterOrder { dimension, order } => {
                let mut fields = vec![
                    ("dimension_name", dimension.clone()),
                    ("sort_order",     order.sort_order.as_str().to_string()),
                ];
                if let Some(n) = order.row_count {
                    fields.push(("num_rows", n.to_string()));
                }
                fields.push(("columns", order.columns.clone()));
                fields
            }
            WorkerCommand::DimensionHist { dimension, bins } => vec![
                ("dimension_name", dimension.clone()),
                ("num_of_bins",    bins.to_string()),
            ],
            WorkerCommand::GroupbyLoad { dimension, aggregation } => vec![
                ("dimension_name", dimension.clone()),
                ("groupby_agg",    aggregation.wire().to_string()),
            ],
            WorkerCommand::GroupbyFilterOrder { dimension, aggregation, order } => {
                let mut fields = vec![
                    ("dimension_name", dimension.clone()),
                    ("groupby_agg",    aggregation.wire().to_string()),
                    ("sort_order",     order.sort_order.as_str().to_string()),
                ];
                if let Some(n) = order.row_count {
                    fields.push(("num_rows", n.to_string()));
                }
                fields.push(("sort_column", order.sort_column.clone()));
                fields
            }
        }
    }

    /// Build a filter command from client-supplied JSON values.
    pub fn filter(
        dimension:  &str,
        comparison: &str,
        value:      &serde_json::Value,
        pre_reset:  bool,
    ) -> Self {
        WorkerCommand::DimensionFilter {
            dimension:  dimension.to_string(),
            comparison: comparison.to_string(),
            value:      value_text(value),
            pre_reset,
        }
    }

    /// Build a range filter command from client-supplied JSON values.
    pub fn filter_range(
        dimension: &str,
        min:       &serde_json::Value,
        max:       &serde_json::Value,
        pre_reset: bool,
    ) -> Self {
        WorkerCommand::DimensionFilterRange {
            dimension: dimension.to_string(),
            min:       value_text(min),
            max:       value_text(max),
            pre_reset,
        }
    }
}

/// Full `key=value` request for `command` against the context `key`.
pub fn encode_request(key: &SessionKey, command: &WorkerCommand) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = command
        .fields()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    pairs.push(("session_id".into(), key.session.as_str().to_string()));
    pairs.push(("dataset".into(),    key.dataset.clone()));
    pairs.push(("engine".into(),     key.worker.as_str().to_string()));
    pairs
}

// ── Replies ───────────────────────────────────────────────────────────────────

/// A successfully decoded, non-exception reply.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReply {
    pub payload:         String,
    pub compute_seconds: f64,
    /// Fields after the elapsed time; the first one carries active filters.
    pub extras:          Vec<String>,
}

impl WorkerReply {
    pub fn active_filters(&self) -> Option<&str> {
        self.extras.first().map(String::as_str)
    }
}

/// Splits worker replies on a fixed delimiter.
#[derive(Debug, Clone)]
pub struct ReplyCodec {
    delimiter: String,
}

impl Default for ReplyCodec {
    fn default() -> Self { ReplyCodec::new(DEFAULT_DELIMITER) }
}

impl ReplyCodec {
    pub fn new(delimiter: impl Into<String>) -> Self {
        ReplyCodec { delimiter: delimiter.into() }
    }

    /// Decode `body`, classifying exception payloads as faults.
    ///
    /// The compute time of a failed call is returned alongside the error when
    /// it could be read, so callers can still account for it.
    pub fn decode(&self, body: &str) -> std::result::Result<WorkerReply, (ComputeError, f64)> {
        let mut fields = body.split(self.delimiter.as_str());
        let payload = fields.next().unwrap_or_default().to_string();
        let elapsed = fields.next().map(str::trim);
        let extras: Vec<String> = fields.map(str::to_string).collect();

        let compute_seconds = elapsed.and_then(|e| e.parse::<f64>().ok());

        if payload.contains(EXCEPTION_MARKER) {
            return Err((classify_exception(&payload), compute_seconds.unwrap_or(0.0)));
        }

        match compute_seconds {
            Some(compute_seconds) if compute_seconds.is_finite() => Ok(WorkerReply {
                payload,
                compute_seconds: compute_seconds.max(0.0),
                extras,
            }),
            _ => Err((
                ComputeError::Protocol(format!(
                    "expected `payload{d}elapsed`, got {} bytes without a valid elapsed field",
                    body.len(),
                    d = self.delimiter
                )),
                0.0,
            )),
        }
    }
}

/// Turn an exception payload into a fault, flagging it fatal when it names an
/// unrecoverable worker condition.
pub fn classify_exception(payload: &str) -> ComputeError {
    let message = payload
        .split_once(EXCEPTION_DETAIL_SEPARATOR)
        .map_or(payload, |(_, detail)| detail)
        .trim()
        .to_string();
    let fatal = is_fatal(payload);
    ComputeError::Fault { message, fatal }
}

pub fn is_fatal(text: &str) -> bool {
    FATAL_MARKERS.iter().any(|marker| text.contains(marker))
}
