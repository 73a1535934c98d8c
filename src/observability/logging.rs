//! Structured logging.
//!
//! JSON lines for production, pretty output for development. The level comes
//! from config and `RUST_LOG` wins when set.
//!
//! Every JSON line is one flat object:
//!
//! ```text
//! {"level":"INFO","time":"..","service":"orders","correlation_id":"..",
//!  "trace_id":"..","span_id":"..", <event fields>, "target":"..","msg":".."}
//! ```
//!
//! Fields recorded on the enclosing spans are lifted to the top level, outer
//! spans first, so the request span's ids land on every line emitted while it
//! is entered. Event fields win over span fields of the same name.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{JsonFields, Writer};
use tracing_subscriber::fmt::time::{FormatTime, SystemTime};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt as subscriber_fmt, EnvFilter};

use crate::config::LogFormat;

/// Install the global subscriber.
pub fn init_logging(service: &str, level: &str, format: LogFormat) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer(service, std::io::stdout))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(subscriber_fmt::layer())
            .try_init(),
    }
}

/// The JSON line layer, writing to `writer`.
pub fn json_layer<S, W>(
    service: &str,
    writer: W,
) -> subscriber_fmt::Layer<S, JsonFields, JsonLineFormat, W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    subscriber_fmt::layer()
        .fmt_fields(JsonFields::new())
        .event_format(JsonLineFormat::new(service))
        .with_writer(writer)
}

/// Formats each event as a single flat JSON object.
#[derive(Debug, Clone)]
pub struct JsonLineFormat {
    service: Arc<str>,
}

impl JsonLineFormat {
    pub fn new(service: &str) -> Self {
        Self {
            service: Arc::from(service),
        }
    }
}

impl<S, N> FormatEvent<S, N> for JsonLineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let mut record = Map::new();

        let mut time = String::new();
        SystemTime.format_time(&mut Writer::new(&mut time))?;

        record.insert("level".into(), Value::from(meta.level().to_string()));
        record.insert("time".into(), Value::from(time));
        record.insert("service".into(), Value::from(&*self.service));

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                let extensions = span.extensions();
                let Some(fields) = extensions.get::<FormattedFields<N>>() else {
                    continue;
                };
                // Spans without fields store an empty string.
                if let Ok(Value::Object(fields)) = serde_json::from_str(&fields.fields) {
                    record.extend(fields);
                }
            }
        }

        event.record(&mut RecordVisitor(&mut record));
        record.insert("target".into(), Value::from(meta.target()));

        let line = serde_json::to_string(&record).map_err(|_| fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

/// Collects event fields, renaming `message` to `msg`.
struct RecordVisitor<'a>(&'a mut Map<String, Value>);

impl RecordVisitor<'_> {
    fn put(&mut self, field: &Field, value: Value) {
        let key = match field.name() {
            "message" => "msg",
            name => name,
        };
        self.0.insert(key.to_owned(), value);
    }
}

impl Visit for RecordVisitor<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::from(format!("{value:?}")));
    }
}
