//! Custom logging configuration for clean console output
//!
//! A custom tracing formatter that only shows `file:line` information for
//! ERROR and WARN levels, where the code location actually helps, and
//! keeps everything else quiet. Production-intent INFO/DEBUG logs in this
//! codebase carry emoji markers; logs without one are temporary debugging
//! aids and should not survive a commit.
//!
//! sled's verbose internals are filtered to warn level; consensus traffic
//! is noisy enough on its own.

use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, SubscriberBuilder};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Custom formatter that conditionally shows file:line only for ERROR and WARN levels
pub struct ConditionalLocationFormatter;

impl<S, N> FormatEvent<S, N> for ConditionalLocationFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = metadata.level();

        write!(&mut writer, "{}", level)?;

        // Only show module target and file:line for ERROR and WARN levels
        if matches!(level, &Level::ERROR | &Level::WARN) {
            write!(&mut writer, " {}", metadata.target())?;
            if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
                write!(&mut writer, " {}:{}", file, line)?;
            }
        }

        write!(&mut writer, ": ")?;

        // Format all the spans in the event's span context
        if let Some(scope) = ctx.event_scope() {
            let mut first = true;
            for span in scope.from_root() {
                if !first {
                    write!(&mut writer, ":")?;
                }
                first = false;
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<tracing_subscriber::fmt::FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
            }
            write!(writer, " ")?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Env filter honoring RUST_LOG, with sled's internals quieted
pub fn create_base_env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level))
        .add_directive("sled=warn".parse().unwrap())
        .add_directive("pagecache=warn".parse().unwrap())
}

/// Subscriber builder with the conditional-location formatter applied
pub fn create_subscriber_builder(
    env_filter: EnvFilter,
) -> SubscriberBuilder<
    tracing_subscriber::fmt::format::DefaultFields,
    ConditionalLocationFormatter,
    EnvFilter,
> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(ConditionalLocationFormatter)
}

/// Initialize the tracing subscriber with custom formatting
pub fn init_logging() {
    create_subscriber_builder(create_base_env_filter("info")).init();
}
