//! Agent diagnostics on standard error.
//!
//! Diagnostics go through `tracing` and come out as
//!
//! ```text
//! >>> DebugAgent DEBUG: Instrumenting java.net.InetAddress
//! >>> DebugAgent ERROR: Failed to instrument class java.net.Socket, method ... : no such method
//! ```
//!
//! The per-call lines are printed by the instrumented bytecode itself and
//! never pass through here.

use std::fmt;
use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{FmtContext, MakeWriter};
use tracing_subscriber::registry::LookupSpan;

/// Renders an event as a single `>>> DebugAgent <LEVEL>: <message>` line.
pub struct DiagnosticFormat;

impl<S, N> FormatEvent<S, N> for DiagnosticFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let label = match *event.metadata().level() {
            Level::ERROR | Level::WARN => "ERROR",
            _ => "DEBUG",
        };
        write!(writer, ">>> DebugAgent {label}: ")?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn max_level(debug: bool) -> LevelFilter {
    if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::ERROR
    }
}

/// Builds the diagnostic subscriber over any writer.
pub fn subscriber<W>(debug: bool, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_max_level(max_level(debug))
        .event_format(DiagnosticFormat)
        .with_writer(writer)
        .finish()
}

/// Installs the standard error subscriber. A subscriber that is already
/// installed, for example by a second agent in the same library, is kept.
pub fn init(debug: bool) {
    let _ = tracing::subscriber::set_global_default(subscriber(debug, std::io::stderr));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::{debug, error, info};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn debug_mode_prints_both_levels() {
        let out = Captured::default();
        tracing::subscriber::with_default(subscriber(true, out.clone()), || {
            debug!("Instrumenting {}", "java.net.InetAddress");
            error!("Failed to instrument class {} : {}", "a.B", "broken");
        });
        assert_eq!(
            out.text(),
            ">>> DebugAgent DEBUG: Instrumenting java.net.InetAddress\n\
             >>> DebugAgent ERROR: Failed to instrument class a.B : broken\n"
        );
    }

    #[test]
    fn errors_only_without_debug() {
        let out = Captured::default();
        tracing::subscriber::with_default(subscriber(false, out.clone()), || {
            debug!("hidden");
            info!("hidden too");
            error!("shown");
        });
        assert_eq!(out.text(), ">>> DebugAgent ERROR: shown\n");
    }
}
