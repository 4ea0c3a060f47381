//! Metrics/tracing hooks.
//!
//! Kept dependency-light: events go to `tracing` and can be exported by
//! whatever subscriber the binary installs.

pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::span!(tracing::Level::TRACE, "coplace", event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%event, %k, %v, "metric");
    }
}
