//! Replay-safe logging for orchestration code.
//!
//! Each macro takes an [`OrchestrationContext`](crate::OrchestrationContext) first and is
//! silent while the context replays recorded steps, so a message is emitted once per
//! instance rather than once per turn. The remaining arguments are passed to `tracing`
//! unchanged; `instance_id` and `turn_idx` fields are added.

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(instance_id = %$ctx.instance_id(), turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(instance_id = %$ctx.instance_id(), turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(instance_id = %$ctx.instance_id(), turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::debug!(instance_id = %$ctx.instance_id(), turn_idx = $ctx.turn_index(), $($arg)+);
        }
    }};
}
