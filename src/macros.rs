// Level-gated logging for the builder and reader/writers. `$src` is anything with a
// `config()` accessor returning a `BuilderConfig`.

#[macro_export]
macro_rules! builder_log {
    ($src:expr, $($format:tt)*) => {
        if $src.config().summary_enabled() {
            ::tracing::debug!(target: "genmeta::builder", $($format)*)
        }
    }
}

#[macro_export]
macro_rules! builder_trace {
    ($src:expr, $($format:tt)*) => {
        if $src.config().verbose_enabled() {
            ::tracing::trace!(target: "genmeta::builder", $($format)*)
        }
    }
}

#[macro_export]
macro_rules! validation_log {
    ($config:expr, failure, $($format:tt)*) => {
        ::tracing::error!(target: "genmeta::validate", $($format)*)
    };
    ($config:expr, $($format:tt)*) => {
        if $config.verbose_enabled() {
            ::tracing::info!(target: "genmeta::validate", $($format)*)
        }
    };
}
