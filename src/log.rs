//! Installation of the global tracing subscriber.

use std::sync::Once;

use tracing_subscriber::{
    fmt::{
        format::{DefaultFields, Format},
        writer::BoxMakeWriter,
        SubscriberBuilder,
    },
    EnvFilter,
};

use crate::config::{LogConfig, LogFormat};

static INIT: Once = Once::new();

type Subscriber = Box<dyn tracing::Subscriber + Send + Sync>;

/// Installs the subscriber described by `config`. Only the first call has an effect.
///
/// `RUST_LOG`, when set, takes precedence over the configured level. Log lines go to stderr so
/// that stdout carries only the result.
pub fn init(config: &LogConfig) {
    INIT.call_once(|| {
        let subscriber = set_format(config, builder(config));
        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("could not install the tracing subscriber: {e}");
        }
    });
}

/// A subscriber builder filtered according to `config`, writing to stderr.
pub fn builder(
    config: &LogConfig,
) -> SubscriberBuilder<DefaultFields, Format, EnvFilter, BoxMakeWriter> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(std::io::stderr))
}

/// Finishes `builder` in the configured output format.
pub fn set_format(
    config: &LogConfig,
    builder: SubscriberBuilder<DefaultFields, Format, EnvFilter, BoxMakeWriter>,
) -> Subscriber {
    match config.format {
        LogFormat::Pretty => Box::new(builder.pretty().finish()),
        LogFormat::Json => Box::new(builder.json().finish()),
    }
}
