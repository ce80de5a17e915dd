use crate::config::config_holder::PathPrefixes;
use crate::config::toml::ConfigToml;
use crate::config::toml::log::{AppenderCommon, LoggingStyle};
use anyhow::Context as _;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(style: LoggingStyle, common: AppenderCommon, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let env_filter = common.level.0;
    // Code repetition because of https://github.com/tokio-rs/tracing/issues/575
    match style {
        LoggingStyle::Plain => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(common.target)
            .with_span_events(common.span.into())
            .with_filter(env_filter)
            .boxed(),
        LoggingStyle::PlainCompact => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(common.target)
            .with_span_events(common.span.into())
            .with_filter(env_filter)
            .boxed(),
        LoggingStyle::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(common.target)
            .with_span_events(common.span.into())
            .with_filter(env_filter)
            .boxed(),
    }
}

/// Install the global subscriber. Log sections are taken out of `config`.
pub(crate) fn init(config: &mut ConfigToml, path_prefixes: &PathPrefixes) -> Result<Guard, anyhow::Error> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if let Some(stdout) = config.log.stdout.take()
        && stdout.enabled
    {
        layers.push(fmt_layer(stdout.style, stdout.common, std::io::stdout, true));
    }
    let mut file_guard = None;
    if let Some(file) = config.log.file.take() {
        let directory = path_prefixes.replace_path_prefix(&file.directory);
        let appender = tracing_appender::rolling::Builder::new()
            .rotation(file.rotation.into())
            .filename_prefix(&file.prefix)
            .build(&directory)
            .with_context(|| format!("cannot create the log file appender in {directory:?}"))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        layers.push(fmt_layer(file.style, file.common, writer, false));
    }

    tracing_subscriber::registry().with(layers).init();
    std::panic::set_hook(Box::new(utils::tracing_panic_hook));
    Ok(Guard {
        _file_guard: file_guard,
    })
}

/// Flushes the file appender when dropped.
pub(crate) struct Guard {
    _file_guard: Option<WorkerGuard>,
}
