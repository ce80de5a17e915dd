use super::config_holder::{DATA_DIR_PREFIX, FileOrFolder, PathPrefixes};
use concepts::WorkspaceId;
use db_sqlite::SqliteConfig;
use hashbrown::HashMap;
use log::LoggingConfig;
use notifier::NotifierConfig;
use serde::Deserialize;
use serde_with::serde_as;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SQLITE_FILE_IF_PROJECT_DIRS: &str =
    const_format::formatcp!("{}board-notify.sqlite", DATA_DIR_PREFIX);
const DEFAULT_SQLITE_FILE: &str = "board-notify.sqlite";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConfigToml {
    #[serde(default)]
    pub(crate) sqlite: SqliteConfigToml,
    #[serde(default)]
    pub(crate) notifier: NotifierConfigToml,
    #[serde(default)]
    pub(crate) delivery: DeliveryConfigToml,
    #[serde(default)]
    pub(crate) log: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct SqliteConfigToml {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    queue_capacity: Option<usize>,
    #[serde(default)]
    pragma: Option<HashMap<String, String>>,
}

impl SqliteConfigToml {
    pub(crate) async fn get_sqlite_file(
        &self,
        path_prefixes: &PathPrefixes,
    ) -> Result<PathBuf, anyhow::Error> {
        let sqlite_file = self.file.as_deref().unwrap_or_else(|| {
            if path_prefixes.project_dirs.is_some() {
                DEFAULT_SQLITE_FILE_IF_PROJECT_DIRS
            } else {
                DEFAULT_SQLITE_FILE
            }
        });
        path_prefixes
            .replace_path_prefix_mkdir(sqlite_file, FileOrFolder::File)
            .await
    }

    pub(crate) fn as_config(&self) -> SqliteConfig {
        let def = SqliteConfig::default();
        SqliteConfig {
            queue_capacity: self.queue_capacity.unwrap_or(def.queue_capacity),
            pragma_override: self.pragma.clone(),
        }
    }
}

/// Every field falls back to the defaults of [`NotifierConfig`].
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct NotifierConfigToml {
    #[serde(default)]
    notify_freq: Option<DurationConfig>,
    #[serde(default)]
    hint_queue_size: Option<usize>,
    #[serde(default)]
    enqueue_timeout: Option<DurationConfig>,
    #[serde(default)]
    idle_sleep: Option<DurationConfig>,
    #[serde(default)]
    error_retry_sleep: Option<DurationConfig>,
    #[serde(default)]
    resolution_retries: Option<u32>,
    #[serde(default)]
    resolution_retry_backoff: Option<DurationConfig>,
    /// Only process hints of this workspace.
    #[serde(default)]
    workspace: Option<String>,
    #[serde(default)]
    server_root: Option<String>,
    #[serde(default)]
    language: Option<String>,
}

impl NotifierConfigToml {
    pub(crate) fn as_config(&self) -> NotifierConfig {
        let def = NotifierConfig::default();
        let duration = |value: Option<DurationConfig>, default: Duration| {
            value.map_or(default, Duration::from)
        };
        NotifierConfig {
            notify_freq: duration(self.notify_freq, def.notify_freq),
            hint_queue_size: self.hint_queue_size.unwrap_or(def.hint_queue_size),
            enqueue_timeout: duration(self.enqueue_timeout, def.enqueue_timeout),
            idle_sleep: duration(self.idle_sleep, def.idle_sleep),
            error_retry_sleep: duration(self.error_retry_sleep, def.error_retry_sleep),
            resolution_retries: self.resolution_retries.unwrap_or(def.resolution_retries),
            resolution_retry_backoff: duration(
                self.resolution_retry_backoff,
                def.resolution_retry_backoff,
            ),
            container_scope: self.workspace.as_deref().map(WorkspaceId::new),
            server_root: self.server_root.clone().unwrap_or(def.server_root),
            language: self.language.clone().unwrap_or(def.language),
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum DeliveryConfigToml {
    /// Write digests to the log.
    #[default]
    Log,
    /// POST digests as JSON.
    Webhook {
        #[serde_as(as = "serde_with::DisplayFromStr")]
        url: reqwest::Url,
        #[serde(default = "default_webhook_timeout")]
        timeout: DurationConfig,
    },
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DurationConfig {
    Secs(u64),
    Millis(u64),
}

impl From<DurationConfig> for Duration {
    fn from(value: DurationConfig) -> Self {
        match value {
            DurationConfig::Millis(millis) => Duration::from_millis(millis),
            DurationConfig::Secs(secs) => Duration::from_secs(secs),
        }
    }
}

const fn default_webhook_timeout() -> DurationConfig {
    DurationConfig::Secs(10)
}

pub(crate) mod log {
    use super::Deserialize;
    use std::str::FromStr;

    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    pub(crate) struct LoggingConfig {
        #[serde(default)]
        pub(crate) file: Option<AppenderRollingFile>,
        #[serde(default)]
        pub(crate) stdout: Option<AppenderOut>,
    }

    #[derive(Debug, Deserialize, Default, Copy, Clone)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum SpanConfig {
        /// spans are ignored (this is the default)
        #[default]
        None,
        /// one event when span is created
        New,
        /// one event per enter of a span
        Enter,
        /// one event per exit of a span
        Exit,
        /// one event when the span is dropped
        Close,
        /// one event per enter/exit of a span
        Active,
        /// events at all points (new, enter, exit, drop)
        Full,
    }

    impl From<SpanConfig> for tracing_subscriber::fmt::format::FmtSpan {
        fn from(value: SpanConfig) -> Self {
            match value {
                SpanConfig::None => Self::NONE,
                SpanConfig::New => Self::NEW,
                SpanConfig::Enter => Self::ENTER,
                SpanConfig::Exit => Self::EXIT,
                SpanConfig::Close => Self::CLOSE,
                SpanConfig::Active => Self::ACTIVE,
                SpanConfig::Full => Self::FULL,
            }
        }
    }

    #[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum LoggingStyle {
        #[default]
        Plain,
        PlainCompact,
        Json,
    }

    #[derive(Debug, Deserialize, Default)]
    pub(crate) struct AppenderCommon {
        #[serde(default)]
        pub(crate) level: EnvFilter,
        #[serde(default)]
        pub(crate) span: SpanConfig,
        #[serde(default)]
        pub(crate) target: bool,
    }

    #[derive(Debug, serde_with::DeserializeFromStr)]
    pub(crate) struct EnvFilter(pub(crate) tracing_subscriber::EnvFilter);
    impl FromStr for EnvFilter {
        type Err = tracing_subscriber::filter::ParseError;

        fn from_str(directives: &str) -> Result<Self, Self::Err> {
            tracing_subscriber::EnvFilter::builder()
                .parse(directives)
                .map(Self)
        }
    }
    impl Default for EnvFilter {
        fn default() -> Self {
            Self::from_str("info").expect("static directive must parse")
        }
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct AppenderOut {
        pub(crate) enabled: bool,
        #[serde(flatten, default)]
        pub(crate) common: AppenderCommon,
        #[serde(default = "default_out_style")]
        pub(crate) style: LoggingStyle,
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct AppenderRollingFile {
        #[serde(flatten, default)]
        pub(crate) common: AppenderCommon,
        pub(crate) directory: String,
        pub(crate) prefix: String,
        pub(crate) rotation: Rotation,
        #[serde(default)]
        pub(crate) style: LoggingStyle,
    }

    #[derive(Debug, Deserialize, Clone, Copy)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum Rotation {
        Minutely,
        Hourly,
        Daily,
        Never,
    }
    impl From<Rotation> for tracing_appender::rolling::Rotation {
        fn from(value: Rotation) -> Self {
            match value {
                Rotation::Minutely => Self::MINUTELY,
                Rotation::Hourly => Self::HOURLY,
                Rotation::Daily => Self::DAILY,
                Rotation::Never => Self::NEVER,
            }
        }
    }

    fn default_out_style() -> LoggingStyle {
        LoggingStyle::PlainCompact
    }
}
