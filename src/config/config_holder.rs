use super::toml::ConfigToml;
use anyhow::{Context as _, bail};
use config::{ConfigBuilder, Environment, File, FileFormat, builder::AsyncState};
use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt as _;
use tracing::{info, warn};

pub(crate) const BOARD_NOTIFY_TOML: &str = include_str!("../../board-notify.toml");
const DEFAULT_CONFIG_FILE: &str = "board-notify.toml";
const ENV_PREFIX: &str = "BOARD_NOTIFY";

// Path prefixes
const HOME_DIR_PREFIX: &str = "~/";
pub(crate) const DATA_DIR_PREFIX: &str = "${DATA_DIR}/";
const CACHE_DIR_PREFIX: &str = "${CACHE_DIR}/";
const CONFIG_DIR_PREFIX: &str = "${CONFIG_DIR}/";
const CONFIG_FILE_DIR_PREFIX: &str = "${CONFIG_FILE_DIR}/";
const TEMP_DIR_PREFIX: &str = "${TEMP_DIR}/";

#[derive(PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileOrFolder {
    File,
    Folder,
}

pub(crate) struct PathPrefixes {
    pub(crate) config_file_dir: PathBuf,
    pub(crate) project_dirs: Option<ProjectDirs>,
    pub(crate) base_dirs: Option<BaseDirs>,
}

impl PathPrefixes {
    pub(crate) fn replace_path_prefix(&self, input_path: &str) -> PathBuf {
        if let (Some(project_dirs), Some(base_dirs)) = (&self.project_dirs, &self.base_dirs) {
            if let Some(suffix) = input_path.strip_prefix(HOME_DIR_PREFIX) {
                return base_dirs.home_dir().join(suffix);
            } else if let Some(suffix) = input_path.strip_prefix(DATA_DIR_PREFIX) {
                return project_dirs.data_dir().join(suffix);
            } else if let Some(suffix) = input_path.strip_prefix(CACHE_DIR_PREFIX) {
                return project_dirs.cache_dir().join(suffix);
            } else if let Some(suffix) = input_path.strip_prefix(CONFIG_DIR_PREFIX) {
                return project_dirs.config_dir().join(suffix);
            }
        } else if input_path.starts_with(HOME_DIR_PREFIX)
            || input_path.starts_with(DATA_DIR_PREFIX)
            || input_path.starts_with(CACHE_DIR_PREFIX)
            || input_path.starts_with(CONFIG_DIR_PREFIX)
        {
            warn!("Not expanding prefix of `{input_path}`");
        }
        if let Some(suffix) = input_path.strip_prefix(CONFIG_FILE_DIR_PREFIX) {
            self.config_file_dir.join(suffix)
        } else if let Some(suffix) = input_path.strip_prefix(TEMP_DIR_PREFIX) {
            std::env::temp_dir().join(suffix)
        } else {
            PathBuf::from(input_path)
        }
    }

    /// Expand the prefix and create the folder, or the parent folder of a file.
    pub(crate) async fn replace_path_prefix_mkdir(
        &self,
        input_path: &str,
        file_or_folder: FileOrFolder,
    ) -> Result<PathBuf, anyhow::Error> {
        let path = self.replace_path_prefix(input_path);
        let dir = match file_or_folder {
            FileOrFolder::Folder => Some(path.as_path()),
            FileOrFolder::File => path.parent().filter(|parent| !parent.as_os_str().is_empty()),
        };
        if let Some(dir) = dir {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("cannot create directory {dir:?}"))?;
        }
        Ok(path)
    }
}

pub(crate) struct ConfigHolder {
    config_file: Option<PathBuf>,
    pub(crate) path_prefixes: PathPrefixes,
}

impl ConfigHolder {
    pub(crate) async fn generate_default_config(
        dst: Option<PathBuf>,
        overwrite: bool,
    ) -> Result<(), anyhow::Error> {
        let dst = dst.unwrap_or(PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true) // Always allow creating new files.
            .truncate(true) // Truncate existing files.
            .create_new(!overwrite) // Overwriting is only allowed with `--overwrite`.
            .open(&dst)
            .await
            .with_context(|| {
                format!(
                    "cannot open {dst:?} for writing{}",
                    if !overwrite {
                        ", try using `--overwrite`"
                    } else {
                        ""
                    }
                )
            })?;
        file.write_all(BOARD_NOTIFY_TOML.as_bytes())
            .await
            .with_context(|| format!("cannot write to {dst:?}"))?;
        println!("Generated {dst:?}");
        Ok(())
    }

    pub(crate) fn new(
        project_dirs: Option<ProjectDirs>,
        base_dirs: Option<BaseDirs>,
        config: Option<PathBuf>,
        allow_missing: bool,
    ) -> Result<Self, anyhow::Error> {
        let config_file = if let Some(config) = config {
            Some(config)
        } else {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            let exists = local.try_exists().unwrap_or_default();
            if !allow_missing && !exists {
                bail!("cannot find `{DEFAULT_CONFIG_FILE}` in current directory");
            }
            if exists {
                info!("Using configuration file {local:?}");
                Some(local)
            } else {
                None
            }
        };

        Ok(Self {
            path_prefixes: PathPrefixes {
                config_file_dir: match &config_file {
                    None => std::env::current_dir().context("failed to get CWD")?,
                    Some(config_file) => config_file
                        .canonicalize()
                        .with_context(|| format!("cannot canonicalize {config_file:?}"))?
                        .parent()
                        .with_context(|| format!("error getting parent path of {config_file:?}"))?
                        .to_path_buf(),
                },
                project_dirs,
                base_dirs,
            },
            config_file,
        })
    }

    /// The TOML file overlaid with `BOARD_NOTIFY__SECTION__KEY` environment variables.
    pub(crate) async fn load_config(&self) -> Result<ConfigToml, anyhow::Error> {
        let mut builder = ConfigBuilder::<AsyncState>::default();
        if let Some(config_file) = self.config_file.as_deref() {
            builder = builder.add_source(
                File::from(config_file)
                    .required(true)
                    .format(FileFormat::Toml),
            );
        }
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .await?;
        Ok(settings.try_deserialize()?)
    }
}
