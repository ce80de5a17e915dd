use crate::config::config_holder::ConfigHolder;
use crate::config::toml::ConfigToml;
use crate::delivery;
use crate::init;
use anyhow::Context;
use concepts::storage::DbPool;
use concepts::time::Now;
use db_sqlite::{SqliteConfig, SqlitePool};
use directories::{BaseDirs, ProjectDirs};
use notifier::{Delivery, Notifier, NotifierConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

pub(crate) async fn run(
    project_dirs: Option<ProjectDirs>,
    base_dirs: Option<BaseDirs>,
    config: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config_holder = ConfigHolder::new(project_dirs, base_dirs, config, true)?;
    let mut config = config_holder.load_config().await?;
    let _guard = init::init(&mut config, &config_holder.path_prefixes)?;
    Box::pin(run_internal(config, config_holder)).await
}

pub(crate) async fn verify(
    project_dirs: Option<ProjectDirs>,
    base_dirs: Option<BaseDirs>,
    config: Option<PathBuf>,
) -> Result<(), anyhow::Error> {
    let config_holder = ConfigHolder::new(project_dirs, base_dirs, config, true)?;
    let mut config = config_holder.load_config().await?;
    let _guard = init::init(&mut config, &config_holder.path_prefixes)?;
    let verified = verify_internal(config, &config_holder).await?;
    // Opening the pool creates or migrates the schema.
    let db_pool = open_db(&verified).await?;
    db_pool
        .close()
        .await
        .context("cannot close the database")?;
    Ok(())
}

#[instrument(skip_all, name = "verify")]
async fn verify_internal(
    config: ConfigToml,
    config_holder: &ConfigHolder,
) -> Result<ServerVerified, anyhow::Error> {
    debug!("Using toml config: {config:#?}");
    let db_file = config
        .sqlite
        .get_sqlite_file(&config_holder.path_prefixes)
        .await?;
    let notifier_config = config.notifier.as_config();
    if notifier_config.hint_queue_size == 0 {
        warn!("`notifier.hint_queue_size` is 0, using 1 instead");
    }
    let delivery = delivery::from_config(&config.delivery)
        .context("cannot configure the delivery")?;
    let server_verified = ServerVerified {
        db_file,
        sqlite_config: config.sqlite.as_config(),
        notifier_config,
        delivery,
    };
    info!("Server configuration was verified");
    Ok(server_verified)
}

async fn run_internal(config: ConfigToml, config_holder: ConfigHolder) -> anyhow::Result<()> {
    let verified = verify_internal(config, &config_holder).await?;
    let init = ServerInit::spawn(verified).await?;
    info!("Notifier is running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for SIGINT event")?;
    warn!("Received SIGINT, waiting for the notifier to shut down");
    init.close().await;
    Ok(())
}

async fn open_db(verified: &ServerVerified) -> Result<SqlitePool, anyhow::Error> {
    SqlitePool::new(&verified.db_file, verified.sqlite_config.clone())
        .await
        .with_context(|| format!("cannot open sqlite file {:?}", verified.db_file))
}

struct ServerVerified {
    db_file: PathBuf,
    sqlite_config: SqliteConfig,
    notifier_config: NotifierConfig,
    delivery: Arc<dyn Delivery>,
}

struct ServerInit {
    db_pool: SqlitePool,
    notifier: Notifier<Now>,
}

impl ServerInit {
    #[instrument(skip_all)]
    async fn spawn(verified: ServerVerified) -> Result<ServerInit, anyhow::Error> {
        let db_pool = open_db(&verified).await?;
        let notifier = Notifier::new(
            verified.notifier_config,
            Arc::new(db_pool.clone()),
            verified.delivery,
            Now,
        );
        notifier.start();
        Ok(ServerInit { db_pool, notifier })
    }

    async fn close(self) {
        info!("Server is closing");
        self.notifier.close().await;
        let res = self.db_pool.close().await;
        if let Err(err) = res {
            error!("Cannot close the database - {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, File, FileFormat};
    use notifier::NotifierState;

    fn holder(dir: &std::path::Path) -> ConfigHolder {
        ConfigHolder::new(
            None,
            None,
            Some({
                let file = dir.join("board-notify.toml");
                std::fs::write(&file, "").unwrap();
                file
            }),
            false,
        )
        .unwrap()
    }

    fn parse(toml: &str) -> ConfigToml {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[tokio::test]
    async fn server_starts_and_closes() {
        test_utils::set_up();
        let dir = tempfile::tempdir().unwrap();
        let config_holder = holder(dir.path());
        let config = parse(
            r#"
            [sqlite]
            file = "${CONFIG_FILE_DIR}/data/board-notify.sqlite"

            [notifier]
            idle_sleep = { millis = 10 }
            "#,
        );
        let verified = verify_internal(config, &config_holder).await.unwrap();
        assert_eq!(
            config_holder
                .path_prefixes
                .config_file_dir
                .join("data/board-notify.sqlite"),
            verified.db_file
        );
        let init = ServerInit::spawn(verified).await.unwrap();
        assert_ne!(NotifierState::Stopped, init.notifier.state());
        init.close().await;
        assert!(dir.path().join("data/board-notify.sqlite").exists());
    }
}
