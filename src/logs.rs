use crate::config::Config;

/// Build the log4rs configuration: console appender by default, a file
/// appender under `log.dirpath` when one is configured.
pub fn get_logger_config(config: &Config) -> anyhow::Result<log4rs::Config> {
    let level = if config.log.debug_enabled {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let encoder = log4rs::encode::pattern::PatternEncoder::new(
        "{d(%Y-%m-%dT%H:%M:%S%.6f%:z)} {h({l:<5})} {t} - {m}{n}",
    );

    let appender = match &config.log.dirpath {
        Some(dirpath) => log4rs::config::Appender::builder().build(
            "oxmail",
            Box::new(
                log4rs::append::file::FileAppender::builder()
                    .encoder(Box::new(encoder))
                    .build(config.resolve(dirpath).join("current.log"))?,
            ),
        ),
        None => log4rs::config::Appender::builder().build(
            "oxmail",
            Box::new(
                log4rs::append::console::ConsoleAppender::builder()
                    .encoder(Box::new(encoder))
                    .build(),
            ),
        ),
    };

    log4rs::Config::builder()
        .appender(appender)
        .build(
            log4rs::config::Root::builder()
                .appender("oxmail")
                .build(level),
        )
        .map_err(anyhow::Error::new)
}
