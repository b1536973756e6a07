/*
 * oxmail mail transfer agent
 * Copyright (C) 2022 the oxmail authors
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 *  This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
**/
use oxmail::config::Config;
use oxmail::server::ServerOxmail;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = clap::App::new("oxmail")
        .version(oxmail::VERSION)
        .about("oxmail : a queue-centric mail transfer agent")
        .arg(
            clap::Arg::with_name("config")
                .short("-c")
                .long("--config")
                .takes_value(true)
                .default_value(oxmail::config::DEFAULT_CONFIG_PATH),
        )
        .get_matches();

    let config = std::sync::Arc::new(Config::from_path(std::path::Path::new(
        args.value_of("config").expect("clap provides a default value"),
    ))?);

    log4rs::init_config(oxmail::logs::get_logger_config(&config)?)?;

    let db = oxmail::db::Db::open(&config.resolve(&config.database.path))?;
    let store = oxmail::store::new_store(
        &config.store.driver,
        &config.resolve(&config.store.source),
    )?;
    let publisher = std::sync::Arc::new(
        oxmail::publish::NatsPublisher::connect(&config.queue.nats_server).await?,
    );
    let resolver = std::sync::Arc::new(oxmail::resolver::DnsResolver::new()?);
    let scanner: Option<std::sync::Arc<dyn oxmail::scanner::Scanner>> =
        if config.clamav.enabled {
            Some(std::sync::Arc::new(oxmail::scanner::Clamav::new(
                &config.clamav.address,
            )))
        } else {
            None
        };

    let server = ServerOxmail::new(config, db, store, publisher, resolver, scanner).await?;

    log::warn!("listening on: {:?}", server.addr());
    server.listen_and_serve().await.map_err(Into::into)
}
