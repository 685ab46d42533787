use actix_web::{web, App, HttpServer};
use log::{error, info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;
use source_aggregator::app_state::AppState;
use source_aggregator::config::Config;
use source_aggregator::{scheduler, server};

/// Load `log4rs.yml`, falling back to a console logger when it is missing
fn init_logging() {
    let Err(file_err) = log4rs::init_file("log4rs.yml", Default::default()) else {
        return;
    };

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {t} - {m}{n}",
        )))
        .build();
    let fallback = log4rs::Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info));

    match fallback {
        Ok(config) => {
            if log4rs::init_config(config).is_ok() {
                log::warn!("log4rs.yml not loaded ({}), logging to console", file_err);
            }
        }
        Err(e) => eprintln!("failed to configure logging: {}", e),
    }
}

fn startup_error(e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_logging();

    let cfg = Config::load().map_err(|e| {
        error!("Invalid configuration: {}", e);
        startup_error(e)
    })?;
    let bind = cfg.server.bind.clone();

    let state = AppState::build(cfg).await.map_err(|e| {
        error!("Startup failed: {}", e);
        startup_error(e)
    })?;
    let data = web::Data::new(state);

    // start background maintenance
    scheduler::spawn(data.clone());

    let server_data = data.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(server_data.clone())
            .configure(server::configure)
    })
    .bind(&bind)?;

    info!("Listening on {}", bind);
    let result = server.run().await;

    let destroyed = data.bypass.destroy_all_sessions().await;
    if destroyed > 0 {
        info!("Destroyed {} bypass sessions on shutdown", destroyed);
    }
    data.recorder.log_summary();
    result
}
