use actix_web::{middleware, web, App, HttpServer};
use log::{error, info};

use cashier::api::{delete_entry, get_entry, get_meta, ping, put_entry};
use cashier::app_state::AppState;
use cashier::config::AppConfig;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    log4rs::init_file("server_log.yaml", Default::default()).unwrap();

    let config = AppConfig::from_env();
    let state = AppState::from_config(config.clone()).expect("Failed to open storage");
    let data = web::Data::new(state.clone());

    info!("Starting server on {}", config.bind);

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(data.clone())
            .service(ping)
            .service(put_entry)
            .service(get_entry)
            .service(get_meta)
            .service(delete_entry)
    })
    .bind(&config.bind)?
    .run()
    .await?;

    info!("Shutting down...");
    if let Err(e) = state.store.close().await {
        error!("closing storage: {}", e);
    }

    Ok(())
}
