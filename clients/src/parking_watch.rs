use anyhow::{Context, Result};
use lib_parking::retrieve::{BookingRequest, ParkingApi};
use lib_parking::{ConnectionState, EventKind, LotId, RealtimeClient};
use std::time::Duration;
use tokio::signal;

mod watch_logic;
use watch_logic::{config, logger, render};

async fn book_spot(config: &config::Config, spot: i64) -> Result<()> {
    let api = ParkingApi::new(config.origin(), config.api_token.clone())?;
    let request = BookingRequest::one_hour(spot, chrono::Utc::now());
    let response = api.create_booking(&request).await?;

    match response.data {
        Some(booking) => {
            log::info!("Booked spot {} as booking {}", spot, booking.id);
            println!("{}", booking.payment_path());
            Ok(())
        }
        None => anyhow::bail!(
            "booking spot {} failed with status {}: {}",
            spot,
            response.status,
            response.error_body.unwrap_or_default()
        ),
    }
}

async fn print_lot(config: &config::Config, id: i64) -> Result<()> {
    let api = ParkingApi::new(config.origin(), config.api_token.clone())?;
    let response = api.get_parking_lot(id).await?;
    match response.data {
        Some(lot) => println!("{}", render::render_lot(&lot)),
        None => log::warn!("Could not fetch lot {} (status {})", id, response.status),
    }
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let config = config::load_config();
    let log_path = logger::setup_logging(&config.log_dir(), config.log_level())?;
    log::debug!("Logging to {}", log_path.display());

    if let Some(spot) = config.book_spot {
        return book_spot(&config, spot).await;
    }

    let realtime_config = config.realtime_config()?;
    if config.fetch_lot {
        match config.focus_lot() {
            Some(LotId::Int(id)) => print_lot(&config, id).await?,
            Some(LotId::Str(id)) => log::warn!("--fetch-lot needs a numeric lot id, got '{}'", id),
            None => log::warn!("--fetch-lot has no effect without --lot"),
        }
    }

    let client = RealtimeClient::new(realtime_config)?;
    log::info!("Watching {}", client.endpoint());
    for kind in EventKind::ALL {
        client.on(kind, |event| println!("{}", render::render_event(event)));
    }
    for id in config.subscriptions() {
        client.subscribe(id)?;
    }
    client.start()?;

    wait_for_shutdown().await?;

    client.stop()?;
    let mut state = client.watch_state();
    let closed = state.wait_for(|s| matches!(s, ConnectionState::Closed | ConnectionState::Idle));
    if tokio::time::timeout(Duration::from_secs(5), closed).await.is_err() {
        log::warn!("Connection did not close within 5s");
    }

    log::info!("Shutdown complete.");
    Ok(())
}
