// owm_exporter - Prometheus metrics exporter for OpenWeatherMap
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use clap::Parser;
use owm_exporter::client::{ClientError, OpenWeatherMapClient, WeatherSource};
use owm_exporter::http::RequestContext;
use owm_exporter::metrics::WeatherMetrics;
use owm_exporter::sampler::spawn_sampler;
use reqwest::Client;
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 2112);
const DEFAULT_REFERSH_SECS: u64 = 5;
const DEFAULT_TIMEOUT_MILLIS: u64 = 1000;
const DEFAULT_API_URL: &str = "https://api.openweathermap.org/data/2.5/";
const DEFAULT_LOCATION: &str = "Lille,FR";
const DEFAULT_LANGUAGE: &str = "fr";

#[derive(Debug, Parser)]
#[clap(name = "owm_exporter", version = clap::crate_version!())]
struct OwmExporterApplication {
    /// OpenWeatherMap API key
    #[clap(long, env = "OWM_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Location to fetch current weather for, as "City,CountryCode"
    #[clap(long, env = "OWM_LOCATION", default_value_t = DEFAULT_LOCATION.into())]
    location: String,

    /// Language of weather descriptions (e.g. 'en', 'fr', 'de')
    #[clap(long, env = "OWM_LANGUAGE", default_value_t = DEFAULT_LANGUAGE.into())]
    language: String,

    /// Base URL for the OpenWeatherMap API
    #[clap(long, env = "OWM_API_URL", default_value_t = DEFAULT_API_URL.into())]
    api_url: String,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, env = "OWM_LOG_LEVEL", default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Fetch current weather from the OpenWeatherMap API at this interval, in seconds.
    #[clap(
        long,
        env = "OWM_DURATION",
        default_value_t = DEFAULT_REFERSH_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    refresh_secs: u64,

    /// Timeout for fetching current weather from the OpenWeatherMap API, in milliseconds.
    #[clap(long, env = "OWM_TIMEOUT_MILLIS", default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Address to bind to. By default, owm_exporter will bind to public address since
    /// the purpose is to expose metrics to an external system (Prometheus or another
    /// agent for ingestion)
    #[clap(long, env = "OWM_BIND", default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = OwmExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    let client = OpenWeatherMapClient::new(http_client, &opts.api_url, &opts.api_key, &opts.language)
        .unwrap_or_else(|e| {
            tracing::error!(message = "unable to initialize OpenWeatherMap client", error = %e);
            process::exit(1)
        });

    let mut registry = WeatherMetrics::registry();
    let metrics = Arc::new(WeatherMetrics::new(&mut registry));
    let period = Duration::from_secs(opts.refresh_secs);

    // Make an initial request for the location. This allows us to verify that the API key and
    // location are valid before starting the HTTP server and running indefinitely. A successful
    // result is kept so that the first scheduled fetch can wait a full period.
    let start = match client.current(&opts.location).await {
        Err(ClientError::InvalidLocation(location)) => {
            tracing::error!(message = "invalid location provided", location = %location);
            process::exit(1)
        }
        Err(ClientError::InvalidApiKey) => {
            tracing::error!(message = "invalid API key provided");
            process::exit(1)
        }
        Err(e) => {
            tracing::warn!(message = "failed to fetch initial weather", error = %e);
            Instant::now()
        }
        Ok(s) => {
            tracing::debug!(message = "verified location", location = %opts.location, sample = ?s);
            metrics.observe(&opts.location, &s);
            Instant::now() + period
        }
    };

    let token = CancellationToken::new();
    let sampler = spawn_sampler(
        Arc::new(client),
        metrics,
        opts.location.clone(),
        start,
        period,
        token.clone(),
    );

    let context = Arc::new(RequestContext::new(registry));
    let handler = owm_exporter::http::text_metrics(context);
    let server = axum::Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
        process::exit(1)
    });

    tracing::info!(message = "server started", address = %opts.bind, location = %opts.location);
    server
        .serve(handler.into_make_service())
        .with_graceful_shutdown(async move {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }

            token.cancel();
        })
        .await?;

    let errors = sampler.shutdown().await?;
    tracing::info!(message = "server shutdown", errors = errors);
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
