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

//! Prometheus metrics exporter for OpenWeatherMap
//!
//! ## Features
//!
//! `owm_exporter` fetches current weather for a single location from the [OpenWeatherMap]
//! current weather API and emits it as Prometheus metrics. Weather is fetched in the background
//! at a fixed interval, *not* in response to Prometheus scrapes. The following metrics are
//! emitted.
//!
//! * `openweathermap_temperature_celsius{location=$LOCATION}` - Temperature, in degrees celsius.
//! * `openweathermap_pressure_hpa{location=$LOCATION}` - Atmospheric pressure, in hPa.
//! * `openweathermap_humidity_percent{location=$LOCATION}` - Relative humidity (0-100).
//! * `openweathermap_wind_mps{location=$LOCATION}` - Wind speed, in meters per second.
//! * `openweathermap_cloudiness_percent{location=$LOCATION}` - Cloud cover (0-100).
//! * `openweathermap_rain{location=$LOCATION}` - Precipitation over the last three hours, in mm.
//! * `openweathermap_weather{location=$LOCATION, weather=$DESCRIPTION}` - `1` for the current
//!   weather description, `0` for the description it replaced.
//!
//! Failed fetches are logged and leave every metric at its last value.
//!
//! [OpenWeatherMap]: https://openweathermap.org/current
//!
//! ## Build
//!
//! `owm_exporter` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! An OpenWeatherMap API key is required. Every option can be set with a flag or an environment
//! variable.
//!
//! ```text
//! OWM_API_KEY=... OWM_LOCATION=Lille,FR ./owm_exporter
//! ./owm_exporter --api-key ... --location Lille,FR --language en --refresh-secs 60
//! ```
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `2112` at `/metrics`. Once `owm_exporter`
//! is running, configure scrapes of it by your Prometheus server.
//!
//! ```yaml
//! scrape_configs:
//! - job_name: owm_exporter
//!   static_configs:
//!   - targets: ['example:2112']
//! ```
//!

pub mod client;
pub mod http;
pub mod metrics;
pub mod sampler;
