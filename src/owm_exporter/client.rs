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

use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use std::error;
use std::fmt;

#[derive(Debug)]
pub enum ClientError {
    Construction(String),
    Internal(reqwest::Error),
    InvalidApiKey,
    InvalidLocation(String),
    MalformedResponse(String),
    Unexpected(StatusCode, Url),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Construction(msg) => write!(f, "unable to construct client: {}", msg),
            Self::Internal(e) => write!(f, "{}", e),
            Self::InvalidApiKey => write!(f, "invalid API key"),
            Self::InvalidLocation(l) => write!(f, "invalid location {}", l),
            Self::MalformedResponse(msg) => write!(f, "malformed response: {}", msg),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e),
            _ => None,
        }
    }
}

/// Current conditions for a single location, reduced to the values exported as metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub temperature_c: f64,
    pub pressure_hpa: f64,
    pub humidity_pct: u32,
    pub wind_speed_mps: f64,
    pub cloud_pct: u32,
    pub precipitation_3h: f64,
    pub description: String,
}

impl TryFrom<CurrentWeather> for Sample {
    type Error = ClientError;

    fn try_from(current: CurrentWeather) -> Result<Self, Self::Error> {
        // The first condition is the primary one, any others are secondary.
        let description = current
            .weather
            .into_iter()
            .next()
            .map(|c| c.description)
            .ok_or_else(|| ClientError::MalformedResponse("empty weather condition list".to_owned()))?;

        Ok(Sample {
            temperature_c: current.main.temp,
            pressure_hpa: current.main.pressure,
            humidity_pct: current.main.humidity,
            wind_speed_mps: current.wind.speed,
            cloud_pct: current.clouds.all,
            precipitation_3h: current.rain.and_then(|r| r.three_hours).unwrap_or(0.0),
            description,
        })
    }
}

/// Source of current weather conditions for a named location.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn current(&self, location: &str) -> Result<Sample, ClientError>;
}

#[derive(Debug)]
pub struct OpenWeatherMapClient {
    client: Client,
    base_url: Url,
    api_key: String,
    language: String,
}

impl OpenWeatherMapClient {
    const USER_AGENT: &'static str = "owm_exporter Prometheus Exporter";
    const JSON_RESPONSE: &'static str = "application/json";
    const UNITS_METRIC: &'static str = "metric";

    pub fn new(client: Client, base_url: &str, api_key: &str, language: &str) -> Result<Self, ClientError> {
        if api_key.trim().is_empty() {
            return Err(ClientError::Construction("API key must not be empty".to_owned()));
        }

        let base_url = Url::parse(base_url).map_err(|e| ClientError::Construction(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Construction(format!("{} cannot be a base URL", base_url)));
        }

        Ok(OpenWeatherMapClient {
            client,
            base_url,
            api_key: api_key.to_owned(),
            language: language.to_owned(),
        })
    }

    pub async fn current_weather(&self, location: &str) -> Result<CurrentWeather, ClientError> {
        let request_url = self.weather_url(location);
        tracing::debug!(message = "making current weather request", url = %request_url);

        let res = self.make_request(location, request_url).await?;
        res.json::<CurrentWeather>()
            .await
            .map_err(|e| ClientError::Internal(e.without_url()))
    }

    async fn make_request<S: Into<String>>(&self, location: S, url: Url) -> Result<Response, ClientError> {
        // The API key is added here rather than in the URL so that it never
        // ends up in logs or error messages.
        let res = self
            .client
            .get(url.clone())
            .query(&[("appid", &self.api_key)])
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .send()
            .await
            .map_err(|e| ClientError::Internal(e.without_url()))?;

        let status = res.status();
        if status == StatusCode::OK {
            Ok(res)
        } else if status == StatusCode::UNAUTHORIZED {
            Err(ClientError::InvalidApiKey)
        } else if status == StatusCode::NOT_FOUND {
            Err(ClientError::InvalidLocation(location.into()))
        } else {
            Err(ClientError::Unexpected(status, url))
        }
    }

    fn weather_url(&self, location: &str) -> Url {
        let mut url = self.base_url.clone();
        {
            url.path_segments_mut()
                .map(|mut p| {
                    p.pop_if_empty().push("weather");
                })
                .expect("unable to modify weather URL path segments");
        }

        url.query_pairs_mut()
            .clear()
            .append_pair("q", location)
            .append_pair("units", Self::UNITS_METRIC)
            .append_pair("lang", &self.language);

        url
    }
}

#[async_trait]
impl WeatherSource for OpenWeatherMapClient {
    async fn current(&self, location: &str) -> Result<Sample, ClientError> {
        Sample::try_from(self.current_weather(location).await?)
    }
}

#[derive(Deserialize, Debug)]
pub struct CurrentWeather {
    #[serde(alias = "weather", default)]
    pub weather: Vec<Condition>,
    #[serde(alias = "main")]
    pub main: MainConditions,
    #[serde(alias = "wind")]
    pub wind: Wind,
    #[serde(alias = "clouds")]
    pub clouds: Clouds,
    #[serde(alias = "rain", default)]
    pub rain: Option<Precipitation>,
}

#[derive(Deserialize, Debug)]
pub struct Condition {
    #[serde(alias = "description")]
    pub description: String,
}

#[derive(Deserialize, Debug)]
pub struct MainConditions {
    #[serde(alias = "temp")]
    pub temp: f64,
    #[serde(alias = "pressure")]
    pub pressure: f64,
    #[serde(alias = "humidity")]
    pub humidity: u32,
}

#[derive(Deserialize, Debug)]
pub struct Wind {
    #[serde(alias = "speed")]
    pub speed: f64,
}

#[derive(Deserialize, Debug)]
pub struct Clouds {
    #[serde(alias = "all")]
    pub all: u32,
}

#[derive(Deserialize, Debug)]
pub struct Precipitation {
    #[serde(rename = "3h", default)]
    pub three_hours: Option<f64>,
}
