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

use crate::client::Sample;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Mutex;

pub const NAMESPACE: &str = "openweathermap";

type FloatGauge = Gauge<f64, AtomicU64>;

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LocationLabels {
    pub location: String,
}

impl LocationLabels {
    pub fn new(location: &str) -> Self {
        LocationLabels {
            location: location.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WeatherLabels {
    pub location: String,
    pub weather: String,
}

impl WeatherLabels {
    pub fn new(location: &str, weather: &str) -> Self {
        WeatherLabels {
            location: location.to_owned(),
            weather: weather.to_owned(),
        }
    }
}

/// Holder for metrics that can be set from a `Sample` of current weather.
///
/// All metrics are created and registered upon call to `WeatherMetrics::new()`. Metrics
/// all share the prefix "openweathermap_" (when registered with a registry created by
/// `WeatherMetrics::registry()`) and have a "location" label that will be set to the
/// configured location (e.g. `{location="Lille,FR"}`).
#[derive(Debug)]
pub struct WeatherMetrics {
    temperature: Family<LocationLabels, FloatGauge>,
    pressure: Family<LocationLabels, FloatGauge>,
    humidity: Family<LocationLabels, FloatGauge>,
    wind: Family<LocationLabels, FloatGauge>,
    cloudiness: Family<LocationLabels, FloatGauge>,
    rain: Family<LocationLabels, FloatGauge>,
    labels: LabelTransition,
}

impl WeatherMetrics {
    /// Create an empty registry that prefixes every metric name with "openweathermap_".
    pub fn registry() -> Registry {
        Registry::with_prefix(NAMESPACE)
    }

    /// Create a new `WeatherMetrics` and register each metric with the provided `Registry`.
    pub fn new(reg: &mut Registry) -> Self {
        let temperature = Family::<LocationLabels, FloatGauge>::default();
        let pressure = Family::<LocationLabels, FloatGauge>::default();
        let humidity = Family::<LocationLabels, FloatGauge>::default();
        let wind = Family::<LocationLabels, FloatGauge>::default();
        let cloudiness = Family::<LocationLabels, FloatGauge>::default();
        let rain = Family::<LocationLabels, FloatGauge>::default();
        let labels = LabelTransition::default();

        reg.register("temperature_celsius", "Temperature in °C", temperature.clone());
        reg.register("pressure_hpa", "Atmospheric pressure in hPa", pressure.clone());
        reg.register("humidity_percent", "Humidity in Percent", humidity.clone());
        reg.register("wind_mps", "Wind speed in m/s", wind.clone());
        reg.register("cloudiness_percent", "Cloudiness in Percent", cloudiness.clone());
        reg.register("rain", "Precipitation over the last 3 hours in mm", rain.clone());
        reg.register(
            "weather",
            "Current weather condition, 1 for the active description and 0 for the previous one",
            labels.family(),
        );

        Self {
            temperature,
            pressure,
            humidity,
            wind,
            cloudiness,
            rain,
            labels,
        }
    }

    /// Set every numeric metric and the active weather condition from the provided sample.
    pub fn observe(&self, location: &str, sample: &Sample) {
        self.update(location, sample);
        self.labels.apply(location, &sample.description);
    }

    /// Set every numeric metric from the provided sample, replacing the previous reading.
    pub fn update(&self, location: &str, sample: &Sample) {
        let labels = LocationLabels::new(location);
        self.temperature.get_or_create(&labels).set(sample.temperature_c);
        self.pressure.get_or_create(&labels).set(sample.pressure_hpa);
        self.humidity.get_or_create(&labels).set(f64::from(sample.humidity_pct));
        self.wind.get_or_create(&labels).set(sample.wind_speed_mps);
        self.cloudiness.get_or_create(&labels).set(f64::from(sample.cloud_pct));
        self.rain.get_or_create(&labels).set(sample.precipitation_3h);
    }
}

// prometheus-client 0.21 has no read-only lookup on `Family`, so these readers create
// a 0-valued series for labels that haven't been set yet. Check which series exist
// by encoding the registry before reading any values.
#[cfg(test)]
impl WeatherMetrics {
    fn location_value(family: &Family<LocationLabels, FloatGauge>, location: &str) -> f64 {
        family.get_or_create(&LocationLabels::new(location)).get()
    }

    pub(crate) fn temperature_value(&self, location: &str) -> f64 {
        Self::location_value(&self.temperature, location)
    }

    pub(crate) fn pressure_value(&self, location: &str) -> f64 {
        Self::location_value(&self.pressure, location)
    }

    pub(crate) fn humidity_value(&self, location: &str) -> f64 {
        Self::location_value(&self.humidity, location)
    }

    pub(crate) fn wind_value(&self, location: &str) -> f64 {
        Self::location_value(&self.wind, location)
    }

    pub(crate) fn cloudiness_value(&self, location: &str) -> f64 {
        Self::location_value(&self.cloudiness, location)
    }

    pub(crate) fn rain_value(&self, location: &str) -> f64 {
        Self::location_value(&self.rain, location)
    }

    pub(crate) fn weather_value(&self, location: &str, description: &str) -> f64 {
        self.labels
            .weather
            .get_or_create(&WeatherLabels::new(location, description))
            .get()
    }
}

/// Keeps the categorical "weather" family down to a single active description per location.
///
/// The gauge family has no notion of the values being mutually exclusive so the last
/// description seen for each location is tracked here. When it changes, the new description
/// is set to 1 before the previous one is set to 0 so that a scrape never sees a location
/// without any active weather.
///
/// The last description is only kept in memory. Descriptions set by a previous run of the
/// process are not known and therefore never zeroed.
#[derive(Debug, Default)]
pub struct LabelTransition {
    weather: Family<WeatherLabels, FloatGauge>,
    last: Mutex<HashMap<String, String>>,
}

impl LabelTransition {
    pub fn family(&self) -> Family<WeatherLabels, FloatGauge> {
        self.weather.clone()
    }

    pub fn apply(&self, location: &str, description: &str) {
        // Held for the whole transition so concurrent callers can't interleave
        // their set and zero steps for the same location.
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());

        self.weather
            .get_or_create(&WeatherLabels::new(location, description))
            .set(1.0);

        if let Some(previous) = last.get(location) {
            if previous != description {
                self.weather.get_or_create(&WeatherLabels::new(location, previous)).set(0.0);
            }
        }

        last.insert(location.to_owned(), description.to_owned());
    }

    #[cfg(test)]
    pub(crate) fn last(&self, location: &str) -> Option<String> {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.get(location).cloned()
    }
}
