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

use crate::client::{ClientError, WeatherSource};
use crate::metrics::WeatherMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level};

/// A failed attempt to sample current weather for a location.
#[derive(Debug)]
pub struct SampleError {
    pub location: String,
    pub error: ClientError,
}

/// Handle to the background sampling and error reporting tasks.
#[derive(Debug)]
pub struct SamplerHandle {
    token: CancellationToken,
    sampler: JoinHandle<()>,
    errors: JoinHandle<usize>,
}

impl SamplerHandle {
    /// Stop sampling and wait for every pending error to be reported.
    ///
    /// Returns the number of errors reported over the lifetime of the sampler.
    pub async fn shutdown(self) -> Result<usize, JoinError> {
        self.token.cancel();
        // The sampler owns the only sender, the error sink finishes once it's gone.
        self.sampler.await?;
        self.errors.await
    }
}

/// Start fetching current weather for `location` every `period`, beginning at `start`,
/// updating `metrics` each time.
///
/// Failures are sent to a separate task that logs them, they never stop sampling and leave
/// the existing metric values untouched. Both tasks run until `token` is cancelled.
///
/// # Panics
///
/// If `period` is zero.
pub fn spawn_sampler(
    source: Arc<dyn WeatherSource>,
    metrics: Arc<WeatherMetrics>,
    location: String,
    start: Instant,
    period: Duration,
    token: CancellationToken,
) -> SamplerHandle {
    // Built here rather than in the task so a bad period fails the caller instead
    // of silently killing the sampler.
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        message = "weather polling started",
        location = %location,
        interval_secs = period.as_secs_f64(),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let sampler = tokio::spawn(run_sampler(source, metrics, location, interval, token.clone(), tx));
    let errors = tokio::spawn(report_errors(rx));

    SamplerHandle { token, sampler, errors }
}

async fn run_sampler(
    source: Arc<dyn WeatherSource>,
    metrics: Arc<WeatherMetrics>,
    location: String,
    mut interval: Interval,
    token: CancellationToken,
    errors: UnboundedSender<SampleError>,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let res = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            res = source
                .current(&location)
                .instrument(tracing::span!(Level::DEBUG, "owm_observation")) => res,
        };

        match res {
            Ok(sample) => {
                metrics.observe(&location, &sample);
                tracing::info!(
                    message = "fetched current weather",
                    location = %location,
                    description = %sample.description,
                );
            }
            Err(error) => {
                let err = SampleError {
                    location: location.clone(),
                    error,
                };

                if let Err(e) = errors.send(err) {
                    tracing::warn!(message = "error reporter stopped, dropping error", error = %e.0.error);
                }
            }
        }
    }

    tracing::info!(message = "weather polling stopped", location = %location);
}

async fn report_errors(mut rx: UnboundedReceiver<SampleError>) -> usize {
    let mut reported = 0;

    while let Some(err) = rx.recv().await {
        reported += 1;
        tracing::error!(
            message = "failed to fetch current weather",
            location = %err.location,
            error = %err.error,
        );
    }

    reported
}

#[cfg(test)]
mod tests {
    use super::spawn_sampler;
    use crate::client::{ClientError, Sample, WeatherSource};
    use crate::metrics::WeatherMetrics;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    const LOCATION: &str = "Lille,FR";
    const PERIOD: Duration = Duration::from_millis(10);

    fn sample(temperature_c: f64, description: &str) -> Sample {
        Sample {
            temperature_c,
            pressure_hpa: 1012.0,
            humidity_pct: 81,
            wind_speed_mps: 4.1,
            cloud_pct: 75,
            precipitation_3h: 0.0,
            description: description.to_owned(),
        }
    }

    /// Returns queued responses in order, then errors forever.
    #[derive(Default)]
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<Sample, ClientError>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Sample, ClientError>>) -> Self {
            ScriptedSource {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WeatherSource for ScriptedSource {
        async fn current(&self, _location: &str) -> Result<Sample, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ClientError::MalformedResponse("no more responses".to_owned())))
        }
    }

    /// Never completes a fetch.
    struct StuckSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WeatherSource for StuckSource {
        async fn current(&self, _location: &str) -> Result<Sample, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    async fn wait_for_calls(calls: impl Fn() -> usize, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while calls() < expected {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("timed out waiting for fetches");
    }

    fn new_metrics() -> Arc<WeatherMetrics> {
        let mut reg = WeatherMetrics::registry();
        Arc::new(WeatherMetrics::new(&mut reg))
    }

    #[tokio::test]
    async fn test_samples_applied_in_order() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(sample(20.1, "clear sky")),
            Ok(sample(20.3, "clear sky")),
            Ok(sample(19.8, "light rain")),
        ]));
        let metrics = new_metrics();
        let handle = spawn_sampler(
            source.clone(),
            metrics.clone(),
            LOCATION.to_owned(),
            Instant::now(),
            PERIOD,
            CancellationToken::new(),
        );

        // The fourth call runs after the third sample has been applied.
        wait_for_calls(|| source.calls(), 4).await;
        handle.shutdown().await.unwrap();

        assert_eq!(19.8, metrics.temperature_value(LOCATION));
        assert_eq!(0.0, metrics.weather_value(LOCATION, "clear sky"));
        assert_eq!(1.0, metrics.weather_value(LOCATION, "light rain"));
    }

    #[tokio::test]
    async fn test_failure_leaves_metrics_unchanged() {
        let mut first = sample(20.1, "clear sky");
        first.precipitation_3h = 0.5;
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(first),
            Err(ClientError::InvalidApiKey),
            Err(ClientError::MalformedResponse("empty weather condition list".to_owned())),
        ]));
        let metrics = new_metrics();
        let handle = spawn_sampler(
            source.clone(),
            metrics.clone(),
            LOCATION.to_owned(),
            Instant::now(),
            PERIOD,
            CancellationToken::new(),
        );

        wait_for_calls(|| source.calls(), 3).await;
        let reported = handle.shutdown().await.unwrap();

        assert!(reported >= 2, "expected at least two errors, got {}", reported);
        assert_eq!(20.1, metrics.temperature_value(LOCATION));
        assert_eq!(1012.0, metrics.pressure_value(LOCATION));
        assert_eq!(81.0, metrics.humidity_value(LOCATION));
        assert_eq!(4.1, metrics.wind_value(LOCATION));
        assert_eq!(75.0, metrics.cloudiness_value(LOCATION));
        assert_eq!(0.5, metrics.rain_value(LOCATION));
        assert_eq!(1.0, metrics.weather_value(LOCATION, "clear sky"));
    }

    #[tokio::test]
    async fn test_cancel_stops_fetching() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(sample(20.1, "clear sky"))]));
        let token = CancellationToken::new();
        let handle = spawn_sampler(
            source.clone(),
            new_metrics(),
            LOCATION.to_owned(),
            Instant::now(),
            PERIOD,
            token.clone(),
        );

        wait_for_calls(|| source.calls(), 1).await;
        token.cancel();
        tokio::time::timeout(PERIOD * 10, handle.shutdown())
            .await
            .expect("sampler did not stop")
            .unwrap();

        let calls = source.calls();
        tokio::time::sleep(PERIOD * 5).await;
        assert_eq!(calls, source.calls());
    }

    #[tokio::test]
    async fn test_cancel_during_fetch() {
        let source = Arc::new(StuckSource {
            calls: AtomicUsize::new(0),
        });
        let handle = spawn_sampler(
            source.clone(),
            new_metrics(),
            LOCATION.to_owned(),
            Instant::now(),
            PERIOD,
            CancellationToken::new(),
        );

        wait_for_calls(|| source.calls.load(Ordering::SeqCst), 1).await;
        let reported = tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("sampler did not stop")
            .unwrap();

        assert_eq!(0, reported);
        assert_eq!(1, source.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fetches_do_not_overlap() {
        let source = Arc::new(ScriptedSource {
            delay: Some(PERIOD * 3),
            ..Default::default()
        });
        let handle = spawn_sampler(
            source.clone(),
            new_metrics(),
            LOCATION.to_owned(),
            Instant::now(),
            PERIOD,
            CancellationToken::new(),
        );

        wait_for_calls(|| source.calls(), 3).await;
        handle.shutdown().await.unwrap();

        assert_eq!(1, source.max_in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_first_fetch_waits_for_start() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(sample(20.1, "clear sky"))]));
        let handle = spawn_sampler(
            source.clone(),
            new_metrics(),
            LOCATION.to_owned(),
            Instant::now() + Duration::from_secs(60),
            PERIOD,
            CancellationToken::new(),
        );

        tokio::time::sleep(PERIOD * 5).await;
        handle.shutdown().await.unwrap();

        assert_eq!(0, source.calls());
    }

    #[tokio::test]
    #[should_panic(expected = "non-zero")]
    async fn test_zero_period_fails_caller() {
        let source = Arc::new(ScriptedSource::default());
        spawn_sampler(
            source,
            new_metrics(),
            LOCATION.to_owned(),
            Instant::now(),
            Duration::ZERO,
            CancellationToken::new(),
        );
    }
}
