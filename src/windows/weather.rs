use serde::Deserialize;

use super::{Freshness, Window, WindowContext, WindowError};
use crate::mqtt::message::MqttMessage;

const DOMAIN: &str = "weather/local";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Temperatures {
    pub real: f64,
    pub feels: f64,
    pub min: f64,
    #[serde(default)]
    pub max: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Wind {
    pub speed: f64,
    #[serde(default)]
    pub gust: f64,
    pub cardinal: String,
}

/// Local weather report as published by the home automation side.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WeatherReport {
    pub state: String,
    pub icon: String,
    pub temp: Temperatures,
    pub hum: f64,
    #[serde(default)]
    pub rain: f64,
    #[serde(default)]
    pub snow: bool,
    #[serde(default)]
    pub clouds: f64,
    #[serde(default)]
    pub vis: f64,
    pub wind: Wind,
}

impl Default for WeatherReport {
    fn default() -> Self {
        Self {
            state: "Unknown".to_string(),
            icon: "cloud".to_string(),
            temp: Temperatures::default(),
            hum: 0.0,
            rain: 0.0,
            snow: false,
            clouds: 0.0,
            vis: 0.0,
            wind: Wind {
                cardinal: "Unknown".to_string(),
                ..Wind::default()
            },
        }
    }
}

impl WeatherReport {
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        let mut report: WeatherReport = serde_json::from_str(payload)?;
        report.state = report.state.replace("Clouds", "Cloudy");
        Ok(report)
    }

    /// Visibility as a share of the 10 km maximum.
    pub fn visibility_percent(&self) -> u8 {
        (self.vis / 10_000.0 * 100.0).clamp(0.0, 100.0) as u8
    }
}

#[derive(Default)]
pub struct WeatherWindow {
    report: WeatherReport,
    freshness: Freshness,
}

impl WeatherWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> &WeatherReport {
        &self.report
    }

    fn response_topic(ctx: &WindowContext<'_>) -> String {
        ctx.topics().domain(DOMAIN, "response")
    }
}

impl Window for WeatherWindow {
    fn name(&self) -> &str {
        "weather"
    }

    fn on_start(&mut self, ctx: &mut WindowContext<'_>) -> Result<(), WindowError> {
        self.report = WeatherReport::default();
        let topic = Self::response_topic(ctx);
        ctx.subscribe(&[topic]);
        ctx.announce(DOMAIN, true);
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut WindowContext<'_>) -> Result<(), WindowError> {
        ctx.announce(DOMAIN, false);
        let topic = Self::response_topic(ctx);
        ctx.unsubscribe(&[topic]);
        Ok(())
    }

    fn receive(
        &mut self,
        ctx: &mut WindowContext<'_>,
        message: &MqttMessage,
    ) -> Result<(), WindowError> {
        if message.topic != Self::response_topic(ctx) {
            return Ok(());
        }
        match WeatherReport::parse(&message.payload) {
            Ok(report) => {
                self.report = report;
                self.freshness = Freshness::fresh();
                Ok(())
            }
            Err(e) => {
                self.freshness = Freshness::failed(&e);
                Err(WindowError::malformed(message, e))
            }
        }
    }

    fn update(&mut self, ctx: &mut WindowContext<'_>) -> Result<(), WindowError> {
        let topic = Self::response_topic(ctx);
        ctx.heal(&[topic]);
        Ok(())
    }

    fn caption(&self) -> String {
        let report = &self.report;
        format!(
            "{} {:.1}°C (feels {:.1}°C, lo {:.1} hi {:.1}) hum {}% {} {}mm/h wind {} {}mph gust {}mph clouds {}% vis {}%",
            report.state,
            report.temp.real,
            report.temp.feels,
            report.temp.min,
            report.temp.max,
            report.hum,
            if report.snow { "snow" } else { "rain" },
            report.rain,
            report.wind.cardinal,
            report.wind.speed,
            report.wind.gust,
            report.clouds,
            report.visibility_percent()
        )
    }

    fn freshness(&self) -> &Freshness {
        &self.freshness
    }
}
