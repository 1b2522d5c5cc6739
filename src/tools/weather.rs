use super::{check_status, f64_arg, Tool, ToolContext, ToolError, ToolResult};
use crate::model_registry::TOOL_WEATHER;
use async_trait::async_trait;
use serde_json::{json, Value};

const OPEN_METEO_URL: &str = "https://api.open-meteo.com/v1/forecast";

/// Current weather from Open-Meteo. No key needed.
pub struct WeatherTool {
    client: reqwest::Client,
    base_url: String,
}

impl WeatherTool {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: OPEN_METEO_URL.to_string(),
        }
    }

    async fn run(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let latitude = f64_arg(args, "latitude")?;
        let longitude = f64_arg(args, "longitude")?;
        validate_coordinates(latitude, longitude)?;
        let forecast = self.forecast(latitude, longitude).await?;
        Ok(ToolResult::success(forecast))
    }

    async fn forecast(&self, latitude: f64, longitude: f64) -> Result<Value, ToolError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&forecast_query(latitude, longitude))
            .send()
            .await?;
        Ok(check_status(response).await?.json::<Value>().await?)
    }
}

fn forecast_query(latitude: f64, longitude: f64) -> Vec<(&'static str, String)> {
    vec![
        ("latitude", latitude.to_string()),
        ("longitude", longitude.to_string()),
        ("current", "temperature_2m".to_string()),
        ("hourly", "temperature_2m".to_string()),
        ("daily", "sunrise,sunset".to_string()),
        ("timezone", "auto".to_string()),
    ]
}

fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), ToolError> {
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(ToolError::InvalidArgs(format!(
            "coordinates out of range: {}, {}",
            latitude, longitude
        )));
    }
    Ok(())
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        TOOL_WEATHER
    }

    fn description(&self) -> &str {
        "Get the current weather at a location"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "latitude": {"type": "number"},
                "longitude": {"type": "number"}
            },
            "required": ["latitude", "longitude"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> ToolResult {
        self.run(&args).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_requests_current_temperature() {
        let query = forecast_query(23.81, 90.41);
        assert!(query.contains(&("latitude", "23.81".to_string())));
        assert!(query.contains(&("current", "temperature_2m".to_string())));
    }

    #[test]
    fn test_rejects_out_of_range_coordinates() {
        assert!(validate_coordinates(23.8, 90.4).is_ok());
        assert!(validate_coordinates(91.0, 0.0).is_err());
        assert!(validate_coordinates(0.0, -181.0).is_err());
    }
}
