use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::GeocodeError;
use crate::models::location::Coordinate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TravelMode {
    Car,
    Bike,
    Truck,
    Taxi,
}

impl TravelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TravelMode::Car => "car",
            TravelMode::Bike => "bike",
            TravelMode::Truck => "truck",
            TravelMode::Taxi => "taxi",
        }
    }
}

impl std::str::FromStr for TravelMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "car" => Ok(TravelMode::Car),
            "bike" => Ok(TravelMode::Bike),
            "truck" => Ok(TravelMode::Truck),
            "taxi" => Ok(TravelMode::Taxi),
            other => Err(format!(
                "unknown travel mode {other}, expected car/bike/truck/taxi"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResponse {
    pub geometry: String,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` when the provider has no match for the address.
    async fn geocode_address(&self, text: &str) -> Result<Option<Coordinate>, GeocodeError>;

    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        mode: TravelMode,
    ) -> Result<RouteResponse, GeocodeError>;
}

#[derive(Clone)]
pub struct HttpGeocoder {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpGeocoder {
    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn get<T>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, GeocodeError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .query(&[("api_key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|err| GeocodeError::Request(err.to_string()))?;

        if !resp.status().is_success() {
            return Err(GeocodeError::Status(resp.status().as_u16()));
        }

        resp.json::<T>()
            .await
            .map_err(|err| GeocodeError::Request(err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: GeocodeGeometry,
}

#[derive(Debug, Deserialize)]
struct GeocodeGeometry {
    location: Coordinate,
}

#[derive(Debug, Deserialize)]
struct DirectionResponse {
    #[serde(default)]
    routes: Vec<DirectionRoute>,
}

#[derive(Debug, Deserialize)]
struct DirectionRoute {
    overview_polyline: OverviewPolyline,
}

#[derive(Debug, Deserialize)]
struct OverviewPolyline {
    points: String,
}

fn lat_lng_param(coordinate: &Coordinate) -> String {
    format!("{},{}", coordinate.lat, coordinate.lng)
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode_address(&self, text: &str) -> Result<Option<Coordinate>, GeocodeError> {
        let parsed: GeocodeResponse = self.get("geocode", &[("address", text)]).await?;
        let first = parsed.results.into_iter().next().map(|r| r.geometry.location);
        debug!(address = text, found = first.is_some(), "geocoded address");
        Ok(first)
    }

    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        mode: TravelMode,
    ) -> Result<RouteResponse, GeocodeError> {
        let origin = lat_lng_param(&origin);
        let destination = lat_lng_param(&destination);
        let parsed: DirectionResponse = self
            .get(
                "Direction",
                &[
                    ("origin", origin.as_str()),
                    ("destination", destination.as_str()),
                    ("vehicle", mode.as_str()),
                ],
            )
            .await?;

        parsed
            .routes
            .into_iter()
            .next()
            .map(|route| RouteResponse {
                geometry: route.overview_polyline.points,
            })
            .ok_or(GeocodeError::NoRoute)
    }
}
