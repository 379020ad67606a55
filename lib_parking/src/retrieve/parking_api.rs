//! # Parking REST Client
//!
//! An asynchronous client for the lot and booking endpoints, built on
//! `reqwest` with `reqwest-middleware` so transient failures are retried
//! with exponential backoff.
//!
//! Non-2xx responses are not errors: they come back as an [`ApiResponse`]
//! with `success == false` and the raw body kept for diagnostics. Only
//! network failures, bad URLs and undecodable 2xx bodies surface as `Err`.

use chrono::{DateTime, Duration, Utc};
use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    Method, Url,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// A response body together with the HTTP metadata it arrived with.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body of a successful response.
    pub data: Option<T>,
    /// The raw body of a failed response.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Whether the status was in the 2xx range.
    pub success: bool,
    /// The response headers.
    pub headers: HeaderMap,
}

/// A parking lot as served by `GET /api/parking-lots/{id}/`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ParkingLot {
    /// Lot id.
    pub id: i64,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Free spaces at the time of the request.
    #[serde(default)]
    pub available_spaces: Option<i64>,
    /// Hourly rate. The backend sends decimals as strings.
    #[serde(default)]
    pub hourly_rate: Option<Value>,
    /// Every other attribute the server sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ParkingLot {
    /// The hourly rate as a number, whether it was sent as one or as a string.
    pub fn hourly_rate(&self) -> Option<f64> {
        match self.hourly_rate.as_ref()? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Body of `POST /api/bookings/`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingRequest {
    /// The spot to book.
    pub parking_spot: i64,
    /// Start of the booking.
    pub start_time: DateTime<Utc>,
    /// End of the booking.
    pub end_time: DateTime<Utc>,
}

impl BookingRequest {
    /// A one-hour booking of `spot` starting at `start`.
    pub fn one_hour(spot: i64, start: DateTime<Utc>) -> Self {
        Self {
            parking_spot: spot,
            start_time: start,
            end_time: start + Duration::hours(1),
        }
    }
}

/// A booking as returned by `POST /api/bookings/`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Booking {
    /// Booking id, used to build the payment path.
    pub id: i64,
    /// Booking state, e.g. `pending`.
    #[serde(default)]
    pub status: Option<String>,
    /// Every other attribute the server sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Booking {
    /// Where the booking is paid for.
    pub fn payment_path(&self) -> String {
        format!("/payment/{}", self.id)
    }
}

/// Client for the parking backend's REST API.
pub struct ParkingApi {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ParkingApi {
    /// Creates a client for the backend at `base_url`, e.g.
    /// `http://localhost:8000`. Transient failures are retried up to three
    /// times.
    pub fn new(base_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        let mut url = Url::parse(base_url)?;
        if url.cannot_be_a_base() {
            anyhow::bail!("'{}' cannot be used as a base URL", base_url);
        }
        // Url::join drops the last segment unless the path ends in '/'.
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token,
        })
    }

    /// The URL every request path is joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetches one lot.
    pub async fn get_parking_lot(&self, id: i64) -> anyhow::Result<ApiResponse<ParkingLot>> {
        let url = self.endpoint(&format!("api/parking-lots/{}/", id))?;
        let response = self.authorized(Method::GET, url).send().await?;
        read_response(response).await
    }

    /// Creates a booking.
    pub async fn create_booking(&self, booking: &BookingRequest) -> anyhow::Result<ApiResponse<Booking>> {
        let url = self.endpoint("api/bookings/")?;
        let response = self
            .authorized(Method::POST, url)
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_string(booking)?)
            .send()
            .await?;
        read_response(response).await
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn authorized(&self, method: Method, url: Url) -> RequestBuilder {
        log::debug!("{} {}", method, url);
        let request = self.inner.request(method, url);
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Decodes a 2xx body into `T`; any other status keeps the body as text.
async fn read_response<T: DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<ApiResponse<T>> {
    let status = response.status();
    let headers = response.headers().clone();

    if !status.is_success() {
        log::warn!("{} answered {}", response.url(), status);
        return Ok(ApiResponse {
            data: None,
            error_body: response.text().await.ok(),
            status: status.as_u16(),
            success: false,
            headers,
        });
    }

    Ok(ApiResponse {
        data: Some(response.json::<T>().await?),
        error_body: None,
        status: status.as_u16(),
        success: true,
        headers,
    })
}
