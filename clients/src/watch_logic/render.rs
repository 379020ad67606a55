use colored::Colorize;
use lib_parking::retrieve::ParkingLot;
use lib_parking::{ConnectionStatus, LotSnapshot, RealtimeEvent};
use serde_json::Value;

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `occupied/total` over the cached spot list.
fn occupancy(snapshot: &LotSnapshot) -> Option<String> {
    let spots = snapshot.spots();
    if spots.is_empty() {
        return None;
    }
    let occupied = spots
        .iter()
        .filter(|spot| spot.get("is_occupied").and_then(Value::as_bool) == Some(true))
        .count();
    Some(format!("{}/{} occupied", occupied, spots.len()))
}

fn describe_lot(snapshot: &LotSnapshot) -> String {
    let mut parts: Vec<String> = snapshot
        .as_map()
        .iter()
        .filter(|(key, value)| key.as_str() != "spots" && !value.is_object() && !value.is_array())
        .map(|(key, value)| format!("{}={}", key, scalar(value)))
        .collect();
    if let Some(occupancy) = occupancy(snapshot) {
        parts.push(format!("spots {}", occupancy));
    }
    parts.join(" ")
}

pub fn render_event(event: &RealtimeEvent) -> String {
    match event {
        RealtimeEvent::ConnectionStatus(status) => {
            let label = status.to_string();
            let label = match status {
                ConnectionStatus::Connected => label.green(),
                ConnectionStatus::Disconnected => label.yellow(),
                ConnectionStatus::Failed => label.red().bold(),
            };
            format!("{} {}", "[connection]".bold(), label)
        }
        RealtimeEvent::ParkingUpdate { id, data } => {
            format!("{} {}", format!("[lot {}]", id).cyan().bold(), describe_lot(data))
        }
        RealtimeEvent::PriceUpdate { id, price } => {
            format!("{} price -> {}", format!("[lot {}]", id).cyan().bold(), format!("{:.2}", price.as_f64()).magenta())
        }
        RealtimeEvent::BookingUpdate(payload) => {
            let id = payload.get("booking_id").or_else(|| payload.get("id")).map(scalar);
            let status = payload.get("status").map(scalar);
            match (id, status) {
                (Some(id), Some(status)) => format!("{} #{} {}", "[booking]".blue().bold(), id, status),
                _ => format!("{} {}", "[booking]".blue().bold(), payload),
            }
        }
        RealtimeEvent::Notification(payload) => {
            let text = payload.get("message").map(scalar).unwrap_or_else(|| payload.to_string());
            format!("{} {}", "[notice]".yellow().bold(), text)
        }
    }
}

pub fn render_lot(lot: &ParkingLot) -> String {
    let mut line = format!("{} {}", format!("[lot {}]", lot.id).cyan().bold(), lot.name);
    if let Some(spaces) = lot.available_spaces {
        line.push_str(&format!(" available_spaces={}", spaces));
    }
    if let Some(rate) = lot.hourly_rate() {
        line.push_str(&format!(" hourly_rate={:.2}", rate));
    }
    line
}
