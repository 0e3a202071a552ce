//! Readiness endpoint

use crate::state::SharedState;
use axum::extract::State;
use axum::Json;
use serde_json::json;
use std::time::{Duration, UNIX_EPOCH};

pub async fn ready(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let uptime = state.uptime();
    let start_unix = state
        .started_wall
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();

    Json(json!({
        "ready": true,
        "service": "hubgate",
        "start_time_unix": start_unix,
        "uptime_sec": uptime.as_secs_f64(),
        "uptime_human": format_uptime(uptime),
    }))
}

fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d{}h", secs / 86400, (secs % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_buckets() {
        assert_eq!(format_uptime(Duration::from_secs(42)), "42s");
        assert_eq!(format_uptime(Duration::from_secs(192)), "3m12s");
        assert_eq!(format_uptime(Duration::from_secs(7500)), "2h5m");
        assert_eq!(format_uptime(Duration::from_secs(100800)), "1d4h");
    }
}
