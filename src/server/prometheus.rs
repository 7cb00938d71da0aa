//! Prometheus text-format (v0.0.4) export of fleet and per-machine
//! metrics. Rendered by hand, like the boot-script templates: it is a
//! plain-text wire format over data we already hold.

use std::collections::BTreeMap;
use std::fmt::Write;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use entity::{machine, machine_metrics};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};

use crate::error::ApiError;
use crate::state::AppState;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub async fn export(State(state): State<AppState>) -> Result<Response, ApiError> {
    let machines = machine::Entity::find().all(&state.db).await?;

    let mut samples = Vec::with_capacity(machines.len());
    for machine in machines {
        let latest = machine_metrics::Entity::find()
            .filter(machine_metrics::Column::MachineId.eq(machine.id.clone()))
            .order_by_desc(machine_metrics::Column::Timestamp)
            .one(&state.db)
            .await?;
        samples.push((machine, latest));
    }

    let body = render(&samples);
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, CONTENT_TYPE)],
        body,
    )
        .into_response())
}

pub fn render(samples: &[(machine::Model, Option<machine_metrics::Model>)]) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "# HELP metal_enrollment_machines_total Total number of enrolled machines"
    );
    let _ = writeln!(out, "# TYPE metal_enrollment_machines_total gauge");
    let _ = writeln!(out, "metal_enrollment_machines_total {}", samples.len());
    out.push('\n');

    let mut status_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for (machine, _) in samples {
        *status_counts.entry(machine.status.as_str()).or_default() += 1;
    }
    let _ = writeln!(
        out,
        "# HELP metal_enrollment_machines_by_status Number of machines by status"
    );
    let _ = writeln!(out, "# TYPE metal_enrollment_machines_by_status gauge");
    for (status, count) in &status_counts {
        let _ = writeln!(
            out,
            "metal_enrollment_machines_by_status{{status=\"{status}\"}} {count}"
        );
    }
    out.push('\n');

    let _ = writeln!(out, "# HELP metal_machine_cpu_usage_percent CPU usage percentage");
    let _ = writeln!(out, "# TYPE metal_machine_cpu_usage_percent gauge");
    let _ = writeln!(out, "# HELP metal_machine_memory_used_bytes Memory used in bytes");
    let _ = writeln!(out, "# TYPE metal_machine_memory_used_bytes gauge");
    let _ = writeln!(out, "# HELP metal_machine_memory_total_bytes Total memory in bytes");
    let _ = writeln!(out, "# TYPE metal_machine_memory_total_bytes gauge");
    let _ = writeln!(out, "# HELP metal_machine_disk_used_bytes Disk used in bytes");
    let _ = writeln!(out, "# TYPE metal_machine_disk_used_bytes gauge");
    let _ = writeln!(out, "# HELP metal_machine_disk_total_bytes Total disk space in bytes");
    let _ = writeln!(out, "# TYPE metal_machine_disk_total_bytes gauge");
    let _ = writeln!(out, "# HELP metal_machine_network_rx_bytes Network received bytes");
    let _ = writeln!(out, "# TYPE metal_machine_network_rx_bytes counter");
    let _ = writeln!(out, "# HELP metal_machine_network_tx_bytes Network transmitted bytes");
    let _ = writeln!(out, "# TYPE metal_machine_network_tx_bytes counter");
    let _ = writeln!(out, "# HELP metal_machine_load_average Load average");
    let _ = writeln!(out, "# TYPE metal_machine_load_average gauge");
    let _ = writeln!(out, "# HELP metal_machine_temperature_celsius Machine temperature in Celsius");
    let _ = writeln!(out, "# TYPE metal_machine_temperature_celsius gauge");
    let _ = writeln!(out, "# HELP metal_machine_uptime_seconds Machine uptime in seconds");
    let _ = writeln!(out, "# TYPE metal_machine_uptime_seconds counter");
    let _ = writeln!(out, "# HELP metal_machine_power_on Whether the machine reports power on");
    let _ = writeln!(out, "# TYPE metal_machine_power_on gauge");

    for (machine, metrics) in samples {
        let Some(metrics) = metrics else { continue };

        let labels = format!(
            "machine_id=\"{}\",hostname=\"{}\",service_tag=\"{}\"",
            machine.id,
            machine.hostname.as_deref().unwrap_or(""),
            machine.service_tag,
        );

        let _ = writeln!(
            out,
            "metal_machine_cpu_usage_percent{{{labels}}} {:.2}",
            metrics.cpu_usage_percent
        );
        let _ = writeln!(
            out,
            "metal_machine_memory_used_bytes{{{labels}}} {}",
            metrics.memory_used_bytes
        );
        let _ = writeln!(
            out,
            "metal_machine_memory_total_bytes{{{labels}}} {}",
            metrics.memory_total_bytes
        );
        let _ = writeln!(
            out,
            "metal_machine_disk_used_bytes{{{labels}}} {}",
            metrics.disk_used_bytes
        );
        let _ = writeln!(
            out,
            "metal_machine_disk_total_bytes{{{labels}}} {}",
            metrics.disk_total_bytes
        );
        let _ = writeln!(
            out,
            "metal_machine_network_rx_bytes{{{labels}}} {}",
            metrics.network_rx_bytes
        );
        let _ = writeln!(
            out,
            "metal_machine_network_tx_bytes{{{labels}}} {}",
            metrics.network_tx_bytes
        );
        let _ = writeln!(
            out,
            "metal_machine_load_average{{{labels},period=\"1m\"}} {:.2}",
            metrics.load_average_1
        );
        let _ = writeln!(
            out,
            "metal_machine_load_average{{{labels},period=\"5m\"}} {:.2}",
            metrics.load_average_5
        );
        let _ = writeln!(
            out,
            "metal_machine_load_average{{{labels},period=\"15m\"}} {:.2}",
            metrics.load_average_15
        );
        if let Some(temperature) = metrics.temperature {
            let _ = writeln!(
                out,
                "metal_machine_temperature_celsius{{{labels}}} {temperature:.2}"
            );
        }
        let _ = writeln!(
            out,
            "metal_machine_uptime_seconds{{{labels}}} {}",
            metrics.uptime_seconds
        );
        let power_on = if metrics.power_state == "on" { 1 } else { 0 };
        let _ = writeln!(out, "metal_machine_power_on{{{labels}}} {power_on}");
    }

    out
}
