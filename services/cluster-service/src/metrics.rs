//! Host cluster utilization.
//!
//! Reduces node capacity and node usage samples to one CPU and one memory
//! utilization percentage per host:
//!
//! ```text
//! utilization = sum(usage) / sum(allocatable) * 100    (0 when allocatable is 0)
//! ```
//!
//! CPU is counted in millicores and memory in MiB. Nodes without a usage
//! sample count as idle; samples for unknown nodes are ignored.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::control_plane::{ControlPlane, ControlPlaneError, NodeQuantities};
use crate::placement::HostMetrics;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid {resource} quantity {value:?}")]
    InvalidQuantity { resource: &'static str, value: String },

    #[error("host cluster {host_id}: {source}")]
    ControlPlane {
        host_id: String,
        #[source]
        source: ControlPlaneError,
    },
}

fn invalid(resource: &'static str, value: &str) -> MetricsError {
    MetricsError::InvalidQuantity {
        resource,
        value: value.to_string(),
    }
}

/// Decimal exponent of a suffix such as `e3` or `E-2`. A bare `E` is the
/// exa suffix, not an exponent.
fn decimal_exponent(suffix: &str) -> Option<i32> {
    let digits = suffix.strip_prefix(['e', 'E'])?;
    let unsigned = digits.strip_prefix(['+', '-']).unwrap_or(digits);
    if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Split a quantity into its number and suffix. Exponent notation is folded
/// into the number and leaves an empty suffix.
fn split_quantity<'a>(resource: &'static str, value: &'a str) -> Result<(f64, &'a str), MetricsError> {
    let value = value.trim();
    let boundary = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(boundary);

    let mut number: f64 = number.parse().map_err(|_| invalid(resource, value))?;
    let suffix = match decimal_exponent(suffix) {
        Some(exponent) => {
            number *= 10f64.powi(exponent);
            ""
        }
        None => suffix,
    };
    if !number.is_finite() || number < 0.0 {
        return Err(invalid(resource, value));
    }
    Ok((number, suffix))
}

/// Convert a CPU quantity to millicores.
///
/// `"250m"` is 250, `"1"` is 1000, `"0.5"` is 500, `"1500000n"` is 1.5.
pub fn cpu_millis(value: &str) -> Result<f64, MetricsError> {
    let (number, suffix) = split_quantity("cpu", value)?;
    match suffix {
        "n" => Ok(number / 1_000_000.0),
        "u" => Ok(number / 1_000.0),
        "m" => Ok(number),
        "" => Ok(number * 1_000.0),
        "k" => Ok(number * 1_000_000.0),
        _ => Err(invalid("cpu", value)),
    }
}

/// Convert a memory quantity to MiB.
///
/// `"512Mi"` is 512, `"1Gi"` is 1024, plain numbers are bytes.
pub fn memory_mb(value: &str) -> Result<f64, MetricsError> {
    const MIB: f64 = 1024.0 * 1024.0;

    let (number, suffix) = split_quantity("memory", value)?;
    match suffix {
        "Ki" => Ok(number / 1024.0),
        "Mi" => Ok(number),
        "Gi" => Ok(number * 1024.0),
        "Ti" => Ok(number * 1024.0 * 1024.0),
        "Pi" => Ok(number * 1024.0 * 1024.0 * 1024.0),
        "" => Ok(number / MIB),
        "k" => Ok(number * 1e3 / MIB),
        "M" => Ok(number * 1e6 / MIB),
        "G" => Ok(number * 1e9 / MIB),
        "T" => Ok(number * 1e12 / MIB),
        _ => Err(invalid("memory", value)),
    }
}

/// `used / total * 100`, clamped to [0, 100]; 0 when `total` is 0.
pub fn percentage(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    (used / total * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Default, Clone, Copy)]
struct NodeLoad {
    allocatable_cpu: f64,
    allocatable_mem: f64,
    used_cpu: f64,
    used_mem: f64,
}

/// Reduce node quantities to a host utilization summary.
pub fn summarize(
    host_id: &str,
    allocatable: &[NodeQuantities],
    usage: &[NodeQuantities],
) -> Result<HostMetrics, MetricsError> {
    let mut nodes: HashMap<&str, NodeLoad> = HashMap::with_capacity(allocatable.len());
    for node in allocatable {
        nodes.insert(
            node.node.as_str(),
            NodeLoad {
                allocatable_cpu: cpu_millis(&node.cpu)?,
                allocatable_mem: memory_mb(&node.memory)?,
                ..Default::default()
            },
        );
    }

    for sample in usage {
        if let Some(load) = nodes.get_mut(sample.node.as_str()) {
            load.used_cpu = cpu_millis(&sample.cpu)?;
            load.used_mem = memory_mb(&sample.memory)?;
        }
    }

    let total = nodes.values().fold(NodeLoad::default(), |acc, n| NodeLoad {
        allocatable_cpu: acc.allocatable_cpu + n.allocatable_cpu,
        allocatable_mem: acc.allocatable_mem + n.allocatable_mem,
        used_cpu: acc.used_cpu + n.used_cpu,
        used_mem: acc.used_mem + n.used_mem,
    });

    Ok(HostMetrics {
        host_id: host_id.to_string(),
        cpu_pct: percentage(total.used_cpu, total.allocatable_cpu),
        mem_pct: percentage(total.used_mem, total.allocatable_mem),
    })
}

/// Collect the utilization summary of one host.
#[instrument(skip(control_plane))]
pub async fn collect(
    host_id: &str,
    control_plane: &dyn ControlPlane,
) -> Result<HostMetrics, MetricsError> {
    let wrap = |source| MetricsError::ControlPlane {
        host_id: host_id.to_string(),
        source,
    };

    let (allocatable, usage) = tokio::try_join!(
        control_plane.list_node_allocatable(),
        control_plane.list_node_usage()
    )
    .map_err(wrap)?;

    let metrics = summarize(host_id, &allocatable, &usage)?;
    debug!(
        nodes = allocatable.len(),
        cpu_pct = metrics.cpu_pct,
        mem_pct = metrics.mem_pct,
        "Collected host metrics"
    );
    Ok(metrics)
}
