//! CPU and memory parsing, plus Fargate tier rounding.
//!
//! CPU is held in units of 1024 per vCPU, memory in megabytes. Fargate only
//! admits fixed (cpu, memory) combinations, so requests round *up* to the
//! nearest supported tier and clamp at the top of the table.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("invalid memory value {0:?}")]
    Memory(String),

    #[error("invalid cpu value {0:?}")]
    Cpu(String),
}

const MIB: f64 = 1024.0 * 1024.0;

/// Parse a memory request into megabytes. Plain integers are megabytes;
/// otherwise a decimal with a unit suffix (`1.5GB`, `2Gi`, `512Mi`, `1Ti`),
/// case-insensitive. Empty input parses to zero.
pub fn parse_memory_mb(input: &str) -> Result<u32, ResourceError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    if let Ok(mb) = trimmed.parse::<u32>() {
        return Ok(mb);
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value = number
        .parse::<f64>()
        .map_err(|_| ResourceError::Memory(input.to_string()))?;
    let bytes = value
        * unit_multiplier(unit).ok_or_else(|| ResourceError::Memory(input.to_string()))?;
    Ok((bytes / MIB).round() as u32)
}

fn unit_multiplier(unit: &str) -> Option<f64> {
    let factor: f64 = match unit.to_ascii_lowercase().as_str() {
        "b" => 1.0,
        "k" | "kb" | "ki" | "kib" => 1024.0,
        "m" | "mb" | "mi" | "mib" => MIB,
        "g" | "gb" | "gi" | "gib" => 1024.0 * MIB,
        "t" | "tb" | "ti" | "tib" => 1024.0 * 1024.0 * MIB,
        _ => return None,
    };
    Some(factor)
}

/// Parse a CPU request into units of 1024 per vCPU. Accepts decimals
/// (`0.5`, `2`) and millicore notation (`500m`). Empty input parses to zero.
pub fn parse_cpu_units(input: &str) -> Result<u32, ResourceError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }

    let (number, millicores) = match trimmed.strip_suffix('m') {
        Some(prefix) => (prefix, true),
        None => (trimmed, false),
    };
    let value = number
        .parse::<f64>()
        .map_err(|_| ResourceError::Cpu(input.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ResourceError::Cpu(input.to_string()));
    }
    let units = if millicores {
        value / 1000.0 * 1024.0
    } else {
        value * 1024.0
    };
    Ok(units.round() as u32)
}

const FARGATE_CPU_TIERS: [u32; 7] = [256, 512, 1024, 2048, 4096, 8192, 16384];

fn fargate_memory_tiers(cpu: u32) -> Option<Vec<u32>> {
    let tiers: Vec<u32> = match cpu {
        256 => vec![512, 1024, 2048],
        512 => vec![1024, 2048, 3072, 4096],
        1024 => (2048..=8192).step_by(1024).collect(),
        2048 => (4096..=16384).step_by(1024).collect(),
        4096 => (8192..=30720).step_by(1024).collect(),
        8192 => (16384..=61440).step_by(4096).collect(),
        16384 => (32768..=122880).step_by(8192).collect(),
        _ => return None,
    };
    Some(tiers)
}

/// Round a memory request up within the per-CPU Fargate table, clamping at
/// the table maximum. CPU tiers outside the table pass the value through
/// untouched, for non-Fargate callers.
pub fn round_memory_for_cpu(cpu: u32, memory: u32) -> u32 {
    match fargate_memory_tiers(cpu) {
        None => memory,
        Some(tiers) => {
            let max = *tiers.last().expect("tier tables are non-empty");
            tiers.into_iter().find(|tier| *tier >= memory).unwrap_or(max)
        }
    }
}

/// Normalize a parsed (cpu, memory) pair to the nearest supported Fargate
/// combination, rounding up and clamping at the maxima.
pub fn fargate_normalize(cpu: u32, memory: u32) -> (u32, u32) {
    let cpu = FARGATE_CPU_TIERS
        .into_iter()
        .find(|tier| *tier >= cpu)
        .unwrap_or(16384);
    (cpu, round_memory_for_cpu(cpu, memory))
}

/// Render a CPU quantity for Kubernetes: whole vCPUs when divisible,
/// two-decimal vCPUs above one, millicores below.
pub fn k8s_cpu_quantity(units: u32) -> String {
    if units >= 1024 {
        if units % 1024 == 0 {
            (units / 1024).to_string()
        } else {
            format!("{:.2}", f64::from(units) / 1024.0)
        }
    } else {
        format!("{}m", (f64::from(units) * 1000.0 / 1024.0).round() as u32)
    }
}

/// Render a memory quantity for Kubernetes.
pub fn k8s_memory_quantity(mb: u32) -> String {
    format!("{mb}Mi")
}
