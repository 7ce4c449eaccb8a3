// Energy and carbon accounting for one session

use serde::Serialize;

/// Grid carbon intensity, gCO2e per kWh
pub const CO2_INTENSITY_G_PER_KWH: f64 = 468.0;

const WATT_SECONDS_PER_KWH: f64 = 3_600_000.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Running totals for the life of one session
#[derive(Debug, Clone, Default)]
pub struct SustainabilityAccumulator {
    energy_kwh: f64,
    network_bytes: u64,
    kwh_per_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkFootprint {
    pub bytes: u64,
    pub gb: f64,
    pub energy_kwh: f64,
    pub co2e_g: f64,
    pub kwh_per_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SustainabilityReport {
    pub energy_kwh: f64,
    pub co2e_g: f64,
    pub intensity_g_per_kwh: f64,
    pub device_co2e_g: f64,
    pub network: NetworkFootprint,
}

impl SustainabilityAccumulator {
    pub fn new(kwh_per_gb: f64) -> Self {
        Self {
            energy_kwh: 0.0,
            network_bytes: 0,
            kwh_per_gb,
        }
    }

    /// Integrate one tick: power draw (if known) over `elapsed` seconds and
    /// the bytes moved during it
    pub fn record(&mut self, wattage: Option<f64>, elapsed: f64, network_bytes: u64) {
        let watts = wattage.filter(|w| w.is_finite() && *w > 0.0).unwrap_or(0.0);
        self.energy_kwh += watts * elapsed / WATT_SECONDS_PER_KWH;
        self.network_bytes = self.network_bytes.saturating_add(network_bytes);
    }

    /// Cumulative figures; CO2e is derived, never stored
    pub fn report(&self) -> SustainabilityReport {
        let gb = self.network_bytes as f64 / BYTES_PER_GB;
        let network_energy_kwh = gb * self.kwh_per_gb;
        let network_co2e_g = network_energy_kwh * CO2_INTENSITY_G_PER_KWH;
        let device_co2e_g = self.energy_kwh * CO2_INTENSITY_G_PER_KWH;
        SustainabilityReport {
            energy_kwh: self.energy_kwh,
            co2e_g: device_co2e_g + network_co2e_g,
            intensity_g_per_kwh: CO2_INTENSITY_G_PER_KWH,
            device_co2e_g,
            network: NetworkFootprint {
                bytes: self.network_bytes,
                gb,
                energy_kwh: network_energy_kwh,
                co2e_g: network_co2e_g,
                kwh_per_gb: self.kwh_per_gb,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_wattage_converges() {
        let mut acc = SustainabilityAccumulator::new(0.06);
        let watts = 42.0;
        let mut total = 0.0;
        // jittery tick lengths around one second
        for i in 0..3600 {
            let elapsed = 1.0 + ((i % 7) as f64 - 3.0) * 0.01;
            acc.record(Some(watts), elapsed, 0);
            total += elapsed;
        }
        let expected = watts * total / 3_600_000.0;
        let report = acc.report();
        assert!((report.energy_kwh - expected).abs() < 1e-12);
        assert!((report.device_co2e_g - expected * CO2_INTENSITY_G_PER_KWH).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_wattage_adds_nothing() {
        let mut acc = SustainabilityAccumulator::new(0.06);
        acc.record(None, 1.0, 0);
        acc.record(Some(f64::NAN), 1.0, 0);
        assert_eq!(acc.report().energy_kwh, 0.0);
    }

    #[test]
    fn test_network_footprint() {
        let mut acc = SustainabilityAccumulator::new(0.06);
        acc.record(None, 1.0, 1024 * 1024 * 1024);
        acc.record(None, 1.0, 1024 * 1024 * 1024);

        let report = acc.report();
        assert_eq!(report.network.bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(report.network.gb, 2.0);
        assert!((report.network.energy_kwh - 0.12).abs() < 1e-12);
        assert!((report.network.co2e_g - 0.12 * 468.0).abs() < 1e-9);
        assert_eq!(report.co2e_g, report.device_co2e_g + report.network.co2e_g);
        assert_eq!(report.intensity_g_per_kwh, 468.0);
    }
}
