//! The built-in register catalogue for this inverter model.
//!
//! Addresses, scale factors and label sets are carried over verbatim from
//! the vendor-specific exporter this daemon replaces; see the Open
//! Questions note for 33149/33281/33142's documented-vs-observed scale
//! discrepancies, preserved here rather than "corrected".

use anyhow::Result;
use prometheus::{Gauge, GaugeVec, Opts, Registry};

use crate::dispatch::{
    decode_s16, decode_s32, decode_u16, decode_u32, BatteryCurrentHandler, Dispatcher,
    GaugeHandler, GaugeVecHandler, Handler, InverterInfoHandler,
};

/// Builds a scalar gauge. Registration happens lazily inside
/// [`GaugeHandler`] on first decode, so this never touches `registry`
/// directly — the parameter just keeps call sites uniform with
/// [`vec_gauge`].
fn scalar(_registry: &Registry, name: &str, help: &str) -> Gauge {
    Gauge::with_opts(Opts::new(name, help)).expect("static gauge options are always valid")
}

fn vec_gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
    let vec = GaugeVec::new(Opts::new(name, help), labels)?;
    match registry.register(Box::new(vec.clone())) {
        Ok(()) => {}
        Err(prometheus::Error::AlreadyReg) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(vec)
}

/// Builds the full dispatcher, registering every gauge/vector with
/// `registry` per the rules in [`crate::dispatch`] (vectors eagerly here,
/// scalars lazily on first decode).
pub fn build_catalogue(registry: &Registry) -> Result<Dispatcher> {
    let mut d = Dispatcher::new();

    // 33000: inverter info.
    let info = vec_gauge(
        registry,
        "solis_inverter_info",
        "Static information about the inverter",
        &["model", "dsp_version", "lcd_version", "protocol_version", "serial"],
    )?;
    d.add_handler(33000, Handler::InverterInfo(InverterInfoHandler::new(info)))?;

    // 33029-33039: lifetime/annual/monthly/daily yield.
    let energy = vec_gauge(
        registry,
        "solis_inverter_energy",
        "Inverter total power generation and use",
        &["type", "period"],
    )?;
    for (base, period, decode) in [
        (33029u16, "all", decode_u32(1.0)),
        (33031, "month", decode_u32(1.0)),
        (33033, "month-1", decode_u32(1.0)),
        (33035, "day", decode_u16(0.1)),
        (33036, "day-1", decode_u16(0.1)),
        (33037, "year", decode_u32(1.0)),
        (33039, "year-1", decode_u32(1.0)),
    ] {
        d.add_handler(
            base,
            Handler::GaugeVec(GaugeVecHandler::new(
                energy.clone(),
                vec!["yield".to_string(), period.to_string()],
                decode,
            )),
        )?;
    }

    // 33049-33057: PV array DC voltage/current, total DC power.
    let dc_voltage = vec_gauge(registry, "solis_inverter_dc_voltage", "PV array DC voltage", &["pv"])?;
    let dc_current = vec_gauge(registry, "solis_inverter_dc_current", "PV array DC current", &["pv"])?;
    for pv in 0u16..2 {
        let label = (pv + 1).to_string();
        d.add_handler(
            33049 + pv * 2,
            Handler::GaugeVec(GaugeVecHandler::new(dc_voltage.clone(), vec![label.clone()], decode_u16(0.1))),
        )?;
        d.add_handler(
            33050 + pv * 2,
            Handler::GaugeVec(GaugeVecHandler::new(dc_current.clone(), vec![label], decode_u16(0.1))),
        )?;
    }
    d.add_handler(
        33057,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_dc_power", "Total DC output power (W)"),
            registry.clone(),
            decode_u32(1.0),
        )),
    )?;

    // 33073-33083: inverter AC voltage/current per phase, total power.
    let ac_voltage = vec_gauge(registry, "solis_inverter_ac_voltage", "Inverter AC voltage", &["phase"])?;
    let ac_current = vec_gauge(registry, "solis_inverter_ac_current", "Inverter AC current", &["phase"])?;
    for (i, phase) in ["U", "V", "W"].into_iter().enumerate() {
        d.add_handler(
            33073 + i as u16,
            Handler::GaugeVec(GaugeVecHandler::new(ac_voltage.clone(), vec![phase.to_string()], decode_u16(0.1))),
        )?;
        d.add_handler(
            33076 + i as u16,
            Handler::GaugeVec(GaugeVecHandler::new(ac_current.clone(), vec![phase.to_string()], decode_u16(0.1))),
        )?;
    }
    d.add_handler(
        33079,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_power_active", "Inverter total active power (W)"),
            registry.clone(),
            decode_s32(1.0),
        )),
    )?;
    d.add_handler(
        33081,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_power_reactive", "Inverter total reactive power (Var)"),
            registry.clone(),
            decode_s32(1.0),
        )),
    )?;
    d.add_handler(
        33083,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_power_apparent", "Inverter total apparent power (VA)"),
            registry.clone(),
            decode_s32(1.0),
        )),
    )?;

    // 33093-33095: temperature, frequency, operating state.
    d.add_handler(
        33093,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_temperature", "Inverter temperature - degrees C"),
            registry.clone(),
            decode_s16(0.1),
        )),
    )?;
    d.add_handler(
        33094,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_frequency", "Inverter output frequency"),
            registry.clone(),
            decode_u16(0.01),
        )),
    )?;
    d.add_handler(
        33095,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_operating_state", "Inverter operating state, register 33095"),
            registry.clone(),
            decode_u16(1.0),
        )),
    )?;

    // 33116-33121: fault flags, working status.
    let fault = vec_gauge(registry, "solis_inverter_fault_flags", "Fault flags, register 33116-33120", &["code"])?;
    for (i, code) in ["01", "02", "03", "04", "05"].into_iter().enumerate() {
        d.add_handler(
            33116 + i as u16,
            Handler::GaugeVec(GaugeVecHandler::new(fault.clone(), vec![code.to_string()], decode_u16(1.0))),
        )?;
    }
    d.add_handler(
        33121,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_working_status_flags", "Working status bits, register 33121"),
            registry.clone(),
            decode_u16(1.0),
        )),
    )?;

    // 33132-33149: storage control and battery state.
    d.add_handler(
        33132,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_storage_control_flags", "Energy storage control mode, register 33132"),
            registry.clone(),
            decode_u16(1.0),
        )),
    )?;
    d.add_handler(
        33133,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_battery_voltage", "Battery voltage"),
            registry.clone(),
            decode_u16(0.1),
        )),
    )?;
    d.add_handler(
        33134,
        Handler::BatteryCurrent(BatteryCurrentHandler::new(
            scalar(registry, "solis_battery_current", "Battery current (+ = charging, - = discharging)"),
            registry.clone(),
            0.1,
        )),
    )?;
    d.add_handler(
        33137,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_backup_voltage", "Backup output voltage"),
            registry.clone(),
            decode_u16(0.1),
        )),
    )?;
    d.add_handler(
        33138,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_backup_current", "Backup output current"),
            registry.clone(),
            // Documentation appears to have the wrong scale factor; preserved as observed.
            decode_u16(0.01),
        )),
    )?;
    d.add_handler(
        33139,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_battery_soc", "Battery state of charge - percent"),
            registry.clone(),
            decode_u16(1.0),
        )),
    )?;
    d.add_handler(
        33140,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_battery_soh", "Battery state of health - percent"),
            registry.clone(),
            decode_u16(1.0),
        )),
    )?;
    d.add_handler(
        33141,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_bms_battery_voltage", "BMS battery voltage"),
            registry.clone(),
            decode_u16(0.01),
        )),
    )?;
    d.add_handler(
        33142,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_bms_battery_current", "BMS battery current"),
            registry.clone(),
            // Documented scale factor is wrong and this has never been observed negative;
            // signed decoding is preserved regardless.
            decode_s16(0.1),
        )),
    )?;
    d.add_handler(
        33143,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_bms_charge_limit_current", "BMS battery charge limit - Amps"),
            registry.clone(),
            decode_u16(0.1),
        )),
    )?;
    d.add_handler(
        33144,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_bms_discharge_limit_current", "BMS battery discharge limit - Amps"),
            registry.clone(),
            decode_u16(0.1),
        )),
    )?;
    let battery_failure = vec_gauge(
        registry,
        "solis_bms_failure_flags",
        "BMS battery failure information, register 33145-33146",
        &["code"],
    )?;
    for (i, code) in ["01", "02"].into_iter().enumerate() {
        d.add_handler(
            33145 + i as u16,
            Handler::GaugeVec(GaugeVecHandler::new(battery_failure.clone(), vec![code.to_string()], decode_u16(1.0))),
        )?;
    }
    d.add_handler(
        33147,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_load_power", "House load power (W)"),
            registry.clone(),
            decode_u16(1.0),
        )),
    )?;
    d.add_handler(
        33148,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_inverter_backup_power", "Backup load power (W)"),
            registry.clone(),
            decode_u16(1.0),
        )),
    )?;
    // 33149 (battery power) is deliberately unmapped: documented as S32 but
    // observed on the wire as a 16-bit quantity; width is whatever the
    // foreign master actually requests, so no fixed-width handler is safe.

    // 33161-33180: charge/discharge/import/export/load totals.
    for (base, kind) in [
        (33161u16, "charge"),
        (33165, "discharge"),
        (33169, "import"),
        (33173, "export"),
        (33177, "load"),
    ] {
        d.add_handler(
            base,
            Handler::GaugeVec(GaugeVecHandler::new(
                energy.clone(),
                vec![kind.to_string(), "all".to_string()],
                decode_u32(1.0),
            )),
        )?;
        d.add_handler(
            base + 2,
            Handler::GaugeVec(GaugeVecHandler::new(
                energy.clone(),
                vec![kind.to_string(), "day".to_string()],
                decode_u16(0.1),
            )),
        )?;
        d.add_handler(
            base + 3,
            Handler::GaugeVec(GaugeVecHandler::new(
                energy.clone(),
                vec![kind.to_string(), "day-1".to_string()],
                decode_u16(0.1),
            )),
        )?;
    }

    // 33251-33286: grid meter block.
    let grid_voltage = vec_gauge(registry, "solis_grid_voltage", "Grid AC voltage", &["phase"])?;
    let grid_current = vec_gauge(registry, "solis_grid_current", "Grid AC current", &["phase"])?;
    for (i, phase) in ["U", "V", "W"].into_iter().enumerate() {
        d.add_handler(
            33251 + i as u16 * 2,
            Handler::GaugeVec(GaugeVecHandler::new(grid_voltage.clone(), vec![phase.to_string()], decode_u16(0.1))),
        )?;
        d.add_handler(
            33252 + i as u16 * 2,
            Handler::GaugeVec(GaugeVecHandler::new(grid_current.clone(), vec![phase.to_string()], decode_u16(0.01))),
        )?;
    }
    d.add_handler(
        33263,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_grid_power_active", "Grid total active power (W)"),
            registry.clone(),
            decode_s32(1.0),
        )),
    )?;
    d.add_handler(
        33271,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_grid_power_reactive", "Grid total reactive power (Var)"),
            registry.clone(),
            decode_s32(1.0),
        )),
    )?;
    d.add_handler(
        33279,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_grid_power_apparent", "Grid total apparent power (VA)"),
            registry.clone(),
            decode_s32(1.0),
        )),
    )?;
    // 33281 (grid power factor) is deliberately unmapped: the encoding has
    // never been satisfactorily decoded against observed traffic.
    d.add_handler(
        33282,
        Handler::Gauge(GaugeHandler::new(
            scalar(registry, "solis_grid_frequency", "Grid frequency"),
            registry.clone(),
            decode_u16(0.01),
        )),
    )?;
    let grid_energy = vec_gauge(registry, "solis_grid_energy", "Grid meter total power import and export", &["type"])?;
    d.add_handler(
        33283,
        Handler::GaugeVec(GaugeVecHandler::new(grid_energy.clone(), vec!["import".to_string()], decode_u32(0.01))),
    )?;
    d.add_handler(
        33285,
        Handler::GaugeVec(GaugeVecHandler::new(grid_energy, vec!["export".to_string()], decode_u32(0.01))),
    )?;

    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Exchange;

    #[test]
    fn catalogue_builds_without_duplicate_registrations() {
        let registry = Registry::new();
        build_catalogue(&registry).expect("catalogue should register cleanly");
    }

    #[test]
    fn s3_grid_power_active_decodes_negative() {
        let registry = Registry::new();
        let dispatcher = build_catalogue(&registry).unwrap();

        // Register 33263 is offset 12 registers (24 bytes) into a base-33251 block;
        // here we dispatch directly against a base-33263 read for clarity.
        let exchange = Exchange {
            station: 1,
            base: 33263,
            count: 2,
            function: 4,
            data: vec![0xFF, 0xFF, 0xFE, 0x62],
            ..Exchange::new(true)
        };
        dispatcher.dispatch(1, &exchange);

        let families = registry.gather();
        let metric = families
            .iter()
            .find(|f| f.get_name() == "solis_grid_power_active")
            .expect("gauge should be registered after first decode");
        let value = metric.get_metric()[0].get_gauge().get_value();
        assert_eq!(value, -414.0);
    }

    /// A real captured request/response pair (base 33000, count 41) covering
    /// the inverter-info block plus several energy-yield registers in one
    /// read, parsed through the full frame codec and dispatched end to end.
    #[test]
    fn captured_33000_block_decodes_info_and_energy_registers() {
        let req = hex("010480E800299820");
        let resp = hex(
            "01045231050032003C0001363031303539393939393939393939\
             00000000000000000000000000000000000000000000\
             16000B000D001300240020000000000CF5000000460000016D0029001B\
             00000CF500000000CC5F",
        );

        let mut exchange = Exchange::new(true);
        assert_eq!(crate::frame::parse_request(&req, &mut exchange), 0);
        assert!(exchange.error.is_none());
        assert_eq!(crate::frame::parse_response(&resp, &mut exchange), 0);
        assert!(exchange.error.is_none());
        assert_eq!(exchange.base, 33000);
        assert_eq!(exchange.count, 41);

        let registry = Registry::new();
        let dispatcher = build_catalogue(&registry).unwrap();
        dispatcher.dispatch(1, &exchange);

        let families = registry.gather();
        let info = families
            .iter()
            .find(|f| f.get_name() == "solis_inverter_info")
            .expect("info vec should be registered eagerly");
        let sample = &info.get_metric()[0];
        let labels: std::collections::HashMap<_, _> = sample
            .get_label()
            .iter()
            .map(|l| (l.get_name(), l.get_value()))
            .collect();
        assert_eq!(labels["model"], "3105");
        assert_eq!(labels["dsp_version"], "0032");
        assert_eq!(labels["lcd_version"], "003C");
        assert_eq!(labels["protocol_version"], "0001");
        assert_eq!(labels["serial"], "6031059999999999");
        assert_eq!(sample.get_gauge().get_value(), 1.0);

        let energy = families
            .iter()
            .find(|f| f.get_name() == "solis_inverter_energy")
            .expect("energy vec should be registered eagerly");
        let find = |period: &str| {
            energy
                .get_metric()
                .iter()
                .find(|m| m.get_label().iter().any(|l| l.get_value() == period))
                .map(|m| m.get_gauge().get_value())
        };
        assert_eq!(find("all"), Some(3317.0));
        assert_eq!(find("month"), Some(70.0));
        assert_eq!(find("month-1"), Some(365.0));
        assert_eq!(find("year"), Some(3317.0));
    }

    fn hex(s: &str) -> Vec<u8> {
        let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        (0..cleaned.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16).unwrap())
            .collect()
    }
}
