use uom::si::{
    electric_current::ampere, electric_potential::volt, f64::*, power::watt, ratio::ratio,
};

use crate::element::{BatteryId, BusId, VoltageRange};

/// The exclusive operating states of a chargeable source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatteryState {
    Idle,
    Sourcing,
    Charging,
}

/// Construction parameters for a [`Battery`].
pub struct BatterySpec {
    pub operating_range: VoltageRange,
    /// Power cap while feeding the bus.
    pub max_power: Power,
    /// Power drawn from the bus while charging (demanded at load 1).
    pub max_charging_power: Power,
    pub max_charge: Energy,
    pub charging_efficiency: Ratio,
    pub internal_resistance: ElectricalResistance,
    pub location_id: u32,
    /// Charge fraction below which autoswitch refuses to source; also the
    /// level whose downward crossing emits `on_charge_low`.
    pub low_charge_fraction: Ratio,
}

/// A source that doubles as a consumer: it feeds its bus while SOURCING,
/// draws `max_charging_power` from it while CHARGING, and sits out while
/// IDLE. With autoswitch enabled the state follows the balance of the
/// surrounding circuit each tick; the host can override with
/// [`set_parent_switched_in`](crate::CircuitManager::set_parent_switched_in)
/// and [`set_to_charging`](crate::CircuitManager::set_to_charging).
pub struct Battery {
    pub(crate) id: BatteryId,
    pub(crate) operating_range: VoltageRange,
    pub(crate) location_id: u32,
    pub(crate) max_power: Power,
    pub(crate) max_charging_power: Power,
    pub(crate) max_charge: Energy,
    pub(crate) charge: Energy,
    pub(crate) charging_efficiency: Ratio,
    pub(crate) internal_resistance: ElectricalResistance,
    pub(crate) low_charge_fraction: Ratio,
    pub(crate) autoswitch_enabled: bool,
    pub(crate) state: BatteryState,
    pub(crate) bus: Option<BusId>,
    pub(crate) output_current: ElectricCurrent,
    pub(crate) output_voltage: ElectricPotential,
    pub(crate) input_current: ElectricCurrent,
    pub(crate) charging_power: Power,
    pub(crate) running: bool,
    pub(crate) charging_load: Ratio,
    pub(crate) pending_delivery: f64,
    pub(crate) charge_low_armed: bool,
}

/// Which switch flanks a state change produced; the manager turns these
/// into events.
#[derive(Default)]
pub(crate) struct BatteryTransition {
    pub parent_in: bool,
    pub parent_out: bool,
    pub child_in: bool,
    pub child_out: bool,
}

impl Battery {
    pub(crate) fn new(id: BatteryId, spec: BatterySpec) -> Self {
        Self {
            id,
            operating_range: spec.operating_range,
            location_id: spec.location_id,
            max_power: spec.max_power,
            max_charging_power: spec.max_charging_power,
            max_charge: spec.max_charge,
            charge: spec.max_charge,
            charging_efficiency: spec.charging_efficiency,
            internal_resistance: spec.internal_resistance,
            low_charge_fraction: spec.low_charge_fraction,
            autoswitch_enabled: true,
            state: BatteryState::Idle,
            bus: None,
            output_current: ElectricCurrent::new::<ampere>(0.),
            output_voltage: ElectricPotential::new::<volt>(0.),
            input_current: ElectricCurrent::new::<ampere>(0.),
            charging_power: Power::new::<watt>(0.),
            running: false,
            charging_load: Ratio::new::<ratio>(1.),
            pending_delivery: 0.,
            // Batteries start full, above any sensible low level.
            charge_low_armed: true,
        }
    }

    pub fn id(&self) -> BatteryId {
        self.id
    }

    pub fn operating_range(&self) -> VoltageRange {
        self.operating_range
    }

    pub fn state(&self) -> BatteryState {
        self.state
    }

    pub fn is_parent_switched_in(&self) -> bool {
        self.state == BatteryState::Sourcing
    }

    pub fn is_child_switched_in(&self) -> bool {
        self.state == BatteryState::Charging
    }

    pub fn is_autoswitch_enabled(&self) -> bool {
        self.autoswitch_enabled
    }

    pub fn charge(&self) -> Energy {
        self.charge
    }

    pub fn max_charge(&self) -> Energy {
        self.max_charge
    }

    pub fn charging_efficiency(&self) -> Ratio {
        self.charging_efficiency
    }

    pub fn max_power(&self) -> Power {
        self.max_power
    }

    pub fn max_charging_power(&self) -> Power {
        self.max_charging_power
    }

    pub fn internal_resistance(&self) -> ElectricalResistance {
        self.internal_resistance
    }

    pub fn bus(&self) -> Option<BusId> {
        self.bus
    }

    pub fn output_current(&self) -> ElectricCurrent {
        self.output_current
    }

    pub fn output_power(&self) -> Power {
        self.output_current * self.output_voltage
    }

    pub fn input_current(&self) -> ElectricCurrent {
        self.input_current
    }

    /// Power drawn from the bus during the last tick while charging.
    pub fn charging_power(&self) -> Power {
        self.charging_power
    }

    /// The load this battery demands as a consumer: 1 while charging
    /// (even when the circuit cannot feed it), 0 otherwise.
    pub fn load(&self) -> Ratio {
        match self.state {
            BatteryState::Charging => Ratio::new::<ratio>(1.),
            _ => Ratio::new::<ratio>(0.),
        }
    }

    /// True while the battery is charging and current actually flows in.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn charge_fraction(&self) -> Ratio {
        self.charge / self.max_charge
    }

    pub(crate) fn transition(&mut self, new: BatteryState) -> BatteryTransition {
        let mut flanks = BatteryTransition::default();
        if self.state == new {
            return flanks;
        }
        match self.state {
            BatteryState::Sourcing => flanks.parent_out = true,
            BatteryState::Charging => flanks.child_out = true,
            BatteryState::Idle => {}
        }
        match new {
            BatteryState::Sourcing => flanks.parent_in = true,
            BatteryState::Charging => flanks.child_in = true,
            BatteryState::Idle => {}
        }
        self.state = new;
        flanks
    }

    /// Power this battery can feed into its bus.
    pub(crate) fn capacity_watts(&self) -> f64 {
        self.max_power.get::<watt>()
    }

    /// Power demanded from the bus while charging, after any shedding of
    /// the charging load.
    pub(crate) fn charging_watts(&self) -> f64 {
        if self.state != BatteryState::Charging {
            return 0.;
        }
        self.max_charging_power.get::<watt>() * self.charging_load.get::<ratio>()
    }

    pub(crate) fn low_charge_level(&self) -> Energy {
        self.max_charge * self.low_charge_fraction
    }
}
