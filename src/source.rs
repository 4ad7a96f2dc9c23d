use uom::si::{
    electric_current::ampere, electric_potential::volt, f64::*, power::watt,
};

use crate::element::{BusId, SourceId, VoltageRange};

/// A constant-power current origin. Its output voltage is dictated by the
/// bus it feeds; at voltage `v` it can deliver up to `max_power / v`
/// amperes.
pub struct Source {
    pub(crate) id: SourceId,
    pub(crate) operating_range: VoltageRange,
    pub(crate) location_id: u32,
    pub(crate) max_power: Power,
    pub(crate) internal_resistance: ElectricalResistance,
    pub(crate) switched_in: bool,
    pub(crate) child: Option<BusId>,
    pub(crate) output_current: ElectricCurrent,
    pub(crate) output_voltage: ElectricPotential,
    pub(crate) pending_delivery: f64,
}

impl Source {
    pub(crate) fn new(
        id: SourceId,
        operating_range: VoltageRange,
        max_power: Power,
        internal_resistance: ElectricalResistance,
        location_id: u32,
    ) -> Self {
        Self {
            id,
            operating_range,
            location_id,
            max_power,
            internal_resistance,
            switched_in: true,
            child: None,
            output_current: ElectricCurrent::new::<ampere>(0.),
            output_voltage: ElectricPotential::new::<volt>(0.),
            pending_delivery: 0.,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn operating_range(&self) -> VoltageRange {
        self.operating_range
    }

    pub fn location_id(&self) -> u32 {
        self.location_id
    }

    pub fn max_power(&self) -> Power {
        self.max_power
    }

    pub fn internal_resistance(&self) -> ElectricalResistance {
        self.internal_resistance
    }

    pub fn is_switched_in(&self) -> bool {
        self.switched_in
    }

    pub fn bus(&self) -> Option<BusId> {
        self.child
    }

    pub fn output_current(&self) -> ElectricCurrent {
        self.output_current
    }

    /// The voltage of the fed bus, zero while unconnected.
    pub fn output_voltage(&self) -> ElectricPotential {
        self.output_voltage
    }

    pub fn output_power(&self) -> Power {
        self.output_current * self.output_voltage
    }

    /// The most current this source can deliver at the voltage of its
    /// bus; zero while unconnected.
    pub fn max_output_current(&self) -> ElectricCurrent {
        if self.output_voltage > ElectricPotential::new::<volt>(0.) {
            self.max_power / self.output_voltage
        } else {
            ElectricCurrent::new::<ampere>(0.)
        }
    }

    pub(crate) fn capacity_watts(&self) -> f64 {
        self.max_power.get::<watt>()
    }
}
