use uom::si::{
    electric_current::ampere, electric_potential::volt, electrical_resistance::ohm, f64::*,
};

use crate::element::{BusId, ChildRef, ParentRef};

/// A voltage-defining aggregation node. Every element attached to a bus
/// operates at the bus voltage; bus-to-bus edges carry current between
/// aggregation points of the same circuit.
///
/// Buses are passive conductors: they cannot be switched, and registering
/// switch events for them is a programming error.
pub struct Bus {
    pub(crate) id: BusId,
    pub(crate) voltage: ElectricPotential,
    pub(crate) max_current: ElectricCurrent,
    /// Connection order; shedding walks this list from the back.
    pub(crate) children: Vec<ChildRef>,
    pub(crate) parents: Vec<ParentRef>,
    pub(crate) equivalent_resistance: ElectricalResistance,
    pub(crate) throughcurrent: ElectricCurrent,
    pub(crate) feeding_subcircuits: Vec<usize>,
    pub(crate) over_max: bool,
}

impl Bus {
    pub(crate) fn new(id: BusId, voltage: ElectricPotential, max_current: ElectricCurrent) -> Self {
        assert!(
            voltage > ElectricPotential::new::<volt>(0.),
            "a bus must operate above zero volts"
        );
        Self {
            id,
            voltage,
            max_current,
            children: Vec::new(),
            parents: Vec::new(),
            equivalent_resistance: ElectricalResistance::new::<ohm>(f64::INFINITY),
            throughcurrent: ElectricCurrent::new::<ampere>(0.),
            feeding_subcircuits: Vec::new(),
            over_max: false,
        }
    }

    pub fn id(&self) -> BusId {
        self.id
    }

    pub fn voltage(&self) -> ElectricPotential {
        self.voltage
    }

    /// The current this bus is designed to tolerate. Crossing it raises
    /// `on_max_current_high`; falling back below raises
    /// `on_max_current_ok`.
    pub fn max_current(&self) -> ElectricCurrent {
        self.max_current
    }

    /// Total current flowing through this bus after the last tick.
    pub fn through_current(&self) -> ElectricCurrent {
        self.throughcurrent
    }

    /// Parallel combination of everything this bus feeds, at the loads of
    /// the last tick: switched-in consumers, charging batteries, converter
    /// input faces and downstream buses, recursively. Infinite while
    /// nothing draws.
    pub fn equivalent_resistance(&self) -> ElectricalResistance {
        self.equivalent_resistance
    }

    /// Attached children in connection order.
    pub fn children(&self) -> &[ChildRef] {
        &self.children
    }

    /// Attached parents in connection order.
    pub fn parents(&self) -> &[ParentRef] {
        &self.parents
    }

    /// Indices into the owning circuit's subcircuit list, one for every
    /// feed whose downstream tree contains this bus.
    pub fn feeding_subcircuits(&self) -> &[usize] {
        &self.feeding_subcircuits
    }

    /// Neighbor buses on either side of this one.
    pub(crate) fn neighbor_buses(&self) -> impl Iterator<Item = BusId> + '_ {
        let down = self.children.iter().filter_map(|child| match child {
            ChildRef::Bus(bus) => Some(*bus),
            _ => None,
        });
        let up = self.parents.iter().filter_map(|parent| match parent {
            ParentRef::Bus(bus) => Some(*bus),
            _ => None,
        });
        down.chain(up)
    }

    pub(crate) fn volts(&self) -> f64 {
        self.voltage.get::<volt>()
    }
}
