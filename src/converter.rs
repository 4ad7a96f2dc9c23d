use uom::si::{electric_current::ampere, f64::*, power::watt, ratio::ratio};

use crate::element::{BusId, ConverterId, VoltageRange};

/// A bridge between two circuits at different voltages. The input face
/// draws from the upstream bus like a consumer; the output face feeds the
/// downstream bus like a source. Energy balance:
/// `output_power = input_power * conversion_efficiency`.
///
/// A converter never merges the circuits it connects.
pub struct Converter {
    pub(crate) id: ConverterId,
    pub(crate) operating_range: VoltageRange,
    pub(crate) max_power: Power,
    pub(crate) conversion_efficiency: Ratio,
    pub(crate) internal_resistance: ElectricalResistance,
    pub(crate) parent: Option<BusId>,
    pub(crate) child: Option<BusId>,
    pub(crate) child_switched_in: bool,
    pub(crate) parent_switched_in: bool,
    pub(crate) input_current: ElectricCurrent,
    pub(crate) output_current: ElectricCurrent,
    pub(crate) input_power: Power,
    pub(crate) output_power: Power,
    // Per-tick negotiation with the upstream circuit, in watts.
    pub(crate) requested_output_watts: Option<f64>,
    pub(crate) granted_input_watts: f64,
}

impl Converter {
    pub(crate) fn new(
        id: ConverterId,
        operating_range: VoltageRange,
        max_power: Power,
        conversion_efficiency: Ratio,
        internal_resistance: ElectricalResistance,
    ) -> Self {
        Self {
            id,
            operating_range,
            max_power,
            conversion_efficiency,
            internal_resistance,
            parent: None,
            child: None,
            child_switched_in: true,
            parent_switched_in: true,
            input_current: ElectricCurrent::new::<ampere>(0.),
            output_current: ElectricCurrent::new::<ampere>(0.),
            input_power: Power::new::<watt>(0.),
            output_power: Power::new::<watt>(0.),
            requested_output_watts: None,
            granted_input_watts: 0.,
        }
    }

    pub fn id(&self) -> ConverterId {
        self.id
    }

    pub fn operating_range(&self) -> VoltageRange {
        self.operating_range
    }

    /// Output-side power cap.
    pub fn max_power(&self) -> Power {
        self.max_power
    }

    pub fn conversion_efficiency(&self) -> Ratio {
        self.conversion_efficiency
    }

    pub fn internal_resistance(&self) -> ElectricalResistance {
        self.internal_resistance
    }

    /// The upstream bus the input face draws from.
    pub fn input_bus(&self) -> Option<BusId> {
        self.parent
    }

    /// The downstream bus the output face feeds.
    pub fn output_bus(&self) -> Option<BusId> {
        self.child
    }

    pub fn is_child_switched_in(&self) -> bool {
        self.child_switched_in
    }

    pub fn is_parent_switched_in(&self) -> bool {
        self.parent_switched_in
    }

    pub fn input_current(&self) -> ElectricCurrent {
        self.input_current
    }

    pub fn output_current(&self) -> ElectricCurrent {
        self.output_current
    }

    pub fn input_power(&self) -> Power {
        self.input_power
    }

    pub fn output_power(&self) -> Power {
        self.output_power
    }

    pub(crate) fn efficiency(&self) -> f64 {
        self.conversion_efficiency.get::<ratio>()
    }

    /// True when both faces are connected and switched in, i.e. the
    /// converter can move power at all this tick.
    pub(crate) fn is_bridging(&self) -> bool {
        self.parent.is_some()
            && self.child.is_some()
            && self.child_switched_in
            && self.parent_switched_in
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CircuitManager, ConnectError, ConsumerId, SourceId, VoltageRange};
    use ntest::assert_about_eq;
    use std::time::Duration;
    use uom::si::{electric_potential::volt, electrical_resistance::ohm};

    struct ConverterTestGrid {
        grid: CircuitManager,
        source: SourceId,
        converter: ConverterId,
        high_consumers: Vec<ConsumerId>,
        low_consumers: Vec<ConsumerId>,
        high_bus: BusId,
        low_bus: BusId,
    }

    /// The two-circuit layout of the balanced/overloaded converter
    /// scenarios: a 1000 W source on a 120 V bus feeding two 60 W
    /// consumers and an 800 W consumer, bridged by a 90 % efficient
    /// converter into a 26 V bus with two 60 W consumers.
    fn converter_grid() -> ConverterTestGrid {
        let mut grid = CircuitManager::new();
        let high_bus = grid.add_bus(
            ElectricPotential::new::<volt>(120.),
            ElectricCurrent::new::<ampere>(1000.),
        );
        let source = grid.add_source(
            VoltageRange::from_volts(110., 130.),
            Power::new::<watt>(1000.),
            ElectricalResistance::new::<ohm>(1.),
            0,
        );
        grid.connect_source_to_bus(source, high_bus).unwrap();

        let big = grid.add_consumer(
            VoltageRange::from_volts(100., 130.),
            Power::new::<watt>(800.),
            0,
        );
        let high_a = grid.add_consumer(
            VoltageRange::from_volts(100., 130.),
            Power::new::<watt>(60.),
            0,
        );
        let high_b = grid.add_consumer(
            VoltageRange::from_volts(100., 130.),
            Power::new::<watt>(60.),
            0,
        );
        grid.connect_consumer_to_bus(big, high_bus).unwrap();
        grid.connect_consumer_to_bus(high_a, high_bus).unwrap();
        grid.connect_consumer_to_bus(high_b, high_bus).unwrap();

        let low_bus = grid.add_bus(
            ElectricPotential::new::<volt>(26.),
            ElectricCurrent::new::<ampere>(1000.),
        );
        let low_a = grid.add_consumer(
            VoltageRange::from_volts(15., 30.),
            Power::new::<watt>(60.),
            0,
        );
        let low_b = grid.add_consumer(
            VoltageRange::from_volts(15., 30.),
            Power::new::<watt>(60.),
            0,
        );
        grid.connect_consumer_to_bus(low_a, low_bus).unwrap();
        grid.connect_consumer_to_bus(low_b, low_bus).unwrap();

        let converter = grid.add_converter(
            VoltageRange::from_volts(20., 130.),
            Power::new::<watt>(1000.),
            Ratio::new::<ratio>(0.9),
            ElectricalResistance::new::<ohm>(1.),
        );
        grid.connect_bus_to_converter(high_bus, converter).unwrap();
        grid.connect_converter_to_bus(converter, low_bus).unwrap();

        ConverterTestGrid {
            grid,
            source,
            converter,
            high_consumers: vec![big, high_a, high_b],
            low_consumers: vec![low_a, low_b],
            high_bus,
            low_bus,
        }
    }

    fn full_load(grid: &mut CircuitManager, consumers: &[ConsumerId]) {
        for &consumer in consumers {
            grid.set_consumer_load(consumer, Ratio::new::<ratio>(1.));
        }
    }

    #[test]
    fn bridged_buses_remain_separate_circuits() {
        let t = converter_grid();

        assert_eq!(t.grid.size(), 2);
        let high = t.grid.circuit_containing(t.high_bus).unwrap();
        let low = t.grid.circuit_containing(t.low_bus).unwrap();
        assert_about_eq!(high.voltage().get::<volt>(), 120., 1e-9);
        assert_about_eq!(low.voltage().get::<volt>(), 26., 1e-9);
    }

    #[test]
    fn balanced_bridge_carries_the_downstream_demand() {
        let mut t = converter_grid();
        full_load(&mut t.grid, &t.high_consumers[1..]);
        full_load(&mut t.grid, &t.low_consumers);

        t.grid.evaluate(Duration::from_millis(1));

        // 60 + 60 W upstream, 0.8 W standby on the big consumer, plus
        // 120 W / 0.9 through the converter.
        assert_about_eq!(
            t.grid.source(t.source).output_power().get::<watt>(),
            254.13333333333333,
            1e-9
        );
        let converter = t.grid.converter(t.converter);
        assert_about_eq!(
            converter.input_current().get::<ampere>(),
            1.1111111111111112,
            1e-9
        );
        assert_about_eq!(
            converter.output_current().get::<ampere>(),
            4.615384615384615,
            1e-9
        );
        for &consumer in &t.low_consumers {
            assert_about_eq!(
                t.grid.consumer(consumer).load().get::<ratio>(),
                1.,
                1e-9
            );
        }
    }

    #[test]
    fn converter_preserves_energy_balance() {
        let mut t = converter_grid();
        full_load(&mut t.grid, &t.high_consumers[1..]);
        full_load(&mut t.grid, &t.low_consumers);

        t.grid.evaluate(Duration::from_millis(1));

        let converter = t.grid.converter(t.converter);
        assert_about_eq!(
            converter.output_power().get::<watt>(),
            converter.input_power().get::<watt>() * 0.9,
            1e-9
        );
    }

    #[test]
    fn overloaded_bridge_sheds_downstream_consumers() {
        let mut t = converter_grid();
        full_load(&mut t.grid, &t.high_consumers);
        full_load(&mut t.grid, &t.low_consumers);

        t.grid.evaluate(Duration::from_millis(1));

        // The source caps at 1000 W; the converter, connected last, sheds
        // first, and passes the reduction to the far end of the low bus.
        assert_about_eq!(
            t.grid.source(t.source).output_power().get::<watt>(),
            1000.,
            1e-9
        );
        assert_about_eq!(
            t.grid
                .consumer(t.low_consumers[0])
                .load()
                .get::<ratio>(),
            1.,
            1e-9
        );
        assert_about_eq!(
            t.grid
                .consumer(t.low_consumers[1])
                .load()
                .get::<ratio>(),
            0.2,
            1e-9
        );
        for &consumer in &t.high_consumers {
            assert_about_eq!(
                t.grid.consumer(consumer).load().get::<ratio>(),
                1.,
                1e-9
            );
        }

        let high = t.grid.circuit_containing(t.high_bus).unwrap();
        let low = t.grid.circuit_containing(t.low_bus).unwrap();
        assert_about_eq!(high.current().get::<ampere>(), 8.333333333333334, 1e-9);
        assert_about_eq!(low.current().get::<ampere>(), 2.769230769230769, 1e-9);
    }

    #[test]
    fn shedding_is_stable_across_ticks() {
        let mut t = converter_grid();
        full_load(&mut t.grid, &t.high_consumers);
        full_load(&mut t.grid, &t.low_consumers);

        t.grid.evaluate(Duration::from_millis(1));
        t.grid.evaluate(Duration::from_millis(1));
        t.grid.evaluate(Duration::from_millis(1));

        assert_about_eq!(
            t.grid
                .consumer(t.low_consumers[1])
                .load()
                .get::<ratio>(),
            0.2,
            1e-9
        );
        assert_about_eq!(
            t.grid.source(t.source).output_power().get::<watt>(),
            1000.,
            1e-9
        );
    }

    #[test]
    fn fanned_out_converters_shed_from_the_last_connected() {
        // One 400 W source at 100 V feeding five 10 V circuits, each a
        // 100 W consumer behind its own 90 % converter. Total demand is
        // 5 * 111.1 W; the last two converters take the shortfall.
        let mut grid = CircuitManager::new();
        let feeder = grid.add_bus(
            ElectricPotential::new::<volt>(100.),
            ElectricCurrent::new::<ampere>(1000.),
        );
        let source = grid.add_source(
            VoltageRange::from_volts(90., 130.),
            Power::new::<watt>(400.),
            ElectricalResistance::new::<ohm>(1.),
            0,
        );
        grid.connect_source_to_bus(source, feeder).unwrap();

        let mut consumers = Vec::new();
        for _ in 0..5 {
            let converter = grid.add_converter(
                VoltageRange::from_volts(8., 130.),
                Power::new::<watt>(1000.),
                Ratio::new::<ratio>(0.9),
                ElectricalResistance::new::<ohm>(1.),
            );
            let bus = grid.add_bus(
                ElectricPotential::new::<volt>(10.),
                ElectricCurrent::new::<ampere>(1000.),
            );
            let consumer = grid.add_consumer(
                VoltageRange::from_volts(8., 12.),
                Power::new::<watt>(100.),
                0,
            );
            grid.connect_bus_to_converter(feeder, converter).unwrap();
            grid.connect_converter_to_bus(converter, bus).unwrap();
            grid.connect_consumer_to_bus(consumer, bus).unwrap();
            grid.set_consumer_load(consumer, Ratio::new::<ratio>(1.));
            consumers.push(consumer);
        }

        grid.evaluate(Duration::from_millis(1));

        assert_about_eq!(
            grid.source(source).output_power().get::<watt>(),
            400.,
            1e-9
        );
        assert_about_eq!(
            grid.bus(feeder).through_current().get::<ampere>(),
            4.,
            1e-9
        );
        for &consumer in &consumers[..3] {
            assert_about_eq!(grid.consumer(consumer).load().get::<ratio>(), 1., 1e-9);
            assert!(grid.consumer(consumer).is_running());
        }
        assert_about_eq!(grid.consumer(consumers[3]).load().get::<ratio>(), 0.6, 1e-9);
        assert!(grid.consumer(consumers[3]).is_running());
        assert!(!grid.consumer(consumers[4]).is_switched_in());
        assert!(!grid.consumer(consumers[4]).is_running());
    }

    #[test]
    fn feed_cycles_between_circuits_are_rejected() {
        let mut grid = CircuitManager::new();
        let bus_a = grid.add_bus(
            ElectricPotential::new::<volt>(26.),
            ElectricCurrent::new::<ampere>(1000.),
        );
        let bus_b = grid.add_bus(
            ElectricPotential::new::<volt>(120.),
            ElectricCurrent::new::<ampere>(1000.),
        );
        let forward = grid.add_converter(
            VoltageRange::from_volts(20., 130.),
            Power::new::<watt>(1000.),
            Ratio::new::<ratio>(0.9),
            ElectricalResistance::new::<ohm>(1.),
        );
        let backward = grid.add_converter(
            VoltageRange::from_volts(20., 130.),
            Power::new::<watt>(1000.),
            Ratio::new::<ratio>(0.9),
            ElectricalResistance::new::<ohm>(1.),
        );
        grid.connect_bus_to_converter(bus_a, forward).unwrap();
        grid.connect_converter_to_bus(forward, bus_b).unwrap();
        grid.connect_bus_to_converter(bus_b, backward).unwrap();

        assert_eq!(
            grid.connect_converter_to_bus(backward, bus_a),
            Err(ConnectError::WouldCycle)
        );
    }
}
