use uom::si::{electric_current::ampere, f64::*, power::watt, ratio::ratio};

use crate::element::{BusId, ConsumerId, VoltageRange};

/// A load drawing constant power from the bus it is connected to.
///
/// The host requests a utilization with
/// [`CircuitManager::set_consumer_load`](crate::CircuitManager::set_consumer_load);
/// the load that is actually honored during a tick may be lower when the
/// feeding sources cannot cover the circuit's demand.
pub struct Consumer {
    pub(crate) id: ConsumerId,
    pub(crate) operating_range: VoltageRange,
    pub(crate) location_id: u32,
    pub(crate) nominal_power: Power,
    pub(crate) requested_load: Ratio,
    pub(crate) effective_load: Ratio,
    pub(crate) switched_in: bool,
    pub(crate) parent: Option<BusId>,
    pub(crate) input_current: ElectricCurrent,
    pub(crate) current_power: Power,
    pub(crate) running: bool,
    pub(crate) last_effective_load: Ratio,
}

impl Consumer {
    /// A switched-in consumer never idles completely; below this load it
    /// still draws a trickle. Hard switching out is the only way to zero
    /// its draw.
    pub const STANDBY_LOAD: f64 = 0.001;

    pub(crate) fn new(
        id: ConsumerId,
        operating_range: VoltageRange,
        nominal_power: Power,
        location_id: u32,
    ) -> Self {
        let standby = Ratio::new::<ratio>(Self::STANDBY_LOAD);
        Self {
            id,
            operating_range,
            location_id,
            nominal_power,
            requested_load: standby,
            effective_load: standby,
            switched_in: true,
            parent: None,
            input_current: ElectricCurrent::new::<ampere>(0.),
            current_power: Power::new::<watt>(0.),
            running: false,
            last_effective_load: standby,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn operating_range(&self) -> VoltageRange {
        self.operating_range
    }

    pub fn location_id(&self) -> u32 {
        self.location_id
    }

    pub fn nominal_power(&self) -> Power {
        self.nominal_power
    }

    /// The load honored during the last tick, after any shedding.
    pub fn load(&self) -> Ratio {
        self.effective_load
    }

    /// The load the host asked for, clamped into `[STANDBY_LOAD, 1]`.
    pub fn requested_load(&self) -> Ratio {
        self.requested_load
    }

    pub fn input_current(&self) -> ElectricCurrent {
        self.input_current
    }

    /// Power drawn during the last tick.
    pub fn current_power(&self) -> Power {
        self.current_power
    }

    pub fn is_switched_in(&self) -> bool {
        self.switched_in
    }

    /// A consumer runs exactly when it is switched in and current flows
    /// into it.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn bus(&self) -> Option<BusId> {
        self.parent
    }

    pub(crate) fn set_requested_load(&mut self, load: Ratio) {
        let clamped = load
            .get::<ratio>()
            .max(Self::STANDBY_LOAD)
            .min(1.0);
        self.requested_load = Ratio::new::<ratio>(clamped);
    }

    /// Power this consumer draws at its current effective load. Power is
    /// the invariant side of the arithmetic; currents derive from it at
    /// the bus voltage.
    pub(crate) fn effective_watts(&self) -> f64 {
        if !self.switched_in {
            return 0.;
        }
        self.nominal_power.get::<watt>() * self.effective_load.get::<ratio>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::assert_about_eq;

    fn consumer() -> Consumer {
        Consumer::new(
            ConsumerId(0),
            VoltageRange::from_volts(15., 30.),
            Power::new::<watt>(100.),
            0,
        )
    }

    #[test]
    fn starts_switched_in_but_not_running() {
        let consumer = consumer();

        assert!(consumer.is_switched_in());
        assert!(!consumer.is_running());
        assert_eq!(
            consumer.input_current(),
            ElectricCurrent::new::<ampere>(0.)
        );
    }

    #[test]
    fn requested_load_is_clamped_to_the_standby_floor() {
        let mut consumer = consumer();
        consumer.set_requested_load(Ratio::new::<ratio>(0.));

        assert_about_eq!(
            consumer.requested_load().get::<ratio>(),
            Consumer::STANDBY_LOAD,
            1e-9
        );
    }

    #[test]
    fn requested_load_is_clamped_to_one() {
        let mut consumer = consumer();
        consumer.set_requested_load(Ratio::new::<ratio>(1.5));

        assert_about_eq!(consumer.requested_load().get::<ratio>(), 1., 1e-9);
    }

    #[test]
    fn effective_draw_scales_with_load() {
        let mut consumer = consumer();
        consumer.effective_load = Ratio::new::<ratio>(0.5);

        assert_about_eq!(consumer.effective_watts(), 50., 1e-9);
    }

    #[test]
    fn switched_out_consumer_draws_nothing() {
        let mut consumer = consumer();
        consumer.effective_load = Ratio::new::<ratio>(1.);
        consumer.switched_in = false;

        assert_about_eq!(consumer.effective_watts(), 0., 1e-9);
    }
}
