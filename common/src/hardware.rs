pub trait Actuators {
    fn set_relay(&mut self, on: bool);
    fn set_buzzer(&mut self, on: bool);
    // Blocks the tick loop; only used for the clamped buzzer pulse.
    fn delay_ms(&mut self, ms: u64);
}

pub trait NodeHardware: Actuators {
    fn motion_active(&mut self) -> bool;
    fn config_button_pressed(&mut self) -> bool;
    fn set_status_led(&mut self, on: bool);
    fn restart(&mut self);
}
