use crate::types::ConnectivityState;

pub const LED_FAST_BLINK_MS: u64 = 200;
pub const LED_SLOW_BLINK_MS: u64 = 900;
pub const LED_ACCESS_POINT_BLINK_MS: u64 = 100;

pub fn status_led_on(state: ConnectivityState, now_ms: u64) -> bool {
    let half_period = match state {
        ConnectivityState::BrokerSessionActive => return true,
        ConnectivityState::Disconnected | ConnectivityState::NetworkJoining => LED_FAST_BLINK_MS,
        ConnectivityState::NetworkJoined | ConnectivityState::BrokerConnecting => {
            LED_SLOW_BLINK_MS
        }
        ConnectivityState::ConfigAccessPointActive => LED_ACCESS_POINT_BLINK_MS,
    };
    (now_ms / half_period) % 2 == 0
}
