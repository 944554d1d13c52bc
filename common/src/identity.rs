#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    // Unpadded upper-case hex of the high and low 32-bit halves.
    pub fn from_hardware_id(hardware_id: u64) -> Self {
        let high = (hardware_id >> 32) as u32;
        let low = hardware_id as u32;
        Self(format!("ESP32-{high:X}{low:X}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn session_client_id(&self, nonce: u16) -> String {
        format!("{}-{nonce:x}", self.0)
    }

    pub fn access_point_ssid(&self) -> String {
        format!("IoT-Setup-{}", self.0)
    }
}

impl core::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_hardware_id_halves_without_padding() {
        let identity = DeviceIdentity::from_hardware_id(0x0000_A4CF_12F0_E1D8);

        assert_eq!(identity.as_str(), "ESP32-A4CF12F0E1D8");
        assert_eq!(identity.access_point_ssid(), "IoT-Setup-ESP32-A4CF12F0E1D8");
    }

    #[test]
    fn session_client_id_appends_lower_hex_nonce() {
        let identity = DeviceIdentity::from_hardware_id(0x1_0000_0002);

        assert_eq!(identity.as_str(), "ESP32-12");
        assert_eq!(identity.session_client_id(0xbeef), "ESP32-12-beef");
    }
}
