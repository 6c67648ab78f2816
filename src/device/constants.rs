use uuid::Uuid;

/**
 * The advertised name of the odometer device. Only advertisements with exactly this name are
 * connected to.
 */
pub const DEVICE_NAME: &str = "DDO";

/**
 * The label reported for the simulated device.
 */
pub const SIMULATED_DEVICE_LABEL: &str = "DUMMY_DEVICE";

/**
 * How long (milliseconds) to scan for the device before giving up.
 */
pub const SCAN_PERIOD: u64 = 3000;

/**
 * How often (milliseconds) the consumer asks the device for a new value.
 */
pub const POLL_DELAY: u64 = 1000;

/**
 * How long (milliseconds) the consumer waits before scanning again after losing the device.
 */
pub const CONNECT_DELAY: u64 = 1000;

/**
 * The UUID of the Bluetooth BLE service of the RFduino on the device.
 */
pub const RFDUINO_SERVICE: &str = "00002220-0000-1000-8000-00805f9b34fb";

/**
 * The UUID of the Bluetooth BLE remote GATT characteristic that carries the payload.
 */
pub const RFDUINO_RECEIVE_CHARACTERISTIC: &str = "00002221-0000-1000-8000-00805f9b34fb";

/**
 * Payload type tags, the first byte of every payload.
 */
pub const TAG_DISTANCE: u8 = b'D';
pub const TAG_MESSAGE: u8 = b'M';

pub fn make_rfduino_service_uuid() -> Uuid {
    Uuid::from_u128(0x00002220_0000_1000_8000_00805f9b34fb)
}

pub fn make_rfduino_receive_uuid() -> Uuid {
    Uuid::from_u128(0x00002221_0000_1000_8000_00805f9b34fb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_constants_match_their_string_form() {
        assert_eq!(make_rfduino_service_uuid(), Uuid::parse_str(RFDUINO_SERVICE).unwrap());
        assert_eq!(make_rfduino_receive_uuid(), Uuid::parse_str(RFDUINO_RECEIVE_CHARACTERISTIC).unwrap());
    }
}
