use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::Sem6000Error;

/// Four digit PIN protecting the plug
///
/// Each digit travels as one byte holding its numeric value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pin([u8; 4]);

impl Pin {
    /// Factory default PIN of every plug
    pub const DEFAULT: Self = Self([0, 0, 0, 0]);

    /// Create a PIN from four digit values
    ///
    /// Returns `None` if any value is larger than 9.
    #[must_use]
    pub fn new(digits: [u8; 4]) -> Option<Self> {
        digits.iter().all(|d| *d <= 9).then_some(Self(digits))
    }

    /// Digit values in transmission order
    #[must_use]
    pub const fn digits(&self) -> [u8; 4] {
        self.0
    }
}

impl FromStr for Pin {
    type Err = Sem6000Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Sem6000Error::InvalidParameters("PIN must consist of 4 digits".to_string());

        if s.len() != 4 {
            return Err(invalid());
        }

        let mut digits = [0u8; 4];
        for (slot, c) in digits.iter_mut().zip(s.chars()) {
            let value = c.to_digit(10).ok_or_else(invalid)?;
            *slot = u8::try_from(value).map_err(|_| invalid())?;
        }

        Ok(Self(digits))
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in self.0 {
            write!(f, "{d}")?;
        }
        Ok(())
    }
}

// PINs stay out of logs.
impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(****)")
    }
}

/// Set of weekdays encoded as a one-byte bitmask
///
/// Bit `w` set means weekday index `w` (0..=6) is part of the set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Weekdays(u8);

impl Weekdays {
    /// Number of weekday indices
    pub const COUNT: u8 = 7;

    /// Empty set
    pub const NONE: Self = Self(0);

    /// All seven weekdays
    pub const ALL: Self = Self(0x7F);

    /// Decode from the wire bitmask, ignoring the unused top bit
    #[must_use]
    pub const fn from_mask(mask: u8) -> Self {
        Self(mask & Self::ALL.0)
    }

    /// Build a set from weekday indices
    ///
    /// Returns `None` if any index is outside `0..=6`.
    pub fn from_indices<I>(indices: I) -> Option<Self>
    where
        I: IntoIterator<Item = u8>,
    {
        indices.into_iter().try_fold(Self::NONE, |set, w| {
            (w < Self::COUNT).then_some(Self(set.0 | 1 << w))
        })
    }

    /// Wire bitmask
    #[must_use]
    pub const fn mask(self) -> u8 {
        self.0
    }

    /// Whether weekday index `w` is part of the set
    #[must_use]
    pub const fn contains(self, w: u8) -> bool {
        w < Self::COUNT && self.0 & (1 << w) != 0
    }

    /// Whether the set is empty
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Weekday indices in ascending order
    pub fn indices(self) -> impl Iterator<Item = u8> {
        (0..Self::COUNT).filter(move |w| self.contains(*w))
    }
}

/// A stored timed power rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheduler {
    /// Rule is enabled
    pub is_active: bool,
    /// Rule turns the plug on (otherwise off)
    pub is_action_turn_on: bool,
    /// Weekdays the rule repeats on
    pub repeat_on_weekdays: Weekdays,
    /// Full year; the device only stores the last two digits
    pub year: u16,
    /// Month (1-12)
    pub month: u8,
    /// Day of month
    pub day: u8,
    /// Hour (0-23)
    pub hour: u8,
    /// Minute (0-59)
    pub minute: u8,
}

/// A scheduler together with the slot it occupies on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerEntry {
    /// Device slot id
    pub slot_id: u8,
    /// The stored rule
    pub scheduler: Scheduler,
}

/// Scheduler listing, either a single page or all pages aggregated
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedulerList {
    /// Total number of schedulers stored on the device
    pub number_of_schedulers: u8,
    /// Entries in page order
    pub entries: Vec<SchedulerEntry>,
}

/// Settings reported by the plug
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Reduced price period is enabled
    pub is_reduced_period: bool,
    /// Normal price in cent per kWh
    pub normal_price_in_cent: u8,
    /// Reduced period price in cent per kWh
    pub reduced_period_price_in_cent: u8,
    /// Start of the reduced period in minutes since midnight
    pub reduced_period_start_time_in_minutes: u16,
    /// End of the reduced period in minutes since midnight
    pub reduced_period_end_time_in_minutes: u16,
    /// Status LED is on
    pub is_led_active: bool,
    /// Overload cut-off in watt
    pub power_limit_in_watt: u16,
}

/// What a countdown timer does when it expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerAction {
    /// Cancel a running timer
    Reset,
    /// Turn the plug on
    TurnOn,
    /// Turn the plug off
    TurnOff,
}

impl TimerAction {
    /// Wire value of the action byte
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Reset => 0x00,
            Self::TurnOn => 0x01,
            Self::TurnOff => 0x02,
        }
    }
}

/// Countdown timer state reported by the plug
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerStatus {
    /// A timer is counting down
    pub is_timer_running: bool,
    /// The timer turns the plug on when it expires
    pub is_action_turn_on: bool,
    /// Two-digit target year
    pub target_year: u8,
    /// Target month
    pub target_month: u8,
    /// Target day
    pub target_day: u8,
    /// Target hour
    pub target_hour: u8,
    /// Target minute
    pub target_minute: u8,
    /// Target second
    pub target_second: u8,
    /// Timer length as originally set, in seconds
    pub original_timer_length_in_seconds: u32,
}

/// Random mode (presence simulation) configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomMode {
    /// Random mode is enabled
    pub is_active: bool,
    /// Weekdays random mode runs on
    pub active_on_weekdays: Weekdays,
    /// Window start hour
    pub start_hour: u8,
    /// Window start minute
    pub start_minute: u8,
    /// Window end hour
    pub end_hour: u8,
    /// Window end minute
    pub end_minute: u8,
}

impl RandomMode {
    /// Configuration that switches random mode off
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            is_active: false,
            active_on_weekdays: Weekdays::NONE,
            start_hour: 0,
            start_minute: 0,
            end_hour: 0,
            end_minute: 0,
        }
    }
}

/// Live measurement reported by the plug
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    /// Relay is closed
    pub is_power_active: bool,
    /// Active power in milliwatt
    pub power_in_milliwatt: u32,
    /// Voltage in volt
    pub voltage_in_volt: u8,
    /// Current in milliampere
    pub current_in_milliampere: u16,
    /// Grid frequency in hertz
    pub frequency_in_hertz: u8,
    /// Total consumption counter
    pub total_consumption_in_kilowatt_hour: u32,
}

/// Consumption per period in watt hours, index 0 being the most recent period
///
/// A `None` marks a period the device does not report, such as the one still
/// accumulating.
pub type ConsumptionSeries = Vec<Option<u32>>;

/// Period granularity of a consumption request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsumptionPeriod {
    /// Monthly values for the last 12 months
    Last12Months,
    /// Daily values for the last 30 days
    Last30Days,
    /// Hourly values for the last 23 hours
    Last23Hours,
}

impl fmt::Display for ConsumptionPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Last12Months => write!(f, "last 12 months"),
            Self::Last30Days => write!(f, "last 30 days"),
            Self::Last23Hours => write!(f, "last 23 hours"),
        }
    }
}

/// Session life cycle of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No link
    Disconnected,
    /// Link is being established
    Connecting,
    /// Link is up, no PIN accepted yet
    Connected,
    /// Link is up and the PIN was accepted
    Authorized,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Authorized => write!(f, "Authorized"),
        }
    }
}

/// Bluetooth address type of the plug
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AddressType {
    /// Public device address
    #[default]
    Public,
    /// Random device address
    Random,
}

/// Device found during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Bluetooth address, `AA:BB:CC:DD:EE:FF`
    pub address: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
}

/// Connection parameters, remembered by the engine for reconnects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Bluetooth address of the plug
    pub address: String,
    /// Address type of the plug
    pub address_type: AddressType,
    /// Adapter to use, e.g. `hci0`; the first adapter when `None`
    pub interface: Option<String>,
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
    /// How long to scan for the plug before connecting, in milliseconds
    pub scan_timeout_ms: u64,
}

impl ConnectionParams {
    /// Parameters for the given address with default timeouts
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            address: String::new(),
            address_type: AddressType::Public,
            interface: None,
            timeout_ms: 10_000,
            scan_timeout_ms: 5_000,
        }
    }
}

/// Reply wait configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Longest silence between two fragments of a reply, in milliseconds
    pub reply_timeout_ms: u64,
    /// Upper bound for a whole reply, however busy the fragment stream is
    pub reply_deadline_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 3_000,
            reply_deadline_ms: 10_000,
        }
    }
}

/// First year of the current century according to the local clock
#[must_use]
pub fn current_century() -> u16 {
    let year = u16::try_from(Local::now().year()).unwrap_or(2000);
    year - year % 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_parsing() {
        let pin: Pin = "1234".parse().unwrap();
        assert_eq!(pin.digits(), [1, 2, 3, 4]);
        assert_eq!(pin.to_string(), "1234");
        assert_eq!(format!("{pin:?}"), "Pin(****)");

        assert!("123".parse::<Pin>().is_err());
        assert!("12345".parse::<Pin>().is_err());
        assert!("12a4".parse::<Pin>().is_err());
        assert!(Pin::new([1, 2, 3, 10]).is_none());
        assert_eq!(Pin::new([0, 0, 0, 0]), Some(Pin::DEFAULT));
    }

    #[test]
    fn test_weekdays_round_trip_all_subsets() {
        for mask in 0u8..128 {
            let indices: Vec<u8> = (0..7).filter(|w| mask & (1 << w) != 0).collect();
            let set = Weekdays::from_indices(indices.iter().copied()).unwrap();
            assert_eq!(set.mask(), mask);

            let decoded = Weekdays::from_mask(set.mask());
            assert_eq!(decoded.indices().collect::<Vec<_>>(), indices);
        }
    }

    #[test]
    fn test_weekdays_rejects_out_of_range() {
        assert!(Weekdays::from_indices([0, 7]).is_none());
        assert!(!Weekdays::ALL.contains(7));
        assert_eq!(Weekdays::from_mask(0xFF), Weekdays::ALL);
    }

    #[test]
    fn test_timer_action_bytes() {
        assert_eq!(TimerAction::Reset.to_byte(), 0x00);
        assert_eq!(TimerAction::TurnOn.to_byte(), 0x01);
        assert_eq!(TimerAction::TurnOff.to_byte(), 0x02);
    }

    #[test]
    fn test_connection_params_default() {
        let params = ConnectionParams::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(params.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(params.address_type, AddressType::Public);
        assert!(params.interface.is_none());
        assert_eq!(params.timeout_ms, 10_000);
        assert_eq!(params.scan_timeout_ms, 5_000);
    }

    #[test]
    fn test_timeout_config_defaults() {
        let config = TimeoutConfig::default();
        assert_eq!(config.reply_timeout_ms, 3_000);
        assert_eq!(config.reply_deadline_ms, 10_000);
    }

    #[test]
    fn test_current_century() {
        let century = current_century();
        assert_eq!(century % 100, 0);
        assert!(century >= 2000);
    }
}
