//! Inbound notifications and the table that decodes them.
//!
//! A payload is matched against [`ROUTES`] by its opcode prefix; the most
//! specific matching route wins. Each route validates the payload length
//! before its decoder extracts fields. Multi-byte integers are big-endian and
//! boolean fields are compared against an exact byte: success flags mean
//! success on `0x00`, state flags mean active on `0x01`.

use bytes::Buf;
use std::{fmt, iter};
use tracing::warn;

use crate::{
    error::{DecodeError, PayloadError},
    frame,
    types::{
        current_century, ConsumptionSeries, Measurement, RandomMode, Scheduler, SchedulerEntry,
        SchedulerList, Settings, TimerStatus, Weekdays,
    },
};

/// Size of one entry in a scheduler page
pub const SCHEDULER_ENTRY_SIZE: usize = 12;

/// Decoded reply or status message from the plug
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Reply to [`crate::Command::Authorize`]
    Authorization {
        /// PIN accepted
        was_successful: bool,
    },
    /// Reply to [`crate::Command::ChangePin`]
    ChangePin {
        /// PIN changed
        was_successful: bool,
    },
    /// Reply to [`crate::Command::ResetPin`]
    ResetPin {
        /// PIN reset
        was_successful: bool,
    },
    /// Reply to [`crate::Command::PowerSwitch`]
    PowerSwitch {
        /// Relay switched
        was_successful: bool,
    },
    /// Reply to [`crate::Command::LedSwitch`]
    LedSwitch {
        /// LED switched
        was_successful: bool,
    },
    /// Reply to [`crate::Command::SyncDateTime`]
    SynchronizeDateAndTime {
        /// Clock set
        was_successful: bool,
    },
    /// Reply to [`crate::Command::RequestSettings`]
    RequestedSettings(Settings),
    /// Reply to [`crate::Command::SetPowerLimit`]
    PowerLimitSet {
        /// Limit stored
        was_successful: bool,
    },
    /// Reply to [`crate::Command::SetPrices`]
    PricesSet {
        /// Prices stored
        was_successful: bool,
    },
    /// Reply to [`crate::Command::SetReducedPeriod`]
    ReducedPeriodSet {
        /// Period stored
        was_successful: bool,
    },
    /// Reply to [`crate::Command::RequestTimerStatus`]
    RequestedTimerStatus(TimerStatus),
    /// Reply to [`crate::Command::SetTimer`]
    TimerSet {
        /// Timer stored
        was_successful: bool,
    },
    /// Reply to [`crate::Command::RequestScheduler`], one page
    SchedulerRequested(SchedulerList),
    /// Reply to adding, editing or removing a scheduler
    SchedulerSet {
        /// Table updated
        was_successful: bool,
    },
    /// Reply to [`crate::Command::RequestRandomModeStatus`]
    RandomModeStatusRequested(RandomMode),
    /// Reply to [`crate::Command::SetRandomMode`]
    RandomModeSet {
        /// Random mode stored
        was_successful: bool,
    },
    /// Reply to [`crate::Command::RequestMeasurement`]
    MeasurementRequested(Measurement),
    /// Monthly consumption, index 0 is the current month
    ConsumptionOfLast12Months(ConsumptionSeries),
    /// Daily consumption, index 0 is today
    ConsumptionOfLast30Days(ConsumptionSeries),
    /// Hourly consumption, index 0 is the last complete hour
    ConsumptionOfLast23Hours(ConsumptionSeries),
    /// Reply to [`crate::Command::ResetConsumption`]
    ResetConsumption {
        /// History cleared
        was_successful: bool,
    },
    /// Reply to [`crate::Command::FactoryReset`]
    FactoryReset {
        /// Plug reset
        was_successful: bool,
    },
    /// Reply to [`crate::Command::SetDeviceName`]
    DeviceNameSet {
        /// Name stored
        was_successful: bool,
    },
    /// Reply to [`crate::Command::RequestDeviceSerial`]
    DeviceSerialRequested {
        /// Serial number text
        serial: String,
    },
}

/// Payload-free identification of a [`Notification`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum NotificationKind {
    Authorization,
    ChangePin,
    ResetPin,
    PowerSwitch,
    LedSwitch,
    SynchronizeDateAndTime,
    RequestedSettings,
    PowerLimitSet,
    PricesSet,
    ReducedPeriodSet,
    RequestedTimerStatus,
    TimerSet,
    SchedulerRequested,
    SchedulerSet,
    RandomModeStatusRequested,
    RandomModeSet,
    MeasurementRequested,
    ConsumptionOfLast12Months,
    ConsumptionOfLast30Days,
    ConsumptionOfLast23Hours,
    ResetConsumption,
    FactoryReset,
    DeviceNameSet,
    DeviceSerialRequested,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}Notification")
    }
}

impl Notification {
    /// Kind of this notification
    #[must_use]
    pub const fn kind(&self) -> NotificationKind {
        match self {
            Self::Authorization { .. } => NotificationKind::Authorization,
            Self::ChangePin { .. } => NotificationKind::ChangePin,
            Self::ResetPin { .. } => NotificationKind::ResetPin,
            Self::PowerSwitch { .. } => NotificationKind::PowerSwitch,
            Self::LedSwitch { .. } => NotificationKind::LedSwitch,
            Self::SynchronizeDateAndTime { .. } => NotificationKind::SynchronizeDateAndTime,
            Self::RequestedSettings(_) => NotificationKind::RequestedSettings,
            Self::PowerLimitSet { .. } => NotificationKind::PowerLimitSet,
            Self::PricesSet { .. } => NotificationKind::PricesSet,
            Self::ReducedPeriodSet { .. } => NotificationKind::ReducedPeriodSet,
            Self::RequestedTimerStatus(_) => NotificationKind::RequestedTimerStatus,
            Self::TimerSet { .. } => NotificationKind::TimerSet,
            Self::SchedulerRequested(_) => NotificationKind::SchedulerRequested,
            Self::SchedulerSet { .. } => NotificationKind::SchedulerSet,
            Self::RandomModeStatusRequested(_) => NotificationKind::RandomModeStatusRequested,
            Self::RandomModeSet { .. } => NotificationKind::RandomModeSet,
            Self::MeasurementRequested(_) => NotificationKind::MeasurementRequested,
            Self::ConsumptionOfLast12Months(_) => NotificationKind::ConsumptionOfLast12Months,
            Self::ConsumptionOfLast30Days(_) => NotificationKind::ConsumptionOfLast30Days,
            Self::ConsumptionOfLast23Hours(_) => NotificationKind::ConsumptionOfLast23Hours,
            Self::ResetConsumption { .. } => NotificationKind::ResetConsumption,
            Self::FactoryReset { .. } => NotificationKind::FactoryReset,
            Self::DeviceNameSet { .. } => NotificationKind::DeviceNameSet,
            Self::DeviceSerialRequested { .. } => NotificationKind::DeviceSerialRequested,
        }
    }

    /// Success flag carried by acknowledgement notifications, `None` for data replies
    #[must_use]
    pub const fn was_successful(&self) -> Option<bool> {
        match self {
            Self::Authorization { was_successful }
            | Self::ChangePin { was_successful }
            | Self::ResetPin { was_successful }
            | Self::PowerSwitch { was_successful }
            | Self::LedSwitch { was_successful }
            | Self::SynchronizeDateAndTime { was_successful }
            | Self::PowerLimitSet { was_successful }
            | Self::PricesSet { was_successful }
            | Self::ReducedPeriodSet { was_successful }
            | Self::TimerSet { was_successful }
            | Self::SchedulerSet { was_successful }
            | Self::RandomModeSet { was_successful }
            | Self::ResetConsumption { was_successful }
            | Self::FactoryReset { was_successful }
            | Self::DeviceNameSet { was_successful } => Some(*was_successful),
            Self::RequestedSettings(_)
            | Self::RequestedTimerStatus(_)
            | Self::SchedulerRequested(_)
            | Self::RandomModeStatusRequested(_)
            | Self::MeasurementRequested(_)
            | Self::ConsumptionOfLast12Months(_)
            | Self::ConsumptionOfLast30Days(_)
            | Self::ConsumptionOfLast23Hours(_)
            | Self::DeviceSerialRequested { .. } => None,
        }
    }

    /// Decode a payload, reconstructing two-digit years in the current century
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::UnsupportedMessage`] for an unknown opcode prefix,
    /// [`PayloadError::InvalidPayloadLength`] if the length does not fit the layout.
    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        Self::decode_in_century(payload, current_century())
    }

    /// Decode a payload, reconstructing two-digit years in the given century
    ///
    /// # Errors
    ///
    /// See [`Notification::decode`].
    pub fn decode_in_century(payload: &[u8], century: u16) -> Result<Self, PayloadError> {
        let route = route_for(payload).ok_or_else(|| PayloadError::UnsupportedMessage {
            prefix: payload.iter().take(3).copied().collect(),
        })?;

        route.length.check(route.kind, payload.len())?;
        (route.decode)(payload, &DecodeContext { century })
    }

    /// Unwrap a complete frame and decode its payload
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Frame`] for an invalid envelope and
    /// [`DecodeError::Payload`] for an invalid payload.
    pub fn from_frame(raw: &[u8]) -> Result<Self, DecodeError> {
        let payload = frame::unwrap(raw)?;
        Ok(Self::decode(payload)?)
    }
}

/// Context shared by all decoders of one decode call
struct DecodeContext {
    century: u16,
}

type Decoder = fn(&[u8], &DecodeContext) -> Result<Notification, PayloadError>;

/// Opcode prefix, optionally narrowed by one selector byte after the prefix
#[derive(Debug, Clone, Copy)]
struct Opcode {
    prefix: &'static [u8],
    selector: Option<(usize, u8)>,
}

impl Opcode {
    const fn prefix(prefix: &'static [u8]) -> Self {
        Self {
            prefix,
            selector: None,
        }
    }

    const fn selected(prefix: &'static [u8], index: usize, value: u8) -> Self {
        Self {
            prefix,
            selector: Some((index, value)),
        }
    }

    fn matches(&self, payload: &[u8]) -> bool {
        payload.starts_with(self.prefix)
            && self
                .selector
                .is_none_or(|(index, value)| payload.get(index) == Some(&value))
    }

    fn specificity(&self) -> usize {
        self.prefix.len() + usize::from(self.selector.is_some())
    }
}

/// Length a payload must have for its layout
#[derive(Debug, Clone, Copy)]
enum LengthRule {
    Exact(usize),
    AtLeast(usize),
    /// A fixed header followed by whole entries of a fixed size
    Entries { header: usize, entry: usize },
}

impl LengthRule {
    fn check(self, kind: NotificationKind, actual: usize) -> Result<(), PayloadError> {
        let expected = match self {
            Self::Exact(len) => (actual != len).then_some(len),
            Self::AtLeast(len) => (actual < len).then_some(len),
            Self::Entries { header, entry } => {
                if actual < header {
                    Some(header)
                } else {
                    let partial = (actual - header) % entry;
                    (partial != 0).then(|| actual + entry - partial)
                }
            }
        };

        match expected {
            Some(expected) => Err(PayloadError::InvalidPayloadLength {
                kind,
                expected,
                actual,
            }),
            None => Ok(()),
        }
    }
}

struct Route {
    opcode: Opcode,
    kind: NotificationKind,
    length: LengthRule,
    decode: Decoder,
}

/// Every notification layout the plug is known to send
static ROUTES: [Route; 24] = [
    Route {
        opcode: Opcode::selected(&[0x17, 0x00], 3, 0x00),
        kind: NotificationKind::Authorization,
        length: LengthRule::Exact(5),
        decode: |p, _| {
            Ok(Notification::Authorization {
                was_successful: p[2] == 0x00,
            })
        },
    },
    Route {
        opcode: Opcode::selected(&[0x17, 0x00], 3, 0x01),
        kind: NotificationKind::ChangePin,
        length: LengthRule::Exact(5),
        decode: |p, _| {
            Ok(Notification::ChangePin {
                was_successful: p[2] == 0x00,
            })
        },
    },
    Route {
        opcode: Opcode::selected(&[0x17, 0x00], 3, 0x02),
        kind: NotificationKind::ResetPin,
        length: LengthRule::Exact(5),
        decode: |p, _| {
            Ok(Notification::ResetPin {
                was_successful: p[2] == 0x00,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x03, 0x00]),
        kind: NotificationKind::PowerSwitch,
        length: LengthRule::Exact(3),
        decode: |p, _| {
            Ok(Notification::PowerSwitch {
                was_successful: p[2] == 0x00,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x0F, 0x00, 0x05]),
        kind: NotificationKind::LedSwitch,
        length: LengthRule::Exact(4),
        decode: |_, _| {
            Ok(Notification::LedSwitch {
                was_successful: true,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x01, 0x00]),
        kind: NotificationKind::SynchronizeDateAndTime,
        length: LengthRule::Exact(3),
        decode: |p, _| {
            Ok(Notification::SynchronizeDateAndTime {
                was_successful: p[2] == 0x00,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x10, 0x00]),
        kind: NotificationKind::RequestedSettings,
        length: LengthRule::Exact(13),
        decode: decode_settings,
    },
    Route {
        opcode: Opcode::prefix(&[0x05, 0x00, 0x00]),
        kind: NotificationKind::PowerLimitSet,
        length: LengthRule::Exact(3),
        decode: |_, _| {
            Ok(Notification::PowerLimitSet {
                was_successful: true,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x0F, 0x00, 0x04]),
        kind: NotificationKind::PricesSet,
        length: LengthRule::Exact(4),
        decode: |_, _| {
            Ok(Notification::PricesSet {
                was_successful: true,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x0F, 0x00, 0x01]),
        kind: NotificationKind::ReducedPeriodSet,
        length: LengthRule::Exact(4),
        decode: |_, _| {
            Ok(Notification::ReducedPeriodSet {
                was_successful: true,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x09, 0x00]),
        kind: NotificationKind::RequestedTimerStatus,
        length: LengthRule::Exact(13),
        decode: decode_timer_status,
    },
    Route {
        opcode: Opcode::prefix(&[0x08, 0x00]),
        kind: NotificationKind::TimerSet,
        length: LengthRule::Exact(3),
        decode: |_, _| {
            Ok(Notification::TimerSet {
                was_successful: true,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x14, 0x00]),
        kind: NotificationKind::SchedulerRequested,
        length: LengthRule::Entries {
            header: 3,
            entry: SCHEDULER_ENTRY_SIZE,
        },
        decode: decode_scheduler_page,
    },
    Route {
        opcode: Opcode::prefix(&[0x13, 0x00]),
        kind: NotificationKind::SchedulerSet,
        length: LengthRule::AtLeast(3),
        decode: |p, _| {
            Ok(Notification::SchedulerSet {
                was_successful: p[2] == 0x00,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x16, 0x00]),
        kind: NotificationKind::RandomModeStatusRequested,
        length: LengthRule::AtLeast(8),
        decode: decode_random_mode,
    },
    Route {
        opcode: Opcode::prefix(&[0x15, 0x00]),
        kind: NotificationKind::RandomModeSet,
        length: LengthRule::AtLeast(3),
        decode: |p, _| {
            Ok(Notification::RandomModeSet {
                was_successful: p[2] == 0x00,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x04, 0x00]),
        kind: NotificationKind::MeasurementRequested,
        length: LengthRule::AtLeast(16),
        decode: decode_measurement,
    },
    Route {
        opcode: Opcode::prefix(&[0x0C, 0x00]),
        kind: NotificationKind::ConsumptionOfLast12Months,
        length: LengthRule::AtLeast(2),
        // the still accumulating month is never reported
        decode: |p, _| {
            Ok(Notification::ConsumptionOfLast12Months(
                iter::once(None).chain(consumption_slots(&p[2..], 4, 3)).collect(),
            ))
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x0B, 0x00]),
        kind: NotificationKind::ConsumptionOfLast30Days,
        length: LengthRule::AtLeast(2),
        decode: |p, _| {
            Ok(Notification::ConsumptionOfLast30Days(
                iter::once(None).chain(consumption_slots(&p[2..], 4, 3)).collect(),
            ))
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x0A, 0x00]),
        kind: NotificationKind::ConsumptionOfLast23Hours,
        length: LengthRule::AtLeast(2),
        decode: |p, _| {
            Ok(Notification::ConsumptionOfLast23Hours(
                consumption_slots(&p[2..], 2, 2).collect(),
            ))
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x0F, 0x00, 0x02]),
        kind: NotificationKind::ResetConsumption,
        length: LengthRule::AtLeast(3),
        decode: |_, _| {
            Ok(Notification::ResetConsumption {
                was_successful: true,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x0F, 0x00, 0x00]),
        kind: NotificationKind::FactoryReset,
        length: LengthRule::AtLeast(3),
        decode: |_, _| {
            Ok(Notification::FactoryReset {
                was_successful: true,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x02, 0x00]),
        kind: NotificationKind::DeviceNameSet,
        length: LengthRule::AtLeast(2),
        decode: |_, _| {
            Ok(Notification::DeviceNameSet {
                was_successful: true,
            })
        },
    },
    Route {
        opcode: Opcode::prefix(&[0x11, 0x00]),
        kind: NotificationKind::DeviceSerialRequested,
        length: LengthRule::AtLeast(4),
        decode: decode_serial,
    },
];

fn route_for(payload: &[u8]) -> Option<&'static Route> {
    ROUTES
        .iter()
        .filter(|route| route.opcode.matches(payload))
        .max_by_key(|route| route.opcode.specificity())
}

/// Big-endian unsigned integer of up to four bytes
fn be_u32(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

fn decode_settings(p: &[u8], _: &DecodeContext) -> Result<Notification, PayloadError> {
    let mut buf = &p[2..];

    let is_reduced_period = buf.get_u8() == 0x01;
    let normal_price_in_cent = buf.get_u8();
    let reduced_period_price_in_cent = buf.get_u8();
    let reduced_period_start_time_in_minutes = buf.get_u16();
    let reduced_period_end_time_in_minutes = buf.get_u16();
    let is_led_active = buf.get_u8() == 0x01;
    buf.advance(1);
    let power_limit_in_watt = buf.get_u16();

    Ok(Notification::RequestedSettings(Settings {
        is_reduced_period,
        normal_price_in_cent,
        reduced_period_price_in_cent,
        reduced_period_start_time_in_minutes,
        reduced_period_end_time_in_minutes,
        is_led_active,
        power_limit_in_watt,
    }))
}

fn decode_timer_status(p: &[u8], _: &DecodeContext) -> Result<Notification, PayloadError> {
    // 0x01 counts down to "on", 0x00 is idle, anything else counts down to "off"
    let (is_timer_running, is_action_turn_on) = match p[2] {
        0x01 => (true, true),
        0x00 => (false, false),
        _ => (true, false),
    };

    Ok(Notification::RequestedTimerStatus(TimerStatus {
        is_timer_running,
        is_action_turn_on,
        target_second: p[3],
        target_minute: p[4],
        target_hour: p[5],
        target_day: p[6],
        target_month: p[7],
        target_year: p[8],
        original_timer_length_in_seconds: be_u32(&p[9..12]),
    }))
}

fn decode_scheduler_page(p: &[u8], ctx: &DecodeContext) -> Result<Notification, PayloadError> {
    let entries = p[3..]
        .chunks_exact(SCHEDULER_ENTRY_SIZE)
        .map(|entry| decode_scheduler_entry(entry, ctx.century))
        .collect();

    Ok(Notification::SchedulerRequested(SchedulerList {
        number_of_schedulers: p[2],
        entries,
    }))
}

/// One page entry: slot, 8 scheduler bytes, 2 reserved bytes, checksum
fn decode_scheduler_entry(entry: &[u8], century: u16) -> SchedulerEntry {
    let slot_id = entry[0];
    let received = entry[11];
    let computed = entry[1..11]
        .iter()
        .fold(0x14u8, |acc, b| acc.wrapping_add(*b));

    // The entry checksum formula is not confirmed, so a mismatch is only reported.
    if received != computed {
        warn!(
            slot_id,
            computed, received, "Invalid checksum for scheduler entry"
        );
    }

    SchedulerEntry {
        slot_id,
        scheduler: decode_scheduler(&entry[1..9], century),
    }
}

fn decode_scheduler(data: &[u8], century: u16) -> Scheduler {
    Scheduler {
        is_active: data[0] == 0x01,
        is_action_turn_on: data[1] == 0x01,
        repeat_on_weekdays: Weekdays::from_mask(data[2]),
        year: century + u16::from(data[3]),
        month: data[4],
        day: data[5],
        hour: data[6],
        minute: data[7],
    }
}

fn decode_random_mode(p: &[u8], _: &DecodeContext) -> Result<Notification, PayloadError> {
    Ok(Notification::RandomModeStatusRequested(RandomMode {
        is_active: p[2] == 0x01,
        active_on_weekdays: Weekdays::from_mask(p[3]),
        start_hour: p[4],
        start_minute: p[5],
        end_hour: p[6],
        end_minute: p[7],
    }))
}

fn decode_measurement(p: &[u8], _: &DecodeContext) -> Result<Notification, PayloadError> {
    let mut buf = &p[2..];

    let is_power_active = buf.get_u8() == 0x01;
    let power_in_milliwatt = be_u32(&buf[..3]);
    buf.advance(3);
    let voltage_in_volt = buf.get_u8();
    let current_in_milliampere = buf.get_u16();
    let frequency_in_hertz = buf.get_u8();
    buf.advance(2);
    let total_consumption_in_kilowatt_hour = buf.get_u32();

    Ok(Notification::MeasurementRequested(Measurement {
        is_power_active,
        power_in_milliwatt,
        voltage_in_volt,
        current_in_milliampere,
        frequency_in_hertz,
        total_consumption_in_kilowatt_hour,
    }))
}

/// Consumption slots in reverse transmission order; a trailing partial slot is ignored
fn consumption_slots(
    data: &[u8],
    slot_size: usize,
    value_size: usize,
) -> impl Iterator<Item = Option<u32>> + '_ {
    data.chunks_exact(slot_size)
        .rev()
        .map(move |slot| Some(be_u32(&slot[..value_size])))
}

fn decode_serial(p: &[u8], _: &DecodeContext) -> Result<Notification, PayloadError> {
    let serial = std::str::from_utf8(&p[2..p.len() - 2]).map_err(|_| PayloadError::InvalidText {
        kind: NotificationKind::DeviceSerialRequested,
    })?;

    Ok(Notification::DeviceSerialRequested {
        serial: serial.to_string(),
    })
}
